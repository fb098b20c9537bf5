//! Runtime settings.
//!
//! There is no configuration file: the daemon is configured from its command
//! line, and the pacing/lifecycle constants below are compiled-in defaults.
//! Everything lives in one `Settings` struct so that tests can shrink the
//! timeouts to milliseconds.

use crate::util;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// The default ingress TCP port.
pub const INGRESS_PORT: u16 = 6659;

/// Settings for the whole daemon.
///
/// The durations emulate the common "1 message per second, burst of 4" IRC
/// flood threshold and the usual lifetime expectations of IRC servers; they
/// are deliberately conservative.  All of them can be overridden before the
/// daemon starts, none of them at runtime.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Nick used on servers when the target URL does not override it.
    pub nick: String,

    /// Ingress bind address, loopback by default.
    pub bind: SocketAddr,

    /// Optional UNIX-domain ingress path.
    pub socket_path: Option<PathBuf>,

    /// Per-channel send queue capacity, in lines.
    pub queue_max: usize,

    /// How many messages may go out back-to-back before pacing kicks in.
    pub burst: u32,

    /// Minimum inter-message gap per channel once the burst is spent.
    pub flood_gap: Duration,

    /// Idle time after which a channel session parts and is dropped.
    pub channel_ttl: Duration,

    /// Grace period before a channel-less server session quits.
    pub server_ttl: Duration,

    /// Silence on a connection before the daemon sends its own PING.
    pub ping_interval: Duration,

    /// Time to wait for PONG (or any traffic) before forcing a disconnect.
    pub ping_timeout: Duration,

    /// Registration must produce 001 or a nick error within this bound.
    pub handshake_ttl: Duration,

    /// TCP/TLS connection establishment bound.
    pub connect_timeout: Duration,

    /// First reconnect delay; doubles per attempt up to `backoff_cap`.
    pub backoff_base: Duration,

    /// Ceiling on the reconnect delay.
    pub backoff_cap: Duration,

    /// Consecutive failed connects after which the server key is evicted.
    pub max_reconnects: u32,

    /// How long a READY stretch must last for the attempt counter to reset.
    pub backoff_reset: Duration,

    /// Fallback per-connection channel budget, until 005 says otherwise.
    pub channel_max: usize,

    /// Bound on the drain time when shutting down.
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nick: util::default_nick(),
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), INGRESS_PORT),
            socket_path: None,
            queue_max: 128,
            burst: 4,
            flood_gap: Duration::from_secs(1),
            channel_ttl: Duration::from_secs(240),
            server_ttl: Duration::from_secs(120),
            ping_interval: Duration::from_secs(180),
            ping_timeout: Duration::from_secs(60),
            handshake_ttl: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(30 * 60),
            max_reconnects: 12,
            backoff_reset: Duration::from_secs(60),
            channel_max: 18,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
