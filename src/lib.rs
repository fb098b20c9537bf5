//! irked, a submit-only IRC relay daemon.
//!
//! Producers (version-control hooks, build bots, monitoring jobs) fire JSON
//! requests of the form `{"to": <irc-url>, "privmsg": <text>}` at a local
//! socket and hang up; irked keeps the IRC sessions, joins channels on
//! demand, paces messages under the flood threshold and quietly parts again
//! when the traffic dries up.
//!
//! # Usage
//!
//! During development: `cargo run -- -d 2`
//!
//! Then, from a shell:
//!
//! ```console
//! printf '{"to":"irc://irc.example.net/commits","privmsg":"hello"}' | nc -q1 localhost 6659
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, rust_2018_idioms)]

pub use crate::config::Settings;
pub use crate::dispatch::Relay;

mod channel;
pub mod config;
pub mod dispatch;
mod lines;
pub mod net;
mod server;
pub mod target;
mod util;

#[cfg(test)]
mod test;

use std::process;
use tokio::net::TcpListener;

/// The beginning of everything: builds the runtime and runs the daemon
/// until a termination signal arrives.
pub fn start(settings: Settings) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|err| {
            log::error!("Failed to start the tokio runtime: {}", err);
            process::exit(1);
        });
    runtime.block_on(run(settings));
}

/// Binds the ingress, serves until SIGINT/SIGTERM, then drains within the
/// shutdown grace.
pub async fn run(settings: Settings) {
    let listener = TcpListener::bind(settings.bind).await.unwrap_or_else(|err| {
        log::error!("Failed to bind to {}: {}", settings.bind, err);
        process::exit(1);
    });
    log::info!("Listening on {} for notification requests...", settings.bind);

    let socket_path = settings.socket_path.clone();
    let relay = Relay::new(settings);
    tokio::spawn(net::listen(listener, relay.clone()));

    if let Some(path) = socket_path {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path).unwrap_or_else(|err| {
                log::error!("Failed to bind to {}: {}", path.display(), err);
                process::exit(1);
            });
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660));
            log::info!("Listening on {} for notification requests...", path.display());
            tokio::spawn(net::listen_unix(listener, relay.clone()));
        }
        #[cfg(not(unix))]
        {
            log::error!("UNIX-domain sockets are not available here, ignoring {}", path.display());
        }
    }

    wait_for_signal().await;
    log::info!("Shutting down");
    relay.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).unwrap_or_else(|err| {
        log::error!("Cannot listen for termination signals: {}", err);
        process::exit(1);
    });
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
