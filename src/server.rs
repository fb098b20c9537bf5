//! Server sessions: one connection, its channels, and its lifecycle.
//!
//! A server session owns the TCP (or TLS) connection to one IRC server under
//! one nick, the registration and liveness state machines, and the set of
//! channel sessions multiplexed over the connection.  Per live connection it
//! runs exactly two I/O tasks: a *reader* that turns the socket into parsed
//! line events, and a *writer* that drains the per-server outbound queue.
//! The outbound queue itself outlives connections, so channel pacers keep a
//! stable handle across reconnects.
//!
//! Lifecycle: `DISCONNECTED → CONNECTING → REGISTERING → READY → CLOSING`,
//! looping through CLOSING → CONNECTING with exponential backoff while there
//! is queued work, and ending for good on eviction, shutdown, or too many
//! consecutive connection failures.

use crate::channel::{self, ChannelEvent, ChannelQueue, DenyReason, JoinState, Pushed};
use crate::config::Settings;
use crate::dispatch::{Relay, Submission};
use crate::target::ServerKey;
use crate::{lines, util};
use irked_tokens::{line, rpl, Buffer, Command, Message};
use std::collections::HashMap;
use std::convert::TryFrom as _;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_rustls::TlsConnector;

/// Placeholder deadline for timers that are currently disarmed.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 3600)
}

/// What the reader (or a failing writer) reports back to the session.
enum Event {
    Line(String),
    Closed(Option<io::Error>),
}

/// Why a connection stopped being usable.
#[derive(Clone, Copy)]
enum Close {
    /// Socket died, server said ERROR, handshake failed, or liveness gave
    /// up.  The session decides whether to reconnect.
    Disconnected,
    /// The channel-less grace period elapsed; the session quit gracefully.
    Expired,
    Shutdown,
    /// The dispatcher dropped its handle to this session.
    Detached,
}

/// Why the session ended.
enum End {
    Expired,
    Fatal,
    Shutdown,
    Detached,
}

/// Outcome of waiting, disconnected, for something to do.
enum Waited {
    Work,
    Expired,
    Shutdown,
    Detached,
}

/// A channel session as seen from its server session.
struct Channel {
    queue: Arc<ChannelQueue>,
    joined: watch::Sender<JoinState>,
}

/// Runs a server session to completion.  Spawned by the dispatcher, which
/// keeps `handle` in its map; `handle` doubles as the identity under which
/// the session unregisters itself.
pub(crate) async fn run(
    key: ServerKey,
    settings: Arc<Settings>,
    relay: Relay,
    handle: mpsc::UnboundedSender<Submission>,
    mut submissions: mpsc::UnboundedReceiver<Submission>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (chan_tx, mut chan_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (ready_tx, _) = watch::channel(false);

    let mut session = Session {
        nick: key.nick.clone(),
        key,
        settings,
        channels: HashMap::new(),
        chan_tx,
        outbound_tx,
        ready_tx,
        nick_trial: None,
        channel_limit: None,
        empty_since: Some(Instant::now()),
        dropped: 0,
    };
    let mut outbound_slot = Some(outbound_rx);

    let end = session
        .serve(&mut submissions, &mut chan_rx, &mut outbound_slot, &mut shutdown)
        .await;

    let mut dropped = session.dropped;
    for (_, ch) in session.channels.drain() {
        dropped += ch.queue.close() as u64;
    }
    relay.forget(&session.key, &handle).await;

    match end {
        End::Expired => log::info!("{}: session expired", session.key),
        End::Fatal => log::error!(
            "{}: giving up after {} consecutive connection failures",
            session.key,
            session.settings.max_reconnects,
        ),
        End::Shutdown | End::Detached => {}
    }
    if dropped > 0 {
        log::info!("{}: {} line(s) were never delivered", session.key, dropped);
    }
}

struct Session {
    key: ServerKey,
    settings: Arc<Settings>,
    channels: HashMap<String, Channel>,
    chan_tx: mpsc::UnboundedSender<ChannelEvent>,
    outbound_tx: mpsc::UnboundedSender<String>,
    ready_tx: watch::Sender<bool>,
    nick: String,
    nick_trial: Option<u32>,
    channel_limit: Option<usize>,
    empty_since: Option<Instant>,
    dropped: u64,
}

impl Session {
    async fn serve(
        &mut self,
        submissions: &mut mpsc::UnboundedReceiver<Submission>,
        chan_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        outbound_slot: &mut Option<mpsc::UnboundedReceiver<String>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> End {
        let mut attempts: u32 = 0;
        loop {
            // DISCONNECTED: with nothing queued, sit still until a producer
            // shows up again or every channel idles out.
            if !self.queued_work() {
                match self.wait_for_work(submissions, chan_rx, shutdown).await {
                    Waited::Work => {}
                    Waited::Expired => return End::Expired,
                    Waited::Shutdown => return End::Shutdown,
                    Waited::Detached => return End::Detached,
                }
            }

            if attempts > 0 {
                let delay = util::jitter(backoff_delay(
                    attempts,
                    self.settings.backoff_base,
                    self.settings.backoff_cap,
                ));
                log::info!(
                    "{}: retrying in {:?} (attempt {})",
                    self.key,
                    delay,
                    attempts + 1,
                );
                if let Some(end) = self.pause(submissions, chan_rx, shutdown, delay).await {
                    return end;
                }
            }

            // CONNECTING
            let conn = match self.connect().await {
                Ok(conn) => conn,
                Err(err) => {
                    log::info!("{}: connection failed: {}", self.key, err);
                    attempts += 1;
                    if attempts >= self.settings.max_reconnects {
                        return End::Fatal;
                    }
                    continue;
                }
            };

            let mut outbound_rx = outbound_slot.take().expect("outbound queue is parked");
            // Lines handed to the previous writer but never shipped are
            // casualties of the disconnect; a fresh connection must open
            // with NICK.
            while let Ok(_stale) = outbound_rx.try_recv() {
                self.dropped += 1;
            }

            let label = self.key.to_string();
            let mut io = match conn {
                Conn::Plain(stream) => Io::start(stream, outbound_rx, label, self.settings.ping_timeout),
                Conn::Tls(stream) => Io::start(stream, outbound_rx, label, self.settings.ping_timeout),
            };

            // REGISTERING
            let outcome = match self.register(&mut io, submissions, chan_rx, shutdown).await {
                Ok(()) => {
                    log::info!("{}: registered as {}", self.key, self.nick);
                    self.ready_tx.send_replace(true);
                    let ready_since = Instant::now();
                    let outcome = self.ready_loop(&mut io, submissions, chan_rx, shutdown).await;
                    if ready_since.elapsed() >= self.settings.backoff_reset {
                        attempts = 0;
                    }
                    outcome
                }
                Err(close) => close,
            };

            // CLOSING
            match outcome {
                Close::Expired => self.quit(lines::QUIT_IDLE),
                Close::Shutdown => self.quit(lines::QUIT_SHUTDOWN),
                Close::Disconnected | Close::Detached => {}
            }
            self.ready_tx.send_replace(false);
            for ch in self.channels.values() {
                ch.joined.send_replace(JoinState::NotJoined);
            }
            match io.stop().await {
                Some(rx) => *outbound_slot = Some(rx),
                None => {
                    log::error!("{}: writer task did not come back; aborting session", self.key);
                    return End::Fatal;
                }
            }

            match outcome {
                Close::Expired => return End::Expired,
                Close::Shutdown => return End::Shutdown,
                Close::Detached => return End::Detached,
                Close::Disconnected => {
                    attempts += 1;
                    if attempts >= self.settings.max_reconnects {
                        return End::Fatal;
                    }
                }
            }
        }
    }

    /// Opens the TCP (and TLS) stream, bounded by the connect timeout.
    async fn connect(&self) -> io::Result<Conn> {
        let addr = (self.key.host.as_str(), self.key.port);
        let stream = time::timeout(self.settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        if !self.key.tls {
            return Ok(Conn::Plain(stream));
        }
        let name = tokio_rustls::rustls::ServerName::try_from(self.key.host.as_str())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid TLS server name"))?;
        let tls = time::timeout(self.settings.connect_timeout, tls_connector().connect(name, stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
        Ok(Conn::Tls(tls))
    }

    /// Sends NICK/USER and waits for 001, mutating the nick on collisions.
    async fn register(
        &mut self,
        io: &mut Io,
        submissions: &mut mpsc::UnboundedReceiver<Submission>,
        chan_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Close> {
        self.nick = self.key.nick.clone();
        self.nick_trial = None;

        let mut buf = Buffer::new();
        buf.message(Command::Nick).param(&self.nick);
        buf.message(Command::User)
            .param(&self.key.nick)
            .param("0")
            .param("*")
            .trailing_param(lines::REALNAME);
        let _ = self.outbound_tx.send(buf.build());

        let deadline = Instant::now() + self.settings.handshake_ttl;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    log::info!("{}: handshake timed out", self.key);
                    return Err(Close::Disconnected);
                }
                ev = io.events.recv() => match ev {
                    Some(Event::Line(raw)) => {
                        if self.registering_line(&raw)? {
                            return Ok(());
                        }
                    }
                    Some(Event::Closed(err)) => {
                        log_closed(&self.key, err);
                        return Err(Close::Disconnected);
                    }
                    None => return Err(Close::Disconnected),
                },
                sub = submissions.recv() => match sub {
                    Some(sub) => self.accept(sub),
                    None => return Err(Close::Detached),
                },
                ev = chan_rx.recv() => self.channel_gone(ev),
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Err(Close::Shutdown);
                    }
                }
            }
        }
    }

    /// One line received while REGISTERING.  `Ok(true)` means 001 arrived.
    fn registering_line(&mut self, raw: &str) -> Result<bool, Close> {
        log::trace!("{} <- {}", self.key, raw);
        let msg = match Message::parse(raw) {
            Some(msg) => msg,
            None => return Ok(false),
        };
        match msg.command {
            Err(rpl::WELCOME) => {
                if let Some(ref password) = self.key.password {
                    let identify = format!("identify {}", password);
                    let _ = self
                        .outbound_tx
                        .send(line(Command::PrivMsg, &["nickserv"], &identify));
                }
                Ok(true)
            }
            Err(rpl::ERR_ERRONEUSNICKNAME)
            | Err(rpl::ERR_NICKNAMEINUSE)
            | Err(rpl::ERR_NICKCOLLISION)
            | Err(rpl::ERR_UNAVAILRESOURCE) => {
                self.bump_nick();
                log::debug!("{}: nick rejected, trying {}", self.key, self.nick);
                let mut buf = Buffer::new();
                buf.message(Command::Nick).param(&self.nick);
                let _ = self.outbound_tx.send(buf.build());
                Ok(false)
            }
            Ok(Command::Ping) => {
                let _ = self.outbound_tx.send(line(Command::Pong, &[], msg.params[0]));
                Ok(false)
            }
            Ok(Command::Error) => {
                log::info!("{}: server error: {}", self.key, msg.params[0]);
                Err(Close::Disconnected)
            }
            _ => Ok(false),
        }
    }

    /// The REGISTERING nick fallback: first collision picks a random numeric
    /// suffix, later ones advance it by a random step, so parallel daemons
    /// cannot chase each other through the same sequence.
    fn bump_nick(&mut self) {
        let trial = match self.nick_trial {
            None => util::rand_range(1, 999),
            Some(trial) => trial + util::rand_range(1, 3),
        };
        self.nick_trial = Some(trial);
        self.nick = format!("{}{}", self.key.nick, trial);
    }

    /// The READY state: demultiplexes server traffic, submissions, channel
    /// lifecycle and the liveness/idle timers.
    async fn ready_loop(
        &mut self,
        io: &mut Io,
        submissions: &mut mpsc::UnboundedReceiver<Submission>,
        chan_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Close {
        let mut last_traffic = Instant::now();
        let mut ping_sent: Option<Instant> = None;

        loop {
            let liveness_deadline = match ping_sent {
                Some(at) => at + self.settings.ping_timeout,
                None => last_traffic + self.settings.ping_interval,
            };
            let idle_deadline = self
                .empty_since
                .map_or_else(far_future, |at| at + self.settings.server_ttl);

            tokio::select! {
                ev = io.events.recv() => match ev {
                    Some(Event::Line(raw)) => {
                        last_traffic = Instant::now();
                        ping_sent = None;
                        if self.ready_line(&raw) {
                            return Close::Disconnected;
                        }
                    }
                    Some(Event::Closed(err)) => {
                        log_closed(&self.key, err);
                        return Close::Disconnected;
                    }
                    None => return Close::Disconnected,
                },
                sub = submissions.recv() => match sub {
                    Some(sub) => self.accept(sub),
                    None => return Close::Detached,
                },
                ev = chan_rx.recv() => self.channel_gone(ev),
                _ = time::sleep_until(liveness_deadline) => {
                    if ping_sent.is_some() {
                        log::info!("{}: ping timeout", self.key);
                        return Close::Disconnected;
                    }
                    let _ = self
                        .outbound_tx
                        .send(line(Command::Ping, &[], &util::ping_token()));
                    ping_sent = Some(Instant::now());
                }
                _ = time::sleep_until(idle_deadline), if self.channels.is_empty() => {
                    return Close::Expired;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Close::Shutdown;
                    }
                }
            }
        }
    }

    /// One line received while READY.  Returns true to force a disconnect.
    fn ready_line(&mut self, raw: &str) -> bool {
        log::trace!("{} <- {}", self.key, raw);
        let msg = match Message::parse(raw) {
            Some(msg) => msg,
            None => return false,
        };
        match msg.command {
            Ok(Command::Ping) => {
                let _ = self.outbound_tx.send(line(Command::Pong, &[], msg.params[0]));
            }
            Ok(Command::Error) => {
                log::info!("{}: server error: {}", self.key, msg.params[0]);
                return true;
            }
            Ok(Command::Join) => {
                if self.is_me(msg.prefix_nick()) {
                    self.set_joined(msg.params[0], JoinState::Joined);
                }
            }
            Ok(Command::Part) => {
                if self.is_me(msg.prefix_nick()) {
                    self.set_joined(msg.params[0], JoinState::NotJoined);
                }
            }
            Ok(Command::Kick) => {
                if msg.num_params >= 2 && msg.params[1].eq_ignore_ascii_case(&self.nick) {
                    log::info!("{}: kicked from {}", self.key, msg.params[0]);
                    self.set_joined(msg.params[0], JoinState::NotJoined);
                }
            }
            Err(rpl::ISUPPORT) => self.handle_isupport(&msg),
            Err(rpl::ERR_NOSUCHCHANNEL) => self.deny(&msg, DenyReason::NoSuchChannel),
            Err(rpl::ERR_UNAVAILRESOURCE) => self.deny(&msg, DenyReason::Unavailable),
            Err(rpl::ERR_CHANNELISFULL) => self.deny(&msg, DenyReason::Full),
            Err(rpl::ERR_INVITEONLYCHAN) => self.deny(&msg, DenyReason::InviteOnly),
            Err(rpl::ERR_BANNEDFROMCHAN) => self.deny(&msg, DenyReason::Banned),
            Err(rpl::ERR_BADCHANKEY) => self.deny(&msg, DenyReason::BadKey),
            _ => {}
        }
        false
    }

    /// Reads CHANLIMIT/MAXCHANNELS out of 005 to size the channel budget.
    fn handle_isupport(&mut self, msg: &Message<'_>) {
        if msg.num_params < 2 {
            return;
        }
        for param in &msg.params[1..msg.num_params] {
            if let Some(limits) = param.strip_prefix("CHANLIMIT=") {
                let limit = limits
                    .split(',')
                    .filter_map(|tok| tok.splitn(2, ':').nth(1))
                    .filter_map(|n| n.parse::<usize>().ok())
                    .min();
                if let Some(limit) = limit {
                    log::debug!("{}: channel limit is {}", self.key, limit);
                    self.channel_limit = Some(limit);
                }
            } else if let Some(n) = param.strip_prefix("MAXCHANNELS=") {
                if let Ok(limit) = n.parse::<usize>() {
                    log::debug!("{}: channel limit is {}", self.key, limit);
                    self.channel_limit = Some(limit);
                }
            }
        }
    }

    fn is_me(&self, nick: Option<&str>) -> bool {
        nick.map_or(false, |n| n.eq_ignore_ascii_case(&self.nick))
    }

    fn set_joined(&self, name: &str, state: JoinState) {
        let name = name.to_ascii_lowercase();
        if let Some(ch) = self.channels.get(&name) {
            ch.joined.send_replace(state);
        }
    }

    /// Handles a join rejection: tears the channel session down right away,
    /// so that later submissions re-create it instead of landing on a queue
    /// that is about to be flushed.
    fn deny(&mut self, msg: &Message<'_>, reason: DenyReason) {
        // numerics carry our nick first, then the channel
        if msg.num_params < 2 {
            return;
        }
        let name = msg.params[1].to_ascii_lowercase();
        if let Some(ch) = self.channels.get(&name) {
            ch.joined.send_replace(JoinState::Denied(reason));
            let flushed = ch.queue.close();
            self.dropped += flushed as u64;
            log::info!(
                "{}: cannot join {}: {}; dropped {} queued line(s)",
                self.key,
                name,
                reason.as_str(),
                flushed,
            );
            self.channels.remove(&name);
            if self.channels.is_empty() && self.empty_since.is_none() {
                self.empty_since = Some(Instant::now());
            }
        }
    }

    /// Queues one line on its channel session, creating the session on
    /// demand.  Never blocks.
    fn accept(&mut self, sub: Submission) {
        let Submission { channel: name, key, line: text } = sub;
        let mut text = text;
        loop {
            if let Some(ch) = self.channels.get(&name) {
                match ch.queue.push(text) {
                    Ok(Pushed::Queued) => return,
                    Ok(Pushed::DroppedOldest(total)) => {
                        self.dropped += 1;
                        if total.is_power_of_two() {
                            log::info!(
                                "{}: queue for {} overflowed, {} line(s) dropped so far",
                                self.key,
                                name,
                                total,
                            );
                        }
                        return;
                    }
                    Err(returned) => {
                        // the pacer is tearing this session down; replace it
                        text = returned;
                        self.channels.remove(&name);
                    }
                }
            } else {
                let budget = self.channel_limit.unwrap_or(self.settings.channel_max);
                if self.channels.len() >= budget && !self.scavenge() {
                    self.dropped += 1;
                    log::info!(
                        "{}: out of channel slots, dropping a line for {}",
                        self.key,
                        name,
                    );
                    return;
                }
                self.spawn_channel(&name, key.clone());
            }
        }
    }

    /// Frees a channel slot by closing the longest-idle drained channel.
    fn scavenge(&mut self) -> bool {
        let oldest = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.queue.is_empty())
            .min_by_key(|(_, ch)| ch.queue.last_activity())
            .map(|(name, _)| name.clone());
        if let Some(name) = oldest {
            if let Some(ch) = self.channels.get(&name) {
                if ch.queue.close_if_empty() {
                    log::info!("{}: scavenging {} to make room", self.key, name);
                    self.channels.remove(&name);
                    return true;
                }
            }
        }
        false
    }

    fn spawn_channel(&mut self, name: &str, key: Option<String>) {
        log::info!("{}: opening channel session for {}", self.key, name);
        let queue = Arc::new(ChannelQueue::new(self.settings.queue_max));
        let (joined_tx, joined_rx) = watch::channel(JoinState::NotJoined);
        tokio::spawn(channel::run(channel::Ctx {
            name: name.to_owned(),
            key,
            server: self.key.to_string(),
            queue: queue.clone(),
            outbound: self.outbound_tx.clone(),
            ready: self.ready_tx.subscribe(),
            joined: joined_rx,
            events: self.chan_tx.clone(),
            settings: self.settings.clone(),
        }));
        self.channels.insert(
            name.to_owned(),
            Channel {
                queue,
                joined: joined_tx,
            },
        );
        self.empty_since = None;
    }

    /// Handles a pacer announcing its own end.
    ///
    /// The entry is only removed when the mapped queue is actually closed: a
    /// submission racing the eviction may already have re-created the channel
    /// under the same name.
    fn channel_gone(&mut self, ev: Option<ChannelEvent>) {
        if let Some(ChannelEvent::Gone { name }) = ev {
            let dead = self
                .channels
                .get(&name)
                .map_or(false, |ch| ch.queue.is_dead());
            if dead {
                self.channels.remove(&name);
            }
            if self.channels.is_empty() && self.empty_since.is_none() {
                self.empty_since = Some(Instant::now());
            }
        }
    }

    fn queued_work(&self) -> bool {
        self.channels.values().any(|ch| !ch.queue.is_empty())
    }

    /// DISCONNECTED with nothing to send: accept submissions, let channels
    /// idle out, expire once the last one is gone for `server_ttl`.
    async fn wait_for_work(
        &mut self,
        submissions: &mut mpsc::UnboundedReceiver<Submission>,
        chan_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Waited {
        loop {
            let idle_deadline = self
                .empty_since
                .map_or_else(far_future, |at| at + self.settings.server_ttl);
            tokio::select! {
                sub = submissions.recv() => match sub {
                    Some(sub) => {
                        self.accept(sub);
                        return Waited::Work;
                    }
                    None => return Waited::Detached,
                },
                ev = chan_rx.recv() => self.channel_gone(ev),
                _ = time::sleep_until(idle_deadline), if self.channels.is_empty() => {
                    return Waited::Expired;
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Waited::Shutdown;
                    }
                }
            }
        }
    }

    /// Backoff sleep that keeps accepting submissions.
    async fn pause(
        &mut self,
        submissions: &mut mpsc::UnboundedReceiver<Submission>,
        chan_rx: &mut mpsc::UnboundedReceiver<ChannelEvent>,
        shutdown: &mut watch::Receiver<bool>,
        delay: Duration,
    ) -> Option<End> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => return None,
                sub = submissions.recv() => match sub {
                    Some(sub) => self.accept(sub),
                    None => return Some(End::Detached),
                },
                ev = chan_rx.recv() => self.channel_gone(ev),
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Some(End::Shutdown);
                    }
                }
            }
        }
    }

    fn quit(&self, reason: &str) {
        let _ = self.outbound_tx.send(line(Command::Quit, &[], reason));
    }
}

fn log_closed(key: &ServerKey, err: Option<io::Error>) {
    match err {
        Some(err) => log::info!("{}: connection lost: {}", key, err),
        None => log::info!("{}: connection closed by server", key),
    }
}

/// Reconnect delay before jitter: `min(cap, base * 2^(attempt - 1))`.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    debug_assert!(attempt >= 1);
    if attempt >= 32 {
        return cap;
    }
    cap.min(base.saturating_mul(1 << (attempt - 1)))
}

enum Conn {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

/// Strict client-side TLS configuration over the bundled web roots.
fn tls_connector() -> TlsConnector {
    use tokio_rustls::rustls::{ClientConfig, OwnedTrustAnchor, RootCertStore};

    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// The two I/O tasks of one live connection.
struct Io {
    events: mpsc::UnboundedReceiver<Event>,
    writer: JoinHandle<mpsc::UnboundedReceiver<String>>,
    reader: JoinHandle<()>,
    quit: Arc<Notify>,
    reclaim_grace: Duration,
}

impl Io {
    fn start<S>(
        stream: S,
        outbound: mpsc::UnboundedReceiver<String>,
        label: String,
        write_timeout: Duration,
    ) -> Io
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (read, write) = tokio::io::split(stream);
        let quit = Arc::new(Notify::new());
        let reader = tokio::spawn(read_loop(read, events_tx.clone()));
        let writer = tokio::spawn(write_loop(
            write,
            outbound,
            events_tx,
            quit.clone(),
            label,
            write_timeout,
        ));
        Io {
            events,
            writer,
            reader,
            quit,
            reclaim_grace: write_timeout + Duration::from_secs(1),
        }
    }

    /// Stops both tasks and reclaims the outbound queue from the writer.
    async fn stop(self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.reader.abort();
        self.quit.notify_one();
        let mut writer = self.writer;
        match time::timeout(self.reclaim_grace, &mut writer).await {
            Ok(Ok(rx)) => Some(rx),
            Ok(Err(_)) => None,
            Err(_) => {
                writer.abort();
                None
            }
        }
    }
}

/// Reader task: CRLF lines in, events out.  Lives until the socket closes
/// or the session stops listening.
async fn read_loop<S>(read: ReadHalf<S>, events: mpsc::UnboundedSender<Event>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(raw)) => {
                if events.send(Event::Line(raw)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send(Event::Closed(None));
                return;
            }
            Err(err) => {
                let _ = events.send(Event::Closed(Some(err)));
                return;
            }
        }
    }
}

/// Writer task: the only place the socket is written.
///
/// Drains pending lines before honoring the stop signal, and gives the
/// outbound queue back to the session when it ends so the queue survives
/// reconnects.  Write errors are reported through the event channel; the
/// task then parks until the session collects it.
async fn write_loop<S>(
    mut write: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<Event>,
    quit: Arc<Notify>,
    label: String,
    write_timeout: Duration,
) -> mpsc::UnboundedReceiver<String>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            item = outbound.recv() => match item {
                Some(raw) => {
                    log::trace!("{} -> {}", label, raw.trim_end());
                    let res = time::timeout(write_timeout, write.write_all(raw.as_bytes())).await;
                    let err = match res {
                        Ok(Ok(())) => continue,
                        Ok(Err(err)) => Some(err),
                        Err(_) => Some(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
                    };
                    let _ = events.send(Event::Closed(err));
                    quit.notified().await;
                    return outbound;
                }
                None => return outbound,
            },
            _ = quit.notified() => return outbound,
        }
    }
}
