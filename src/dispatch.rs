//! Request routing.
//!
//! The dispatcher owns the map of running server sessions, keyed by
//! `(scheme, host, port, nick)`.  It is the only shared mutable structure in
//! the daemon, guarded by one mutex held strictly for map lookup and insert;
//! everything downstream is message passing.  Tests instantiate a fresh
//! dispatcher per scenario.

use crate::config::Settings;
use crate::server;
use crate::target::{ServerKey, Target};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time;

/// One line bound for one channel, as handed to a server session.
#[derive(Clone, Debug)]
pub struct Submission {
    pub channel: String,
    pub key: Option<String>,
    pub line: String,
}

/// Handle on the whole relay state.
///
/// This is just an `Arc` over the real data, so it is cheap to clone and
/// clones share the same session map.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<Shared>,
}

struct Shared {
    settings: Arc<Settings>,
    servers: Mutex<HashMap<ServerKey, mpsc::UnboundedSender<Submission>>>,
    shutdown: watch::Sender<bool>,
}

impl Relay {
    pub fn new(settings: Settings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                settings: Arc::new(settings),
                servers: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Queues one line for one target.  Returns promptly: server sessions
    /// are spawned on demand and never awaited on network I/O, so a slow or
    /// dead IRC server cannot stall a producer.
    pub async fn submit(&self, target: &Target, line: String) {
        let key = target.server_key(&self.shared.settings.nick);
        let sub = Submission {
            channel: target.channel.clone(),
            key: target.key.clone(),
            line,
        };
        let mut servers = self.shared.servers.lock().await;
        match servers.get(&key) {
            Some(handle) => {
                if let Err(mpsc::error::SendError(returned)) = handle.send(sub) {
                    // the session ended between lookup and send
                    let handle = self.spawn(key.clone());
                    let _ = handle.send(returned);
                    servers.insert(key, handle);
                }
            }
            None => {
                log::info!("{}: starting server session", key);
                let handle = self.spawn(key.clone());
                let _ = handle.send(sub);
                servers.insert(key, handle);
            }
        }
    }

    fn spawn(&self, key: ServerKey) -> mpsc::UnboundedSender<Submission> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(server::run(
            key,
            self.shared.settings.clone(),
            self.clone(),
            tx.clone(),
            rx,
            self.shared.shutdown.subscribe(),
        ));
        tx
    }

    /// Unregisters a finished session.
    ///
    /// `handle` identifies the generation: when the key has already been
    /// replaced by a newer session, the newer entry stays.
    pub(crate) async fn forget(&self, key: &ServerKey, handle: &mpsc::UnboundedSender<Submission>) {
        let mut servers = self.shared.servers.lock().await;
        if let Some(current) = servers.get(key) {
            if current.same_channel(handle) {
                servers.remove(key);
            }
        }
    }

    /// The number of live server sessions.
    pub async fn server_count(&self) -> usize {
        self.shared.servers.lock().await.len()
    }

    /// Asks every session to quit, then waits out the drain, bounded by the
    /// shutdown grace.  Anything not written by then is discarded (and
    /// counted by the sessions themselves).
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let drained = time::timeout(self.shared.settings.shutdown_grace, async {
            while self.server_count().await > 0 {
                time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if drained.is_err() {
            let stranded = self.server_count().await;
            log::info!("shutdown grace expired with {} session(s) still open", stranded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net;
    use crate::test::{settings, FakeServer};
    use irked_tokens::{Command, Message};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_happy_path() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());

        relay.submit(&fake.target("a"), "hello".to_owned()).await;

        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        assert_eq!(conn.confirm_join(&nick).await, "#a");
        let params = conn.expect(Command::PrivMsg).await;
        assert_eq!(params, vec!["#a".to_owned(), "hello".to_owned()]);
    }

    #[tokio::test]
    async fn test_nick_collision_mutates_nick() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());

        relay.submit(&fake.target("a"), "hello".to_owned()).await;

        let mut conn = fake.accept().await;
        let first = conn.expect(Command::Nick).await.remove(0);
        conn.expect(Command::User).await;
        conn.send(&format!(":fake.irc 433 * {} :Nickname is already in use.", first))
            .await;
        let second = conn.expect(Command::Nick).await.remove(0);
        assert_ne!(first, second);
        assert!(second.starts_with(&first), "{:?} should extend {:?}", second, first);
        conn.send(&format!(":fake.irc 001 {} :welcome", second)).await;

        conn.confirm_join(&second).await;
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "hello");
    }

    #[tokio::test]
    async fn test_fifo_on_one_channel() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());
        let target = fake.target("a");

        for i in 0..6 {
            relay.submit(&target, format!("msg {}", i)).await;
        }

        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.confirm_join(&nick).await;
        for i in 0..6 {
            assert_eq!(conn.expect(Command::PrivMsg).await[1], format!("msg {}", i));
        }
    }

    #[tokio::test]
    async fn test_one_connection_per_server_key() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());

        relay.submit(&fake.target("one"), "a".to_owned()).await;
        relay.submit(&fake.target("two"), "b".to_owned()).await;

        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        let mut chans = vec![
            conn.confirm_join(&nick).await,
            conn.confirm_join(&nick).await,
        ];
        chans.sort();
        assert_eq!(chans, ["#one".to_owned(), "#two".to_owned()]);

        let mut msgs = vec![
            conn.expect(Command::PrivMsg).await,
            conn.expect(Command::PrivMsg).await,
        ];
        msgs.sort();
        assert_eq!(msgs[0], vec!["#one".to_owned(), "a".to_owned()]);
        assert_eq!(msgs[1], vec!["#two".to_owned(), "b".to_owned()]);

        assert_eq!(relay.server_count().await, 1);
        fake.assert_no_connection(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn test_reconnect_redelivers() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());
        let target = fake.target("a");

        relay.submit(&target, "one".to_owned()).await;
        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.confirm_join(&nick).await;
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "one");

        // the server hangs up
        drop(conn);
        time::sleep(Duration::from_millis(50)).await;

        relay.submit(&target, "two".to_owned()).await;
        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        assert_eq!(conn.confirm_join(&nick).await, "#a");
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "two");
    }

    #[tokio::test]
    async fn test_idle_eviction_parts_then_rejoins() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());
        let target = fake.target("a");

        relay.submit(&target, "hello".to_owned()).await;
        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.confirm_join(&nick).await;
        conn.expect(Command::PrivMsg).await;

        // no traffic for channel_ttl: the channel is parted
        let params = conn.expect(Command::Part).await;
        assert_eq!(params[0], "#a");

        // a fresh submit joins again on the same connection
        relay.submit(&target, "again".to_owned()).await;
        assert_eq!(conn.confirm_join(&nick).await, "#a");
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "again");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_delivers_rest_in_order() {
        let fake = FakeServer::start().await;
        let config = settings();
        let cap = config.queue_max;
        let relay = Relay::new(config);
        let target = fake.target("a");

        // the channel cannot be joined yet, so everything queues up
        for i in 0..cap + 10 {
            relay.submit(&target, i.to_string()).await;
        }

        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        let chan = conn.expect(Command::Join).await.remove(0);
        // hold the join echo back until every line has settled in the queue,
        // so delivery starts against the post-overflow contents
        time::sleep(Duration::from_millis(100)).await;
        conn.send(&format!(":{}!~u@localhost JOIN {}", nick, chan)).await;

        let mut got = Vec::new();
        loop {
            let raw = conn.recv().await;
            let msg = Message::parse(&raw).expect("unparsable line from the daemon");
            match msg.command {
                Ok(Command::PrivMsg) => got.push(msg.params[1].to_owned()),
                Ok(Command::Part) => break,
                _ => {}
            }
        }
        let expected: Vec<String> = (10..cap + 10).map(|i| i.to_string()).collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_join_rejection_flushes_channel() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());
        let target = fake.target("locked");

        relay.submit(&target, "will not arrive".to_owned()).await;
        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.expect(Command::Join).await;
        conn.send(&format!(":fake.irc 474 {} #locked :Cannot join channel (+b)", nick))
            .await;

        // the channel session is gone; a new submit starts a fresh JOIN
        time::sleep(Duration::from_millis(100)).await;
        relay.submit(&target, "second try".to_owned()).await;
        assert_eq!(conn.confirm_join(&nick).await, "#locked");
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "second try");
    }

    #[tokio::test]
    async fn test_shutdown_quits() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());

        relay.submit(&fake.target("a"), "hello".to_owned()).await;
        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.confirm_join(&nick).await;
        conn.expect(Command::PrivMsg).await;

        relay.shutdown().await;
        conn.expect(Command::Quit).await;
        assert_eq!(relay.server_count().await, 0);
    }

    #[tokio::test]
    async fn test_ingress_splits_multiline_messages() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());

        let (mut producer, daemon_side) = tokio::io::duplex(1024);
        tokio::spawn(net::handle(daemon_side, relay.clone()));
        let request = format!(
            "{{\"to\":\"{}\",\"privmsg\":\"line1\\nline2\"}}",
            fake.url("a"),
        );
        producer.write_all(request.as_bytes()).await.unwrap();
        drop(producer);

        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.confirm_join(&nick).await;
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "line1");
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "line2");
    }

    #[tokio::test]
    async fn test_ingress_keeps_objects_before_malformed_json() {
        let fake = FakeServer::start().await;
        let relay = Relay::new(settings());

        let (mut producer, daemon_side) = tokio::io::duplex(1024);
        tokio::spawn(net::handle(daemon_side, relay.clone()));
        let request = format!(
            "{{\"to\":\"{}\",\"privmsg\":\"kept\"}} this is not json",
            fake.url("a"),
        );
        producer.write_all(request.as_bytes()).await.unwrap();

        let mut conn = fake.accept().await;
        let nick = conn.welcome().await;
        conn.confirm_join(&nick).await;
        assert_eq!(conn.expect(Command::PrivMsg).await[1], "kept");
    }
}
