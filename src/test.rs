//! Testing utilities: a scriptable fake IRC server.

use crate::config::Settings;
use crate::target::Target;
use irked_tokens::{Command, Message};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time;

const PATIENCE: Duration = Duration::from_secs(5);

/// Settings with the timings shrunk from minutes to milliseconds.
pub(crate) fn settings() -> Settings {
    Settings {
        nick: "irked".to_owned(),
        queue_max: 8,
        burst: 4,
        flood_gap: Duration::from_millis(10),
        channel_ttl: Duration::from_millis(400),
        server_ttl: Duration::from_millis(400),
        handshake_ttl: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(30),
        backoff_cap: Duration::from_millis(100),
        max_reconnects: 4,
        shutdown_grace: Duration::from_secs(1),
        ..Settings::default()
    }
}

pub(crate) struct FakeServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    pub fn url(&self, channel: &str) -> String {
        format!("irc://{}/{}", self.addr, channel)
    }

    pub fn target(&self, channel: &str) -> Target {
        Target::parse(&self.url(channel)).unwrap()
    }

    /// Waits for the daemon to connect.
    pub async fn accept(&self) -> FakeConn {
        let (conn, _) = time::timeout(PATIENCE, self.listener.accept())
            .await
            .expect("the daemon never connected")
            .unwrap();
        let (read, write) = conn.into_split();
        FakeConn {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    /// Asserts that no connection shows up for `dur`.
    pub async fn assert_no_connection(&self, dur: Duration) {
        assert!(
            time::timeout(dur, self.listener.accept()).await.is_err(),
            "unexpected extra connection",
        );
    }
}

pub(crate) struct FakeConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl FakeConn {
    pub async fn recv(&mut self) -> String {
        time::timeout(PATIENCE, self.lines.next_line())
            .await
            .expect("timed out waiting for a line from the daemon")
            .expect("read error")
            .expect("the daemon closed the connection")
    }

    /// Reads lines until one with the given command arrives; returns its
    /// parameters.
    pub async fn expect(&mut self, cmd: Command) -> Vec<String> {
        loop {
            let raw = self.recv().await;
            let msg = Message::parse(&raw).expect("unparsable line from the daemon");
            if msg.command == Ok(cmd) {
                return msg.params[..msg.num_params]
                    .iter()
                    .map(|s| (*s).to_owned())
                    .collect();
            }
        }
    }

    pub async fn send(&mut self, raw: &str) {
        self.write.write_all(raw.as_bytes()).await.unwrap();
        self.write.write_all(b"\r\n").await.unwrap();
    }

    /// Plays the server side of the handshake: consumes NICK and USER,
    /// greets with 001.  Returns the accepted nick.
    pub async fn welcome(&mut self) -> String {
        let nick = self.expect(Command::Nick).await.remove(0);
        self.expect(Command::User).await;
        self.send(&format!(":fake.irc 001 {} :welcome", nick)).await;
        nick
    }

    /// Consumes a JOIN and echoes it back the way servers do.  Returns the
    /// channel name.
    pub async fn confirm_join(&mut self, nick: &str) -> String {
        let chan = self.expect(Command::Join).await.remove(0);
        self.send(&format!(":{}!~u@localhost JOIN {}", nick, chan))
            .await;
        chan
    }
}
