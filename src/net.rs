//! Request ingress.
//!
//! Producers open a short-lived local connection, write one or more JSON
//! objects and hang up.  Objects may be separated by any amount of
//! whitespace, including none.  A malformed byte stream closes the
//! connection; a well-formed object that fails validation is dropped alone.

use crate::channel;
use crate::dispatch::Relay;
use crate::target::Target;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;

/// A relay request, validated against a closed schema: unknown keys are a
/// hard error so that drifting producers are caught early.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub to: To,
    pub privmsg: String,
}

/// The `to` field: one target URL or a list of them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum To {
    One(String),
    Many(Vec<String>),
}

impl To {
    fn urls(&self) -> &[String] {
        match self {
            To::One(url) => std::slice::from_ref(url),
            To::Many(urls) => urls,
        }
    }
}

impl Request {
    /// Resolves the `to` field into parsed targets.
    ///
    /// A request is taken or dropped whole: one unparsable URL (or an empty
    /// target list) rejects the request, so a producer with a broken URL
    /// template does not half-deliver.
    fn targets(&self) -> Result<Vec<Target>, String> {
        let urls = self.to.urls();
        if urls.is_empty() {
            return Err("empty target list".to_owned());
        }
        urls.iter()
            .map(|url| Target::parse(url).map_err(|err| format!("target {:?}: {}", url, err)))
            .collect()
    }
}

/// Accepts and handles producer connections forever.
pub async fn listen(listener: TcpListener, relay: Relay) {
    loop {
        match listener.accept().await {
            Ok((conn, addr)) => {
                log::debug!("producer connected from {}", addr);
                tokio::spawn(handle(conn, relay.clone()));
            }
            Err(err) => log::info!("failed to accept a producer connection: {}", err),
        }
    }
}

/// `listen`, for the optional UNIX-domain ingress.
#[cfg(unix)]
pub async fn listen_unix(listener: UnixListener, relay: Relay) {
    loop {
        match listener.accept().await {
            Ok((conn, _)) => {
                log::debug!("producer connected on the local socket");
                tokio::spawn(handle(conn, relay.clone()));
            }
            Err(err) => log::info!("failed to accept a producer connection: {}", err),
        }
    }
}

/// Handles one producer connection.
///
/// Objects already accepted stay valid even when the stream later turns out
/// to be malformed.
pub(crate) async fn handle<S>(mut conn: S, relay: Relay)
where
    S: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match conn.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                log::info!("producer connection error: {}", err);
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        let (values, consumed, malformed) = cut_values(&buf);
        buf.drain(..consumed);
        for value in values {
            fan_out(value, &relay).await;
        }
        if let Some(err) = malformed {
            log::info!("closing producer connection, malformed JSON: {}", err);
            return;
        }
    }
    if buf.iter().any(|b| !b.is_ascii_whitespace()) {
        log::info!("producer connection ended in the middle of an object");
    }
}

/// Cuts the complete JSON values off the front of `buf`.
///
/// Returns the values, how many bytes they (and leading whitespace) took,
/// and the error if the remainder is malformed rather than merely
/// incomplete.
fn cut_values(buf: &[u8]) -> (Vec<Value>, usize, Option<serde_json::Error>) {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    let mut values = Vec::new();
    let mut consumed = 0;
    loop {
        match stream.next() {
            Some(Ok(value)) => {
                consumed = stream.byte_offset();
                values.push(value);
            }
            Some(Err(err)) => {
                let malformed = if err.is_eof() { None } else { Some(err) };
                return (values, consumed, malformed);
            }
            None => return (values, consumed, None),
        }
    }
}

/// Validates one request object and fans its lines out to the dispatcher.
async fn fan_out(value: Value, relay: &Relay) {
    let request: Request = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(err) => {
            log::info!("dropping invalid request: {}", err);
            return;
        }
    };
    let targets = match request.targets() {
        Ok(targets) => targets,
        Err(err) => {
            log::info!("dropping invalid request: {}", err);
            return;
        }
    };
    for target in &targets {
        let limit = channel::payload_limit(&target.channel);
        for segment in request.privmsg.split('\n') {
            let segment = segment.trim_end_matches('\r');
            for piece in channel::split_line(segment, limit) {
                relay.submit(target, piece.to_owned()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cut_values_concatenated() {
        let (values, consumed, malformed) = cut_values(b"{\"a\":1} {\"b\":2}{\"c\":3}");
        assert_eq!(values.len(), 3);
        assert_eq!(consumed, 22);
        assert!(malformed.is_none());
    }

    #[test]
    fn test_cut_values_partial_tail() {
        let (values, consumed, malformed) = cut_values(b"{\"a\":1} {\"b\"");
        assert_eq!(values.len(), 1);
        assert_eq!(consumed, 7);
        assert!(malformed.is_none());
    }

    #[test]
    fn test_cut_values_malformed() {
        let (values, _, malformed) = cut_values(b"{\"a\":1} this is not json");
        assert_eq!(values.len(), 1);
        assert!(malformed.is_some());
    }

    #[test]
    fn test_request_schema() {
        let ok: Result<Request, _> =
            serde_json::from_str(r#"{"to":"irc://h/c","privmsg":"hi"}"#);
        assert!(ok.is_ok());

        let list: Request =
            serde_json::from_str(r#"{"to":["irc://h/c","ircs://h/d"],"privmsg":"hi"}"#).unwrap();
        assert_eq!(list.to.urls().len(), 2);

        // unknown keys are a hard error
        let extra: Result<Request, _> =
            serde_json::from_str(r#"{"to":"irc://h/c","privmsg":"hi","color":"red"}"#);
        assert!(extra.is_err());

        // privmsg must be a string
        let bad: Result<Request, _> =
            serde_json::from_str(r#"{"to":"irc://h/c","privmsg":42}"#);
        assert!(bad.is_err());

        // both keys are required
        let missing: Result<Request, _> = serde_json::from_str(r#"{"to":"irc://h/c"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_one_bad_url_rejects_the_request() {
        let req: Request =
            serde_json::from_str(r#"{"to":["irc://h/c","http://nope/x"],"privmsg":"hi"}"#).unwrap();
        assert!(req.targets().is_err());

        let req: Request = serde_json::from_str(r#"{"to":[],"privmsg":"hi"}"#).unwrap();
        assert!(req.targets().is_err());

        let req: Request =
            serde_json::from_str(r#"{"to":["irc://h/c","ircs://h/d"],"privmsg":"hi"}"#).unwrap();
        assert_eq!(req.targets().unwrap().len(), 2);
    }
}
