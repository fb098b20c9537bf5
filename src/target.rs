//! Target URL parsing and canonicalisation.
//!
//! A target looks like `irc://irc.example.net:6667/#channel?key`, names one
//! channel on one server, and is the unit producers address requests to.  Two
//! URLs that differ only by channel key resolve to the same channel session;
//! the key is join-time data, not identity.

use std::error::Error as StdError;
use std::fmt;

/// Default port for plain-text connections.
pub const DEFAULT_PORT: u16 = 6667;

/// Default port for TLS connections.
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// What can go wrong while parsing a target URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The scheme is neither `irc` nor `ircs`.
    Scheme,
    /// The host part is empty.
    Host,
    /// The port is not a number in range.
    Port,
    /// The channel part is empty.
    Channel,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheme => write!(f, "URL scheme must be irc:// or ircs://"),
            Self::Host => write!(f, "URL is missing a host"),
            Self::Port => write!(f, "URL port is not a valid port number"),
            Self::Channel => write!(f, "URL is missing a channel"),
        }
    }
}

impl StdError for Error {}

/// The identity that determines connection sharing.
///
/// All channels whose targets agree on this key share one TCP connection.
/// The nick is part of the key: a single daemon may hold several connections
/// to the same host that differ only by nick.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub nick: String,
    pub password: Option<String>,
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ircs" } else { "irc" };
        write!(f, "{}://{}:{} as {}", scheme, self.host, self.port, self.nick)
    }
}

/// A parsed transmission target.
///
/// Host and channel are case-folded at parse time; IRC treats both as
/// case-insensitive, and servers echo the folded form in notifications, so
/// folding early keeps later comparisons trivial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    /// Channel name, with its leading `#` or `&`.
    pub channel: String,
    /// Channel key, passed along with JOIN.
    pub key: Option<String>,
    /// Nick override; selects a different server key.
    pub nick: Option<String>,
    /// NickServ password from the URL authority.
    pub password: Option<String>,
}

impl Target {
    /// Parses a target URL.
    ///
    /// Grammar: `("irc"|"ircs") "://" host [":" port] "/" ["#"|"&"] channel
    /// ["?" key]`.  The channel prefix defaults to `#`, ports default to
    /// 6667 / 6697.  The query accepts a bare key, `key=...`, and `nick=...`.
    pub fn parse(url: &str) -> Result<Self, Error> {
        let (scheme, rest) = match url.find("://") {
            Some(i) => (&url[..i], &url[i + 3..]),
            None => return Err(Error::Scheme),
        };
        let tls = if scheme.eq_ignore_ascii_case("irc") {
            false
        } else if scheme.eq_ignore_ascii_case("ircs") {
            true
        } else {
            return Err(Error::Scheme);
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(i) => (Some(&authority[..i]), &authority[i + 1..]),
            None => (None, authority),
        };
        let password = userinfo
            .and_then(|ui| ui.splitn(2, ':').nth(1))
            .filter(|pass| !pass.is_empty())
            .map(str::to_owned);

        let (host, port) = split_host_port(hostport, tls)?;
        if host.is_empty() {
            return Err(Error::Host);
        }

        let (channel, query) = match path.find('?') {
            Some(i) => (&path[..i], Some(&path[i + 1..])),
            None => (path, None),
        };
        let channel = channel.to_ascii_lowercase();
        if channel.is_empty() {
            return Err(Error::Channel);
        }
        let channel = if channel.starts_with('#') || channel.starts_with('&') {
            channel
        } else {
            format!("#{}", channel)
        };

        let mut key = None;
        let mut nick = None;
        for item in query.unwrap_or("").split('&').filter(|s| !s.is_empty()) {
            let mut split = item.splitn(2, '=');
            match (split.next().unwrap_or(""), split.next()) {
                ("key", Some(value)) => key = Some(value.to_owned()),
                ("nick", Some(value)) => nick = Some(value.to_owned()),
                (bare, None) => key = Some(bare.to_owned()),
                _ => {}
            }
        }

        Ok(Self {
            tls,
            host: host.to_ascii_lowercase(),
            port,
            channel,
            key,
            nick,
            password,
        })
    }

    /// The canonical string form of this target.
    ///
    /// Parsing the canonical form gives back an equal `Target`.
    pub fn canonical(&self) -> String {
        use std::fmt::Write as _;

        let mut url = String::new();
        let _ = write!(url, "{}://", if self.tls { "ircs" } else { "irc" });
        if let Some(ref password) = self.password {
            let _ = write!(url, ":{}@", password);
        }
        if self.host.contains(':') {
            let _ = write!(url, "[{}]", self.host);
        } else {
            url.push_str(&self.host);
        }
        let _ = write!(url, ":{}/{}", self.port, self.channel);
        let mut sep = '?';
        if let Some(ref key) = self.key {
            let _ = write!(url, "{}key={}", sep, key);
            sep = '&';
        }
        if let Some(ref nick) = self.nick {
            let _ = write!(url, "{}nick={}", sep, nick);
        }
        url
    }

    /// The server key this target maps to, given the daemon's default nick.
    pub fn server_key(&self, default_nick: &str) -> ServerKey {
        ServerKey {
            host: self.host.clone(),
            port: self.port,
            tls: self.tls,
            nick: self.nick.clone().unwrap_or_else(|| default_nick.to_owned()),
            password: self.password.clone(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Splits `host[:port]`, with minimal care for bracketed IPv6 literals.
fn split_host_port(s: &str, tls: bool) -> Result<(&str, u16), Error> {
    let default = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
    if let Some(end) = s.strip_prefix('[').and_then(|_| s.find(']')) {
        let host = &s[1..end];
        return match s[end + 1..].strip_prefix(':') {
            Some(port) => Ok((host, port.parse().map_err(|_| Error::Port)?)),
            None => Ok((host, default)),
        };
    }
    match s.rfind(':') {
        Some(i) => Ok((&s[..i], s[i + 1..].parse().map_err(|_| Error::Port)?)),
        None => Ok((s, default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Target::parse("irc://chat.example.net/botwar").unwrap();
        assert_eq!(t.tls, false);
        assert_eq!(t.host, "chat.example.net");
        assert_eq!(t.port, DEFAULT_PORT);
        assert_eq!(t.channel, "#botwar");
        assert_eq!(t.key, None);
        assert_eq!(t.nick, None);
    }

    #[test]
    fn test_tls_defaults() {
        let t = Target::parse("ircs://chat.example.net/#secure").unwrap();
        assert_eq!(t.tls, true);
        assert_eq!(t.port, DEFAULT_TLS_PORT);
        assert_eq!(t.channel, "#secure");
    }

    #[test]
    fn test_case_folding() {
        let t = Target::parse("IRC://Chat.Example.NET/BotWar").unwrap();
        assert_eq!(t.host, "chat.example.net");
        assert_eq!(t.channel, "#botwar");
    }

    #[test]
    fn test_explicit_port_and_prefix() {
        let t = Target::parse("irc://h:7000/&local").unwrap();
        assert_eq!(t.port, 7000);
        assert_eq!(t.channel, "&local");
    }

    #[test]
    fn test_keys() {
        let t = Target::parse("irc://h/c?hunter2").unwrap();
        assert_eq!(t.key.as_deref(), Some("hunter2"));

        let t = Target::parse("irc://h/c?key=hunter2").unwrap();
        assert_eq!(t.key.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_nick_override_selects_key() {
        let t = Target::parse("irc://h/c?nick=blip").unwrap();
        assert_eq!(t.nick.as_deref(), Some("blip"));
        assert_eq!(t.server_key("fallback").nick, "blip");

        let u = Target::parse("irc://h/c").unwrap();
        assert_eq!(u.server_key("fallback").nick, "fallback");
        assert_ne!(t.server_key("fallback"), u.server_key("fallback"));
    }

    #[test]
    fn test_password() {
        let t = Target::parse("ircs://:sekrit@h/c").unwrap();
        assert_eq!(t.password.as_deref(), Some("sekrit"));
        assert_eq!(t.host, "h");
    }

    #[test]
    fn test_ipv6() {
        let t = Target::parse("irc://[::1]:7000/c").unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.port, 7000);
    }

    #[test]
    fn test_rejects() {
        assert_eq!(Target::parse("http://h/c"), Err(Error::Scheme));
        assert_eq!(Target::parse("no-scheme"), Err(Error::Scheme));
        assert_eq!(Target::parse("irc:///c"), Err(Error::Host));
        assert_eq!(Target::parse("irc://h"), Err(Error::Channel));
        assert_eq!(Target::parse("irc://h/"), Err(Error::Channel));
        assert_eq!(Target::parse("irc://h:notaport/c"), Err(Error::Port));
    }

    #[test]
    fn test_key_is_not_identity() {
        let a = Target::parse("irc://h/c?key=a").unwrap();
        let b = Target::parse("irc://h/c?key=b").unwrap();
        assert_eq!(a.channel, b.channel);
        assert_eq!(a.server_key("n"), b.server_key("n"));
    }

    #[test]
    fn test_canonical_round_trip() {
        let urls = [
            "irc://chat.example.net/botwar",
            "ircs://Chat.Example.net/#secure?key=k",
            "irc://h:7000/&local?nick=blip",
            "ircs://:sekrit@h/c?key=k&nick=n",
            "irc://[::1]/c",
        ];
        for url in &urls {
            let t = Target::parse(url).unwrap();
            assert_eq!(Target::parse(&t.canonical()).unwrap(), t, "{}", url);
        }
    }
}
