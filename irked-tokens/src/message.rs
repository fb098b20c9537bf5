use crate::Command;

/// The length limit servers enforce on a full message line, CRLF included.
///
/// `Message::parse` accepts longer input; callers building outgoing lines
/// keep under the limit by splitting their payload beforehand.
pub const MESSAGE_LENGTH: usize = 512;

/// The size of the `Message::params` array.
pub const PARAMS_LENGTH: usize = 15;

/// Splits off the first space-delimited word.
///
/// Returns the word and the rest of the string, with the separating run of
/// spaces consumed.
fn word(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], s[i + 1..].trim_start_matches(' ')),
        None => (s, ""),
    }
}

/// An incoming IRC message, borrowed from the line it was parsed from.
///
/// See `Message::parse` for reading server lines and `Buffer` for building
/// outgoing ones.
///
/// The message grammar is described in RFC 2812:
/// <https://tools.ietf.org/html/rfc2812.html#section-2.3>.
#[derive(Clone, Debug)]
pub struct Message<'a> {
    /// The source of the message: `servername` or `nick!user@host`, without
    /// the leading `:`.
    pub prefix: Option<&'a str>,

    /// The command, when it is one the relay knows; the raw command word
    /// otherwise.  Numerics always land in `Err`, to be matched against the
    /// constants in `rpl`.
    pub command: Result<Command, &'a str>,

    /// How many leading elements of `Message::params` are meaningful.
    pub num_params: usize,

    /// The parameters.  Elements past `num_params` are empty strings.
    pub params: [&'a str; PARAMS_LENGTH],
}

impl<'a> Message<'a> {
    /// Parses one line received from a server.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use irked_tokens::{Command, Message};
    /// let msg = Message::parse(":tester!t@host PRIVMSG #release :it shipped\r\n").unwrap();
    ///
    /// assert_eq!(msg.prefix, Some("tester!t@host"));
    /// assert_eq!(msg.command, Ok(Command::PrivMsg));
    /// assert_eq!(msg.num_params, 2);
    /// assert_eq!(msg.params[0], "#release");
    /// assert_eq!(msg.params[1], "it shipped");
    /// ```
    ///
    /// Numerics come out as `Err`:
    ///
    /// ```rust
    /// # use irked_tokens::{rpl, Message};
    /// let msg = Message::parse(":irc.example.net 001 nick :Welcome!\r\n").unwrap();
    ///
    /// assert_eq!(msg.command, Err(rpl::WELCOME));
    /// assert_eq!(msg.params[0], "nick");
    /// ```
    ///
    /// A leading IRCv3 tag word is skipped; the relay never negotiates tags
    /// but some servers attach them anyway:
    ///
    /// ```rust
    /// # use irked_tokens::{Command, Message};
    /// let msg = Message::parse("@time=2024 :srv PING :token\r\n").unwrap();
    ///
    /// assert_eq!(msg.command, Ok(Command::Ping));
    /// ```
    ///
    /// Returns `None` when the line carries no command at all:
    ///
    /// ```rust
    /// # use irked_tokens::Message;
    /// assert!(Message::parse("  \r \n \t ").is_none());
    /// assert!(Message::parse(":prefix-only").is_none());
    /// ```
    pub fn parse(s: &'a str) -> Option<Message<'a>> {
        let mut rest = s.trim();
        if rest.contains('\0') {
            return None;
        }

        if rest.starts_with('@') {
            rest = word(rest).1;
        }
        let prefix = match rest.strip_prefix(':') {
            Some(prefixed) => {
                let (prefix, after) = word(prefixed);
                rest = after;
                Some(prefix)
            }
            None => None,
        };
        let (command_word, mut rest) = word(rest);
        if command_word.is_empty() {
            return None;
        }
        let command = Command::parse(command_word).ok_or(command_word);

        let mut params = [""; PARAMS_LENGTH];
        let mut num_params = 0;
        while !rest.is_empty() && num_params < PARAMS_LENGTH {
            match rest.strip_prefix(':') {
                Some(trailing) => {
                    params[num_params] = trailing;
                    rest = "";
                }
                None => {
                    let (param, after) = word(rest);
                    params[num_params] = param;
                    rest = after;
                }
            }
            num_params += 1;
        }

        Some(Message {
            prefix,
            command,
            num_params,
            params,
        })
    }

    /// The nick part of the prefix, when there is a prefix.
    ///
    /// Prefixes are either `servername` or `nick!user@host`; for the commands
    /// the relay matches on origin (JOIN echoes, KICK, PART), only the nick
    /// part matters.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use irked_tokens::Message;
    /// let join = Message::parse(":ann!u@host JOIN #chan").unwrap();
    ///
    /// assert_eq!(join.prefix_nick(), Some("ann"));
    /// ```
    pub fn prefix_nick(&self) -> Option<&'a str> {
        let prefix = self.prefix?;
        let end = prefix
            .find(|c| c == '!' || c == '@')
            .unwrap_or_else(|| prefix.len());
        Some(&prefix[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpl;

    #[test]
    fn test_parse_command_only() {
        let msg = Message::parse("PING :tok-1\r\n").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, Ok(Command::Ping));
        assert_eq!(msg.num_params, 1);
        assert_eq!(msg.params[0], "tok-1");
    }

    #[test]
    fn test_parse_numeric() {
        let msg = Message::parse(":server.dev 433 * irked :Nickname is already in use.").unwrap();
        assert_eq!(msg.prefix, Some("server.dev"));
        assert_eq!(msg.command, Err(rpl::ERR_NICKNAMEINUSE));
        assert_eq!(msg.num_params, 3);
        assert_eq!(
            &msg.params[..3],
            &["*", "irked", "Nickname is already in use."],
        );
    }

    #[test]
    fn test_parse_middle_and_trailing() {
        let msg = Message::parse(":nick!user@host KICK #chan nick :bye").unwrap();
        assert_eq!(msg.command, Ok(Command::Kick));
        assert_eq!(&msg.params[..3], &["#chan", "nick", "bye"]);
    }

    #[test]
    fn test_parse_extra_spaces() {
        let msg = Message::parse("JOIN   #chan    key").unwrap();
        assert_eq!(msg.num_params, 2);
        assert_eq!(&msg.params[..2], &["#chan", "key"]);
    }

    #[test]
    fn test_parse_trailing_only() {
        let msg = Message::parse("JOIN :#chan").unwrap();
        assert_eq!(msg.num_params, 1);
        assert_eq!(msg.params[0], "#chan");
    }

    #[test]
    fn test_prefix_nick() {
        let msg = Message::parse(":ann!u@h PART #chan").unwrap();
        assert_eq!(msg.prefix_nick(), Some("ann"));

        let msg = Message::parse(":irc.example.net ERROR :closing").unwrap();
        assert_eq!(msg.prefix_nick(), Some("irc.example.net"));

        let msg = Message::parse("PING :x").unwrap();
        assert_eq!(msg.prefix_nick(), None);
    }

    #[test]
    fn test_garbage() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("  \r\n").is_none());
        assert!(Message::parse("nul\0here").is_none());
        assert!(Message::parse(":prefix-only").is_none());
    }
}
