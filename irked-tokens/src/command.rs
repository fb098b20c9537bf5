use std::fmt;

macro_rules! commands {
    ( $( $name:ident => $wire:literal, )* ) => {
        /// The IRC commands the relay puts on the wire or reacts to.
        ///
        /// Everything else the server may send, numerics included, stays a
        /// plain string in `Message::command`; see the constants in `rpl` for
        /// the numerics worth matching on.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum Command {
            $( $name, )*
        }

        impl Command {
            /// Looks up a command word, ignoring ASCII case.
            ///
            /// # Example
            ///
            /// ```rust
            /// # use irked_tokens::Command;
            /// assert_eq!(Command::parse("privmsg"), Some(Command::PrivMsg));
            /// assert_eq!(Command::parse("PRIVMSG"), Some(Command::PrivMsg));
            /// assert_eq!(Command::parse("TAGMSG"), None);
            /// ```
            pub fn parse(word: &str) -> Option<Self> {
                $( if word.eq_ignore_ascii_case($wire) {
                    return Some(Self::$name);
                } )*
                None
            }

            /// The wire form of the command, always upper case.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$name => $wire, )*
                }
            }
        }
    };
}

commands! {
    Error => "ERROR",
    Join => "JOIN",
    Kick => "KICK",
    Nick => "NICK",
    Part => "PART",
    Ping => "PING",
    Pong => "PONG",
    PrivMsg => "PRIVMSG",
    Quit => "QUIT",
    User => "USER",
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ignores_case() {
        assert_eq!(Command::parse("join"), Some(Command::Join));
        assert_eq!(Command::parse("Join"), Some(Command::Join));
        assert_eq!(Command::parse("JOIN"), Some(Command::Join));
    }

    #[test]
    fn test_numerics_are_not_commands() {
        assert_eq!(Command::parse("001"), None);
        assert_eq!(Command::parse("433"), None);
    }

    #[test]
    fn test_wire_form_round_trips() {
        for cmd in [Command::Error, Command::Kick, Command::PrivMsg, Command::User].iter() {
            assert_eq!(Command::parse(cmd.as_str()), Some(*cmd));
        }
    }
}
