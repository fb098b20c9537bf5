//! The IRC numerics the relay reacts to.
//!
//! Numerics reach `Message::command` as `Err` strings; matching them against
//! these constants keeps the magic numbers in one place.  Every reply listed
//! here carries the client's nick as its first parameter.
//!
//! Sources:
//!
//! - <https://tools.ietf.org/html/rfc2812.html#section-5>
//! - <https://modern.ircdocs.horse/#numerics>

pub const WELCOME: &str = "001"; // :Welcome message
pub const ISUPPORT: &str = "005"; // 1*13<TOKEN[=value]> :are supported by this server

pub const ERR_NOSUCHCHANNEL: &str = "403"; // <channel> :No such channel
pub const ERR_ERRONEUSNICKNAME: &str = "432"; // <nick> :Erroneous nickname
pub const ERR_NICKNAMEINUSE: &str = "433"; // <nick> :Nickname is already in use
pub const ERR_NICKCOLLISION: &str = "436"; // <nick> :Nickname collision KILL
pub const ERR_UNAVAILRESOURCE: &str = "437"; // <nick/channel> :Nick/channel is temporarily unavailable
pub const ERR_CHANNELISFULL: &str = "471"; // <channel> :Cannot join channel (+l)
pub const ERR_INVITEONLYCHAN: &str = "473"; // <channel> :Cannot join channel (+i)
pub const ERR_BANNEDFROMCHAN: &str = "474"; // <channel> :Cannot join channel (+b)
pub const ERR_BADCHANKEY: &str = "475"; // <channel> :Cannot join channel (+k)
