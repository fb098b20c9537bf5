//! Tokenize and build IRC lines without ceremony.
//!
//! This library covers the small slice of the IRC client protocol that a
//! notification relay needs: parsing the CRLF-terminated lines a server sends
//! back, and assembling the handful of commands the relay ships.  Allocations
//! are kept scarce; `Message` borrows from the input line and `Buffer` reuses
//! one growing `String`.
//!
//! What it deliberately does not cover: IRCv3 tag contents (a leading tag
//! word is skipped, never interpreted), mode strings, and the server side of
//! the protocol.

#![forbid(unsafe_code)]
#![warn(clippy::all, rust_2018_idioms)]

pub use buffers::{line, Buffer, MessageBuffer};
pub use command::Command;
pub use message::{Message, MESSAGE_LENGTH, PARAMS_LENGTH};

mod buffers;
mod command;
mod message;
pub mod rpl;
