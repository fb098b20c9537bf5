use crate::{Command, MESSAGE_LENGTH};

/// One outgoing message under construction.
///
/// Obtained from `Buffer::message`; the terminating CRLF is appended when
/// this handle is dropped.
pub struct MessageBuffer<'a> {
    buf: &'a mut String,
}

impl<'a> MessageBuffer<'a> {
    fn new(buf: &'a mut String, command: Command) -> Self {
        buf.reserve(MESSAGE_LENGTH);
        buf.push_str(command.as_str());
        MessageBuffer { buf }
    }

    /// Appends a middle parameter.
    ///
    /// The parameter is trimmed first; a parameter that is empty or all
    /// whitespace is skipped, which lets callers pass optional values
    /// unconditionally.  The caller keeps whitespace and newlines out of the
    /// rest.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use irked_tokens::{Command, Buffer};
    /// let mut out = Buffer::new();
    ///
    /// out.message(Command::Join)
    ///     .param("#box")
    ///     .param("")
    ///     .param("  hunter2 ");
    ///
    /// assert_eq!(&out.build(), "JOIN #box hunter2\r\n");
    /// ```
    pub fn param(self, param: &str) -> Self {
        let param = param.trim();
        if !param.is_empty() {
            self.buf.push(' ');
            self.buf.push_str(param);
        }
        self
    }

    /// Appends the trailing parameter and finishes the message.
    ///
    /// Unlike `MessageBuffer::param`, the text goes out verbatim: it may
    /// contain spaces, and an empty string still produces the `:` marker.
    /// Newlines remain the caller's responsibility.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use irked_tokens::{Command, Buffer};
    /// let mut out = Buffer::new();
    ///
    /// out.message(Command::Quit).trailing_param("long quit message");
    ///
    /// assert_eq!(&out.build(), "QUIT :long quit message\r\n");
    /// ```
    pub fn trailing_param(self, param: &str) {
        self.buf.push_str(" :");
        self.buf.push_str(param);
    }
}

impl Drop for MessageBuffer<'_> {
    fn drop(&mut self) {
        self.buf.push_str("\r\n");
    }
}

/// Accumulates outgoing IRC messages in one growing string.
///
/// The relay only speaks as a client, so messages carry no prefix.
///
/// # Example
///
/// ```rust
/// # use irked_tokens::{Command, Buffer};
/// let mut out = Buffer::new();
///
/// out.message(Command::Nick).param("notifier");
/// out.message(Command::User)
///     .param("notifier")
///     .param("0")
///     .param("*")
///     .trailing_param("notification relay");
///
/// assert_eq!(&out.build(), "NICK notifier\r\nUSER notifier 0 * :notification relay\r\n");
/// ```
#[derive(Debug, Default)]
pub struct Buffer {
    buf: String,
}

impl Buffer {
    /// Creates an empty `Buffer` without allocating.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a message; parameters are added on the returned handle.
    pub fn message(&mut self, command: Command) -> MessageBuffer<'_> {
        MessageBuffer::new(&mut self.buf, command)
    }

    /// Finishes the buffer and hands over the wire-ready string.
    pub fn build(self) -> String {
        self.buf
    }
}

/// Builds a single message with a trailing parameter.
///
/// Shorthand for the common one-message case of `Buffer`.
///
/// # Example
///
/// ```rust
/// # use irked_tokens::{line, Command};
/// assert_eq!(&line(Command::Pong, &[], "token"), "PONG :token\r\n");
/// assert_eq!(&line(Command::PrivMsg, &["#chan"], "hello"), "PRIVMSG #chan :hello\r\n");
/// ```
pub fn line(command: Command, params: &[&str], trailing: &str) -> String {
    let mut buf = Buffer::new();
    let mut msg = buf.message(command);
    for param in params {
        msg = msg.param(param);
    }
    msg.trailing_param(trailing);
    buf.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_sequence() {
        let mut out = Buffer::new();
        out.message(Command::Join).param("#a");
        out.message(Command::PrivMsg)
            .param("#a")
            .trailing_param("hi there");
        assert_eq!(&out.build(), "JOIN #a\r\nPRIVMSG #a :hi there\r\n");
    }

    #[test]
    fn test_message_without_params() {
        let mut out = Buffer::new();
        out.message(Command::Quit);
        assert_eq!(&out.build(), "QUIT\r\n");
    }

    #[test]
    fn test_empty_trailing_keeps_marker() {
        assert_eq!(&line(Command::Part, &["#a"], ""), "PART #a :\r\n");
    }
}
