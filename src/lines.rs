//! Fixed bits of text the daemon puts on the wire.

/// Realname sent in USER.
pub const REALNAME: &str = "notification relay";

/// PART reason when a channel session idles out.
pub const PART_IDLE: &str = "no traffic";

/// PART reason when a channel is dropped to stay under the server's limit.
pub const PART_SCAVENGED: &str = "making room";

/// QUIT reason when a channel-less server session expires.
pub const QUIT_IDLE: &str = "no channels left";

/// QUIT reason on daemon shutdown.
pub const QUIT_SHUTDOWN: &str = "shutting down";
