//! Error type shared by the whole crate.

use std::io;

/// A specialized `Result` type for pipebus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by topic and publishing operations.
///
/// Every variant maps onto one of the negative integer codes carried on the
/// wire-compatible boundary (see [`Error::code`]). Several distinct failure
/// modes share the generic `-1` code, matching what existing clients expect.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Catch-all for failures with no more specific code.
    #[error("operation failed")]
    Other,
    /// The topic directory has no live server behind it.
    #[error("server not available")]
    ServerNotAvailable,
    /// All eight name suffixes for the requested base name are taken.
    #[error("no free suffix for requested client name")]
    ReachedMaxNameIndex,
    /// An underlying filesystem or pipe syscall failed.
    #[error("filesystem error: {0}")]
    Filesystem(#[from] io::Error),
    /// A bounded wait expired, e.g. the peer never opened its end of a FIFO.
    #[error("timed out")]
    Timeout,
    /// The caller passed an argument the operation cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The addressed client slot holds no open pipe.
    #[error("client not connected")]
    NotConnected,
    /// The topic was created without a control pipe.
    #[error("control pipe not available")]
    ControlNotAvailable,
    /// The topic's info document is missing or unreadable.
    #[error("info not available")]
    InfoNotAvailable,
    /// The channel index is outside `0..MAX_CHANNELS`.
    #[error("channel index out of bounds")]
    ChannelOutOfBounds,
    /// The channel already hosts a running topic.
    #[error("channel already running")]
    AlreadyRunning,
    /// The channel exists but no topic is running on it.
    #[error("channel not running")]
    NotRunning,
    /// Another live topic already owns the requested directory.
    #[error("directory already in use by another topic")]
    DirectoryInUse,
    /// The record was dropped because the client's pipe lacks room for it.
    #[error("client pipe full, record dropped")]
    Backpressure,
}

impl Error {
    /// The negative integer code for this error on the C-compatible boundary.
    pub fn code(&self) -> i32 {
        match self {
            Error::Other
            | Error::AlreadyRunning
            | Error::NotRunning
            | Error::DirectoryInUse
            | Error::Backpressure => -1,
            Error::ServerNotAvailable => -2,
            Error::ReachedMaxNameIndex => -3,
            Error::Filesystem(_) => -4,
            Error::Timeout => -5,
            Error::InvalidArgument(_) => -6,
            Error::NotConnected => -7,
            Error::ControlNotAvailable => -8,
            Error::InfoNotAvailable => -9,
            Error::ChannelOutOfBounds => -10,
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Filesystem(io::Error::from(errno))
    }
}
