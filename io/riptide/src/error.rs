use std::fmt;
use std::io;

/// Errors returned by riptide constructors and launch paths.
#[derive(Debug)]
pub enum Error {
    /// A syscall failed (socket, bind, eventfd, timerfd, epoll, ...).
    Io(io::Error),
    /// A loop thread exited before publishing its handle.
    LoopStartup(String),
    /// An address string could not be parsed.
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::LoopStartup(msg) => write!(f, "loop startup: {msg}"),
            Error::InvalidAddress(msg) => write!(f, "invalid address: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
