use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("endpoint: send queue full")]
    ErrQueueFull,
    #[error("endpoint: closed")]
    ErrClosed,
    #[error("endpoint: not connected")]
    ErrNotConnected,
    #[error("endpoint: connect timed out")]
    ErrConnectTimeout,
    #[error("endpoint: write timed out")]
    ErrWriteTimeout,
    #[error("endpoint: no such peer")]
    ErrUnknownPeer,
    #[error("endpoint: message exceeds transport budget")]
    ErrMessageTooLarge,
    #[error("codec: {0}")]
    Codec(#[from] message::Error),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
