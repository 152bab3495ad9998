use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // state errors surfaced to local callers only
    #[error("routing manager is not running")]
    ErrNotRouting,
    #[error("service already offered by another provider")]
    ErrAlreadyOffered,
    #[error("service not offered")]
    ErrNotOffered,
    #[error("application already registered")]
    ErrAlreadyRegistered,
    #[error("application not registered")]
    ErrNotRegistered,

    #[error("denied by security policy")]
    ErrPolicyDenied,

    #[error("local ipc framing violated")]
    ErrIpcFraming,
    #[error("local ipc channel closed")]
    ErrIpcClosed,
    #[error("unknown ipc command {0:#04x}")]
    ErrUnknownCommand(u8),
    #[error("ipc payload truncated")]
    ErrIpcPayload,

    #[error("configuration: {0}")]
    Config(String),

    #[error("codec: {0}")]
    Codec(#[from] message::Error),
    #[error("transport: {0}")]
    Transport(#[from] endpoint::Error),
    #[error("discovery: {0}")]
    Sd(#[from] sd::Error),
    #[error("io error: {0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IoError(#[from] pub io::Error);

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
