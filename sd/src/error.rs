use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("sd: service not offered here")]
    ErrNotOffered,
    #[error("sd: unknown subscription decision token")]
    ErrUnknownDecision,
    #[error("codec: {0}")]
    Codec(#[from] message::Error),
}
