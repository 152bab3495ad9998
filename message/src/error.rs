use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer too short for SOME/IP header")]
    ErrHeaderTooShort,
    #[error("length field smaller than fixed header tail")]
    ErrLengthTooSmall,
    #[error("length field does not match datagram size")]
    ErrLengthMismatch,
    #[error("message exceeds maximum message size")]
    ErrMessageTooLarge,
    #[error("unsupported protocol version {0}")]
    ErrUnsupportedProtocolVersion(u8),
    #[error("corrupt frame")]
    ErrCorruptFrame,
    #[error("tp header missing or truncated")]
    ErrTpHeaderTooShort,
    #[error("tp segment offset not 16 byte aligned")]
    ErrTpAlignment,
    #[error("tp segment out of order")]
    ErrTpSegmentGap,
    #[error("tp reassembly exceeds maximum size")]
    ErrTpTooLarge,
    #[error("message type carries no tp flag")]
    ErrNotTp,
    #[error("segment budget below one aligned chunk")]
    ErrTpBudgetTooSmall,
    #[error("malformed service discovery message")]
    ErrSdMalformed,
    #[error("service discovery option reference out of range")]
    ErrSdOptionReference,
    #[error("unknown service discovery entry type {0}")]
    ErrSdUnknownEntryType(u8),
    #[error("unknown service discovery option type {0}")]
    ErrSdUnknownOptionType(u8),
    #[error("message is not a service discovery message")]
    ErrNotSd,
}
