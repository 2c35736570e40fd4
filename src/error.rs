use crate::codec::MalformedHeaderError;

/// Errors reported to callers of the messenger API
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("malformed message header: {0}")]
    MalformedHeader(#[from] MalformedHeaderError),
    #[error("sequence id {sequence_id} was used before with different destinations")]
    SequenceContractViolation { sequence_id: u32 },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("message was dropped before leaving the local node")]
    Dropped,
    #[error("no transport could be established")]
    NoTransport,
    #[error("messenger is shut down")]
    Shutdown,
}
