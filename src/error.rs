//! Main Crate Error

use crate::common::{messages::DecodeMessageError, InsertError, ValueError};
use crate::rpc::{PutError, SendMessageError};

#[derive(thiserror::Error, Debug)]
/// Kadnode crate error enum.
pub enum Error {
    /// No route to any known node.
    #[error("Network unreachable")]
    NetworkUnreachable,

    /// A request was retried up to the configured limit without a response.
    #[error("Request timed out")]
    Timeout,

    #[error("Invalid value signature")]
    InvalidSignature,

    #[error("A different value with the same id is already stored")]
    ValueConflict,

    #[error("Invalid value: {0}")]
    InvalidValue(ValueError),

    /// The routing table is empty, bootstrap first.
    #[error("Not bootstrapped, no known nodes")]
    NotBootstrapped,

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] DecodeMessageError),

    /// Routing table insertion declined.
    #[error("Bucket full, no insertion")]
    BucketFull,

    /// Bootstrap address resolution failed.
    #[error("Bootstrap failed, no peers known")]
    BootstrapFailed,

    /// The remote node answered with an error message.
    #[error("Rejected by remote node: {code} {description}")]
    Rejected { code: i32, description: String },

    /// A lookup finished without any responding node.
    #[error("Lookup found no closest nodes to announce to")]
    NoClosestNodes,

    /// The node was shut down before the operation completed.
    #[error("Node shut down")]
    Shutdown,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

impl From<ValueError> for Error {
    fn from(error: ValueError) -> Self {
        match error {
            ValueError::InvalidSignature => Error::InvalidSignature,
            ValueError::Conflict => Error::ValueConflict,
            error => Error::InvalidValue(error),
        }
    }
}

impl From<InsertError> for Error {
    fn from(_: InsertError) -> Self {
        Error::BucketFull
    }
}

impl From<SendMessageError> for Error {
    fn from(error: SendMessageError) -> Self {
        match error {
            SendMessageError::IO(error) => Error::IO(error),
            SendMessageError::NetworkUnreachable => Error::NetworkUnreachable,
            SendMessageError::BencodeError(error) => {
                Error::MalformedMessage(DecodeMessageError::BencodeError(error))
            }
        }
    }
}

impl From<PutError> for Error {
    fn from(error: PutError) -> Self {
        match error {
            PutError::NoClosestNodes => Error::NoClosestNodes,
            PutError::Timeout => Error::Timeout,
            PutError::ErrorResponse(error) => Error::Rejected {
                code: error.code,
                description: error.description,
            },
        }
    }
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        Error::Shutdown
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        Error::Shutdown
    }
}
