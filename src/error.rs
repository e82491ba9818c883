//! Error taxonomy for contract interaction

use thiserror::Error;

/// Errors produced by the ABI codec, the transaction builder, the event
/// decoder and the event streams.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No function with this name exists in the contract ABI
    #[error("Function '{name}' not found in contract ABI. Available functions: {available}")]
    UnknownFunction { name: String, available: String },

    /// The first topic of a log matches no declared event
    #[error("Event signature not found in ABI: {0}")]
    UnknownEvent(String),

    /// Argument count does not match any overload of the function
    #[error("Parameter count mismatch for function '{function}': expected {expected}, got {got}")]
    ArgumentCountMismatch {
        function: String,
        expected: String,
        got: usize,
    },

    /// An argument does not conform to its declared parameter type
    #[error("Invalid parameter #{position} of '{function}': expected {expected}, got {got}")]
    ArgumentTypeMismatch {
        function: String,
        position: usize,
        expected: String,
        got: String,
    },

    /// Byte payload length or shape does not fit the declared type
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The RPC client or signer returned an error, message kept verbatim
    #[error("{operation} failed: {message}")]
    Collaborator { operation: String, message: String },

    /// A live event stream ended; `cause` is `None` for a clean cancellation
    #[error("Subscription terminated: {}", .cause.as_deref().unwrap_or("cancelled"))]
    SubscriptionTerminated { cause: Option<String> },

    /// The ABI definition itself could not be parsed or resolved
    #[error("Invalid ABI: {0}")]
    InvalidAbi(String),
}

impl Error {
    pub fn collaborator(operation: &str, err: impl std::fmt::Display) -> Self {
        Error::Collaborator {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }

    /// Decode failures that concern a single log and can be skipped by the
    /// caller without aborting a batch.
    pub fn is_per_entry(&self) -> bool {
        matches!(self, Error::UnknownEvent(_) | Error::MalformedPayload(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
