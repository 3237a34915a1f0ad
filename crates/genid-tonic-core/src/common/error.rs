//! Service-level errors for the `genid` gRPC server.
//!
//! Command failures (unknown verb, unregistered key, store outage) are part of
//! the protocol and travel inside `CommandReply.error`. The variants here are
//! the failures that abort the RPC itself and become a [`tonic::Status`].
//!
//! ## Error Cases
//! - `Generator`: a registry operation failed outside of command handling.
//! - `InvalidRequest`: the request could not be interpreted.
//! - `TaskFailed`: the blocking task running a command panicked or was
//!   cancelled.
//! - `ServiceShutdown`: a request arrived while the service was shutting down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the gRPC service.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A registry operation failed.
    #[error("generator error: {0}")]
    Generator(#[from] genid::Error),

    /// The client request was malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The blocking task executing a command did not complete.
    #[error("task failed: {context}")]
    TaskFailed { context: String },

    /// The service is in the process of shutting down.
    #[error("service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Generator(e) => match &e {
                genid::Error::KeyNotRegistered(_) => Status::not_found(e.to_string()),
                genid::Error::InvalidKey { .. } | genid::Error::InvalidStep(_) => {
                    Status::invalid_argument(e.to_string())
                }
                genid::Error::Store(_) => Status::unavailable(format!("store error: {e}")),
                _ => Status::unavailable(e.to_string()),
            },
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::TaskFailed { context } => Status::internal(format!("task failed: {context}")),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}
