use std::fmt;

/// Errors returned by lease lifecycle operations.
#[derive(Debug)]
pub enum LeaseError {
    /// Runtime adapter call failed (copy, configure, start, state, delete).
    Runtime(String),
    /// Provisioning flow failed; whatever was created has been torn down.
    Provisioning(String),
    /// Lease could not be persisted after a successful provision.
    Persistence(String),
    /// Lease store read or write failure.
    Storage(String),
    /// Requested lease not found (or no longer active).
    NotFound(String),
    /// Invalid input or configuration.
    Validation(String),
    /// Transport-level failure talking to the runtime daemon.
    Http(String),
}

impl LeaseError {
    /// Whether this error came out of a create flow and should be reported to
    /// callers only as the generic "unknown error" classification.
    pub fn is_provisioning_failure(&self) -> bool {
        matches!(
            self,
            LeaseError::Provisioning(_)
                | LeaseError::Persistence(_)
                | LeaseError::Runtime(_)
                | LeaseError::Http(_)
                | LeaseError::Storage(_)
        )
    }
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseError::Runtime(msg) => write!(f, "runtime error: {msg}"),
            LeaseError::Provisioning(msg) => write!(f, "provisioning error: {msg}"),
            LeaseError::Persistence(msg) => write!(f, "persistence error: {msg}"),
            LeaseError::Storage(msg) => write!(f, "storage error: {msg}"),
            LeaseError::NotFound(msg) => write!(f, "not found: {msg}"),
            LeaseError::Validation(msg) => write!(f, "validation error: {msg}"),
            LeaseError::Http(msg) => write!(f, "http error: {msg}"),
        }
    }
}

impl std::error::Error for LeaseError {}

impl From<LeaseError> for String {
    fn from(err: LeaseError) -> Self {
        err.to_string()
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
