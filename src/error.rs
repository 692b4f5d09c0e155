use chrono::{DateTime, Utc};
use thiserror::Error;

/// Classification of an error, stable across context wrapping.
///
/// Callers switch on the kind rather than matching the full variant so that
/// wrapped errors keep their meaning (`NotFound` stays `NotFound` no matter
/// how many layers added context on the way up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Unauthorized,
    Forbidden,
    AmbiguousChoice,
    LeaseUnavailable,
    /// Store-level CAS miss; carried up as `LeaseUnavailable` by the lease
    /// manager.
    ConditionFailed,
    /// Remote unreachable or rejected at the transport level. Retrying a
    /// different candidate is reasonable.
    Transient,
    /// The request itself is wrong. Trying another candidate cannot help.
    InvalidRequest,
    Timeout,
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("more than one {what} matches: {matches:?}")]
    AmbiguousChoice { what: String, matches: Vec<String> },

    #[error("lease held by {holder:?} until {expiry}")]
    LeaseUnavailable {
        holder: String,
        expiry: DateTime<Utc>,
    },

    #[error("stored lease is ({holder:?}, {expiry}), not the expected value")]
    ConditionFailed {
        holder: String,
        expiry: DateTime<Utc>,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        Error::AlreadyExists(what.to_string())
    }

    /// Wrap with an operation/entity description, preserving the kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::AmbiguousChoice { .. } => ErrorKind::AmbiguousChoice,
            Error::LeaseUnavailable { .. } => ErrorKind::LeaseUnavailable,
            Error::ConditionFailed { .. } => ErrorKind::ConditionFailed,
            Error::Transient(_) => ErrorKind::Transient,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Context { source, .. } => source.kind(),
            Error::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Adds classified context to a `Result` without disturbing the kind.
pub trait ResultExt<T> {
    fn context_op(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context_op(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}
