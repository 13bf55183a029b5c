use thiserror::Error;

/// Coarse error classification shared across crates.
///
/// Callers branch on kinds, not on variant payloads: the executor retries
/// while a write stays [`ErrorKind::Unavailable`], the controller rejects
/// over-quota submissions with [`ErrorKind::ResourceExhausted`], and table
/// streams surface [`ErrorKind::Canceled`] after a query is canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request: bad bounds, bad window, bad schedule expression.
    InvalidArgument,
    /// Referenced task, run, bucket, or key does not exist.
    NotFound,
    /// Caller identity could not be established.
    Unauthenticated,
    /// Caller identity is known but not permitted.
    Forbidden,
    /// Concurrent modification lost a check-and-set race.
    Conflict,
    /// A queue, quota, or memory budget is exhausted.
    ResourceExhausted,
    /// The operation observed a cancellation signal.
    Canceled,
    /// The operation ran past its deadline.
    DeadlineExceeded,
    /// A collaborator (engine, store) is not ready to serve.
    Unavailable,
    /// Invariant violation inside Rill itself.
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name, used as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Canceled => "canceled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Canonical Rill error taxonomy used across crates.
///
/// One variant per [`ErrorKind`]; messages describe the failing operation,
/// not the classification, which is already carried by the variant.
#[derive(Debug, Error)]
pub enum RillError {
    /// Malformed read spec, schedule, or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Missing task, run, series, or key.
    #[error("not found: {0}")]
    NotFound(String),

    /// Identity resolution failed.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Identity resolved but lacks permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Check-and-set or unique-constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Queue full, memory budget exceeded, or quota reached.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Cancellation observed at a suspension point.
    #[error("canceled: {0}")]
    Canceled(String),

    /// Deadline elapsed before the operation finished.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Collaborator not open or temporarily unable to serve.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Broken invariant inside Rill.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RillError {
    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RillError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            RillError::NotFound(_) => ErrorKind::NotFound,
            RillError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            RillError::Forbidden(_) => ErrorKind::Forbidden,
            RillError::Conflict(_) => ErrorKind::Conflict,
            RillError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            RillError::Canceled(_) => ErrorKind::Canceled,
            RillError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            RillError::Unavailable(_) => ErrorKind::Unavailable,
            RillError::Internal(_) => ErrorKind::Internal,
            RillError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error from a kind and message.
    ///
    /// Used where a terminal error is recorded once and surfaced to several
    /// observers (for example a query's result stream and its handle).
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidArgument => RillError::InvalidArgument(message),
            ErrorKind::NotFound => RillError::NotFound(message),
            ErrorKind::Unauthenticated => RillError::Unauthenticated(message),
            ErrorKind::Forbidden => RillError::Forbidden(message),
            ErrorKind::Conflict => RillError::Conflict(message),
            ErrorKind::ResourceExhausted => RillError::ResourceExhausted(message),
            ErrorKind::Canceled => RillError::Canceled(message),
            ErrorKind::DeadlineExceeded => RillError::DeadlineExceeded(message),
            ErrorKind::Unavailable => RillError::Unavailable(message),
            ErrorKind::Internal => RillError::Internal(message),
        }
    }

    /// Message without the kind prefix, paired with [`RillError::kind`] when
    /// an error must be stored and re-surfaced later.
    pub fn message(&self) -> String {
        match self {
            RillError::InvalidArgument(m)
            | RillError::NotFound(m)
            | RillError::Unauthenticated(m)
            | RillError::Forbidden(m)
            | RillError::Conflict(m)
            | RillError::ResourceExhausted(m)
            | RillError::Canceled(m)
            | RillError::DeadlineExceeded(m)
            | RillError::Unavailable(m)
            | RillError::Internal(m) => m.clone(),
            RillError::Io(e) => e.to_string(),
        }
    }
}

/// Standard Rill result alias.
pub type Result<T> = std::result::Result<T, RillError>;
