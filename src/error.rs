use std::fmt;

#[derive(Debug)]
pub enum LimiterError {
    /// Store connection failed or an operation timed out.
    BackendUnreachable(String),
    /// The store returned malformed data or violated a script precondition.
    BackendInconsistent(String),
    /// Non-positive weight or a non-finite numeric argument.
    InvalidArgument(String),
}

impl fmt::Display for LimiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterError::BackendUnreachable(msg) => write!(f, "backend unreachable: {}", msg),
            LimiterError::BackendInconsistent(msg) => write!(f, "backend inconsistent: {}", msg),
            LimiterError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for LimiterError {}

impl From<redis::RedisError> for LimiterError {
    fn from(e: redis::RedisError) -> Self {
        LimiterError::BackendUnreachable(e.to_string())
    }
}
