use ulid::Ulid;

use crate::tenant::AccessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidRange(&'static str),
    /// Absent, or owned by a tenant the caller cannot see.
    NotFound(Ulid),
    Forbidden,
    Unauthorized,
    /// Lock wait on the space exceeded the policy timeout.
    Busy(Ulid),
    InMaintenance(Ulid),
    AlreadyExists(Ulid),
    /// The sensor is already bound. The space is named only when the caller may see it.
    SensorInUse(Option<Ulid>),
    LimitExceeded(&'static str),
    Storage(String),
}

impl EngineError {
    /// Safe for the caller to retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::Storage(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden => write!(f, "forbidden"),
            EngineError::Unauthorized => write!(f, "unauthorized"),
            EngineError::Busy(id) => write!(f, "space {id} is busy, retry later"),
            EngineError::InMaintenance(id) => write!(f, "space {id} is under maintenance"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SensorInUse(Some(id)) => {
                write!(f, "sensor already assigned to space {id}")
            }
            EngineError::SensorInUse(None) => write!(f, "sensor already assigned"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<AccessError> for EngineError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::Unauthorized => EngineError::Unauthorized,
            AccessError::Forbidden => EngineError::Forbidden,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Storage(e.to_string())
    }
}
