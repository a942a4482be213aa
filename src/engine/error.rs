use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A booking already occupies this date under the rule.
    DateAlreadyBooked(NaiveDate),
    SkipDateExists(NaiveDate),
    SkipDateNotFound(NaiveDate),
    /// Service still referenced by at least one rule.
    ServiceInUse(Ulid),
    InvalidRule(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::DateAlreadyBooked(date) => {
                write!(f, "booking already exists on {date}")
            }
            EngineError::SkipDateExists(date) => write!(f, "skip date already set: {date}"),
            EngineError::SkipDateNotFound(date) => write!(f, "skip date not found: {date}"),
            EngineError::ServiceInUse(id) => {
                write!(f, "cannot delete service {id}: referenced by rules")
            }
            EngineError::InvalidRule(msg) => write!(f, "invalid rule: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
