use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("visit not found at {timestamp}")]
    VisitNotFound { timestamp: DateTime<Utc> },
}

pub type StatsResult<T> = Result<T, StatsError>;
