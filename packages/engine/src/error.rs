use common::ScheduleError;
use sea_orm::DbErr;

/// Errors surfaced by the plan and DLQ services.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid plan parameters. Nothing was persisted.
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("{0} not found")]
    NotFound(String),
    /// The requested transition does not apply to the current status.
    #[error("{0}")]
    InvalidState(String),
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

pub type EngineResult<T> = Result<T, EngineError>;
