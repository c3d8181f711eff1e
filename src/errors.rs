use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("invalid input table: {0}")]
    Input(String),
    #[error("upstream service error: {0}")]
    Upstream(String),
    #[error("rate limited by target; cooling down for {cooldown:?}")]
    RateLimited { cooldown: Duration },
    #[error("checkpoint store error: {0}")]
    Checkpoint(String),
}

impl AppError {
    /// Errors worth another attempt against the same listing. Anything else is
    /// a worker fault and is surfaced to the orchestrator as-is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Http(_)
                | AppError::Upstream(_)
                | AppError::Json(_)
                | AppError::RateLimited { .. }
        )
    }

    pub fn rate_limit_cooldown(&self) -> Option<Duration> {
        match self {
            AppError::RateLimited { cooldown } => Some(*cooldown),
            _ => None,
        }
    }
}
