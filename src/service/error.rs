use axum::http::StatusCode;

use crate::pipeline::{PipelineError, StageError};
use crate::store::StoreError;
use crate::task::{TaskError, TaskStatus};

/// Failure of a [`super::TaskService`] operation.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),

    #[error("Cannot {action} a task that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: TaskStatus,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("Storage error: {0}")]
    Store(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidTransition { .. } | ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ServiceError::Stage(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ServiceError::NotFound(err.to_string()),
            StoreError::Backend(message) => ServiceError::Store(message),
        }
    }
}

impl From<TaskError> for ServiceError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::InvalidTransition { from, .. } => ServiceError::InvalidTransition {
                action: "move",
                status: from,
            },
            TaskError::ProblemNotFound(_) => ServiceError::NotFound(err.to_string()),
        }
    }
}

impl From<PipelineError> for ServiceError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Stage(e) => ServiceError::Stage(e),
            PipelineError::Store(e) => e.into(),
            PipelineError::Task(e) => e.into(),
            PipelineError::Crashed(message) => ServiceError::Store(message),
        }
    }
}
