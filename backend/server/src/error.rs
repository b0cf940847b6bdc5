use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::{
    certificates::{IssueError, LifecycleError},
    store::StoreError,
};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed payload")]
    MalformedPayload,

    #[error(transparent)]
    Issue(#[from] IssueError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::Issue(err) => match err {
                IssueError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                IssueError::CourseNotFound(_) => StatusCode::NOT_FOUND,
                IssueError::Duplicate { .. } | IssueError::PartitionExhausted { .. } => {
                    StatusCode::CONFLICT
                }
                IssueError::Allocation(_) | IssueError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Lifecycle(err) => match err {
                LifecycleError::Malformed => StatusCode::BAD_REQUEST,
                LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
                LifecycleError::InvalidTransition { .. }
                | LifecycleError::Duplicate
                | LifecycleError::Conflict => StatusCode::CONFLICT,
                LifecycleError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // store details stay in the logs, the public endpoints included
        if status.is_server_error() {
            error!(error = %self, "request failed");
            return (status, "Service temporarily unavailable").into_response();
        }

        (status, self.to_string()).into_response()
    }
}
