use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PyramidError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Level {level} incomplete: wrote {written} of {expected} tiles")]
    LevelIncomplete {
        level: usize,
        written: usize,
        expected: usize,
    },

    #[error("Pyramid generation stalled: no completion after {0:?}")]
    Stalled(Duration),

    #[error("Worker task failed: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, PyramidError>;

impl PyramidError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PyramidError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for PyramidError {
    fn from(err: tokio::task::JoinError) -> Self {
        PyramidError::Join(err.to_string())
    }
}

// Convert to HTTP status codes for API responses
impl From<&PyramidError> for axum::http::StatusCode {
    fn from(err: &PyramidError) -> Self {
        use axum::http::StatusCode;
        match err {
            PyramidError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PyramidError::Stalled(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
