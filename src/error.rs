use thiserror::Error;

use crate::backend::BackendError;

/// Unified crate errors.
#[derive(Error, Debug)]
pub enum AprilError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Invalid session configuration: {0}")]
    Config(&'static str),

    #[error("Session limit reached ({0} concurrent sessions)")]
    SessionLimit(usize),

    #[error("Backend: {0}")]
    Backend(#[from] BackendError),
}
