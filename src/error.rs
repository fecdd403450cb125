use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid input `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("Simulation cancelled after {completed} of {requested} paths")]
    Cancelled { completed: usize, requested: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SimError::InvalidInput { field, reason: reason.into() }
    }
}

pub type SimResult<T> = Result<T, SimError>;
