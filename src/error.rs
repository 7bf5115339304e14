use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Coordination store error: {0}")]
    Coordination(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Operation {operation} not allowed while job {id} is {status}")]
    Conflict {
        id: String,
        status: String,
        operation: String,
    },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ConveyorError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn conflict(id: impl ToString, status: impl ToString, operation: impl Into<String>) -> Self {
        Self::Conflict {
            id: id.to_string(),
            status: status.to_string(),
            operation: operation.into(),
        }
    }
}
