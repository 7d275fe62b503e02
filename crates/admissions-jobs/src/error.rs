use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {queue}/{id}")]
    NotFound { queue: String, id: String },

    /// The claim that tried to finish the job no longer holds it (its lease
    /// expired and the job was requeued, failed or claimed again).
    #[error("Lease lost on job {queue}/{id}")]
    LeaseLost { queue: String, id: String },

    #[error("Corrupt job record {0}: {1}")]
    Corrupt(String, String),

    #[error("No handler registered for queue {0}")]
    NoHandler(String),

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),
}

pub type JobResult<T> = Result<T, JobError>;
