use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Alert store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
