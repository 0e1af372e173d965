use thiserror::Error;

#[derive(Error, Debug)]
pub enum CopilotError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Gemini API key is not configured")]
    NotConfigured,

    #[error("Upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No models available")]
    NoModels,
}

pub type CopilotResult<T> = Result<T, CopilotError>;
