use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("request aborted")]
    Aborted,
    #[error("model API returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("model API request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed model API payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("model returned no choices")]
    EmptyResponse,
    #[error("settings unavailable: {0:#}")]
    Settings(anyhow::Error),
}
