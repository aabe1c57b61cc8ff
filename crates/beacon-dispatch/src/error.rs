use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("destination responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("dispatch queue is closed")]
    QueueClosed,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("webhook registry: {0}")]
    Registry(#[from] anyhow::Error),
}
