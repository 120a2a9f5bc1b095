use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("receipt not found: {0}")]
    ReceiptNotFound(String),

    #[error("consumer is stopped")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),
}
