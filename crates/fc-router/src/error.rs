use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("pool error: {0}")]
    Pool(String),

    #[error("pool limit reached: {current}/{max}")]
    PoolLimit { current: usize, max: usize },

    #[error("queue error: {0}")]
    Queue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
