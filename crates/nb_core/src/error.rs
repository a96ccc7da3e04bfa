use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Analysis error: {0}")]
    Analysis(String),

    #[error("Clustering error: {0}")]
    Clustering(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("A run is already in progress")]
    RunInProgress,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("External error: {0}")]
    External(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
