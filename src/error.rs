use thiserror::Error;

#[derive(Error, Debug)]
pub enum KubeDiagError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid phase transition from {from:?} to {to:?}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Processor response rejected: {0}")]
    ProcessorResponseInvalid(String),

    #[error("{stage} stage exhausted all candidate processors")]
    StageExhausted { stage: String },

    #[error("Diagnosis not found: {0}/{1}")]
    NotFound(String, String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KubeDiagError>;
