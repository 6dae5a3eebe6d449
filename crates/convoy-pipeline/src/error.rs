use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("service initialization failed: {0}")]
    ServiceInit(String),

    #[error("billing preflight failed: {0}")]
    BillingPreflight(String),

    #[error("preprocessing failed: {0}")]
    Preprocessing(String),

    #[error("main processing failed: {0}")]
    MainProcessing(String),

    #[error("model provider error: {0}")]
    Provider(#[from] convoy_model::ProviderError),

    #[error("storage gateway error: {0}")]
    Storage(String),

    #[error("secrets gateway error: {0}")]
    Secrets(String),

    #[error("key/value store error: {0}")]
    Kv(#[from] convoy_kv::KvError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("hard time limit exceeded after {secs}s")]
    HardTimeLimit { secs: u64 },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
