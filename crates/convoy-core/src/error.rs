use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service initialization failed: {0}")]
    ServiceInit(String),

    #[error("Missing configuration for billing: {0}")]
    ConfigMissing(String),

    #[error("Key/value store error: {0}")]
    Kv(String),

    #[error("Storage gateway error: {0}")]
    Storage(String),

    #[error("Secrets gateway error: {0}")]
    Secrets(String),

    #[error("Model provider error: {0}")]
    Provider(String),

    #[error("Skill error ({app_id}.{skill_id}): {reason}")]
    Skill {
        app_id: String,
        skill_id: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// Short stable error code string sent to clients and used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            ConvoyError::Config(_) => "CONFIG_ERROR",
            ConvoyError::InvalidRequest(_) => "INVALID_REQUEST",
            ConvoyError::ServiceInit(_) => "SERVICE_INIT_FAILED",
            ConvoyError::ConfigMissing(_) => "BILLING_CONFIG_MISSING",
            ConvoyError::Kv(_) => "KV_ERROR",
            ConvoyError::Storage(_) => "STORAGE_ERROR",
            ConvoyError::Secrets(_) => "SECRETS_ERROR",
            ConvoyError::Provider(_) => "MODEL_PROVIDER_ERROR",
            ConvoyError::Skill { .. } => "SKILL_ERROR",
            ConvoyError::Serialization(_) => "SERIALIZATION_ERROR",
            ConvoyError::Io(_) => "IO_ERROR",
            ConvoyError::Timeout { .. } => "TIMEOUT",
            ConvoyError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
