/// Error kinds for the bridge.
///
/// Every failure surfaced by a component maps onto one of these categories.
/// Variants carry the human-readable message; library errors are folded in
/// at the conversion boundary so callers match on the category, not the
/// underlying crate.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::Storage(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for BridgeError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        BridgeError::Broker(err.to_string())
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Http(err.to_string())
    }
}

impl From<serde_yaml::Error> for BridgeError {
    fn from(err: serde_yaml::Error) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
