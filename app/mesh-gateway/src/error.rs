//! Error types for the mesh gateway

use thiserror::Error;

/// Failures across the registry, gateway and tracer
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Service discovery error: {0}")]
    ServiceDiscovery(String),

    /// The outbound request could not be built
    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Tracing error: {0}")]
    Tracing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Transport level failure talking to a backend
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Network(_) | GatewayError::Timeout(_))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        GatewayError::Configuration(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Network("refused".into()).is_transient());
        assert!(GatewayError::Timeout("5s".into()).is_transient());
        assert!(!GatewayError::Configuration("bad".into()).is_transient());
        assert!(!GatewayError::InvalidRequest("BAD METHOD".into()).is_transient());
    }

    #[test]
    fn test_toml_error_maps_to_configuration() {
        let err: GatewayError = toml::from_str::<toml::Value>("= broken").unwrap_err().into();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
