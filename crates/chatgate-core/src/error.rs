use std::path::PathBuf;

use crate::types::ProviderType;

/// Top-level error returned by the abstraction layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Credential error: {0}")]
    Credential(#[from] VaultError),

    #[error("All providers failed after {attempts} attempt(s). Last error: {last_error}")]
    Exhausted { attempts: usize, last_error: String },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Provider instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Provider instance is inactive: {0}")]
    InstanceInactive(String),

    #[error("No adapter registered for provider: {0}")]
    NoAdapter(ProviderType),
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("{operation} is not implemented for provider {provider}")]
    NotImplemented {
        provider: ProviderType,
        operation: &'static str,
    },

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } | Self::Unauthorized { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether resending the same request to the same credential could succeed.
    ///
    /// The fallback chain advances regardless; this is diagnostic only.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unauthorized { .. } | Self::NotImplemented { .. } | Self::Parse(_) => false,
            Self::RateLimited { .. } | Self::Stream(_) | Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Other(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("VAULT_MASTER_KEY not set or invalid (must be 64 hex chars)")]
    MasterKeyMissing,

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid credential blob: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_includes_last_error() {
        let err = GatewayError::Exhausted {
            attempts: 3,
            last_error: "API error (503): overloaded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("overloaded"));
    }

    #[test]
    fn test_provider_error_status() {
        let err = ProviderError::Unauthorized {
            status: 401,
            message: "bad key".into(),
        };
        assert_eq!(err.status(), Some(401));
        assert!(!err.is_retryable());

        let err = ProviderError::RateLimited {
            message: "slow down".into(),
            retry_after: Some(10),
        };
        assert_eq!(err.status(), Some(429));
        assert!(err.is_retryable());

        let err = ProviderError::Api {
            status: 502,
            message: "bad gateway".into(),
        };
        assert!(err.is_retryable());
        let err = ProviderError::Api {
            status: 400,
            message: "bad request".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_implemented_message() {
        let err = ProviderError::NotImplemented {
            provider: ProviderType::Google,
            operation: "streaming",
        };
        assert_eq!(
            err.to_string(),
            "streaming is not implemented for provider google"
        );
    }

    #[test]
    fn test_config_error_converts() {
        let err: GatewayError = ConfigError::InstanceNotFound("inst-1".into()).into();
        assert!(matches!(err, GatewayError::Config(_)));
        assert!(err.to_string().contains("inst-1"));
    }
}
