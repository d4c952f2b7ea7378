//! Configuration Error Types
//!
//! Errors raised while layering, deserializing and validating [`super::DmConfig`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// A layer could not be read or merged
    #[error("Failed to load configuration from {source_name}: {error}")]
    LoadError { source_name: String, error: String },

    /// The merged configuration did not match the expected shape
    #[error("Failed to deserialize configuration: {0}")]
    DeserializationError(String),

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// A distributor config references a kind nobody registered
    #[error("Unknown distributor kind '{kind}' for configuration '{name}'")]
    UnknownDistributorKind { name: String, kind: String },
}

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
