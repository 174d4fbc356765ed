//! Error types and handling for Gridshare
//!
//! Errors only ever surface at the edges (configuration loading, registry
//! I/O, setpoint application). The allocation cycle itself never fails: every
//! degraded input maps to a diagnosed outcome instead.

use thiserror::Error;

/// Result type alias for Gridshare operations
pub type Result<T> = std::result::Result<T, GridshareError>;

/// Main error type for Gridshare
#[derive(Debug, Error)]
pub enum GridshareError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Datapoint registry read/write errors
    #[error("Registry error: {message}")]
    Registry { message: String },

    /// Setpoint application errors
    #[error("Apply error: {message}")]
    Apply { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl GridshareError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        GridshareError::Config {
            message: message.into(),
        }
    }

    /// Create a new registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        GridshareError::Registry {
            message: message.into(),
        }
    }

    /// Create a new apply error
    pub fn apply<S: Into<String>>(message: S) -> Self {
        GridshareError::Apply {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>, M: Into<String>>(field: S, message: M) -> Self {
        GridshareError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new serialization error
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        GridshareError::Serialization {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        GridshareError::Io {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GridshareError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        GridshareError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for GridshareError {
    fn from(err: std::io::Error) -> Self {
        GridshareError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for GridshareError {
    fn from(err: serde_yaml::Error) -> Self {
        GridshareError::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for GridshareError {
    fn from(err: serde_json::Error) -> Self {
        GridshareError::serialization(err.to_string())
    }
}

impl From<chrono::ParseError> for GridshareError {
    fn from(err: chrono::ParseError) -> Self {
        GridshareError::validation("datetime", err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for GridshareError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GridshareError::timeout(err.to_string())
    }
}
