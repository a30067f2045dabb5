//! Error types for the runtime.

use thiserror::Error;

/// Errors raised while driving a dataflow.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Structural or consistency error from the engine
    #[error(transparent)]
    Engine(#[from] eddy_core::Error),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed YAML configuration
    #[error("invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Checkpoint could not be encoded or decoded
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checkpoint storage failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A source, sink or subscription names an unknown table
    #[error("unknown {kind}: {name}")]
    UnknownTable { kind: &'static str, name: String },

    /// Two sources registered under the same name or input
    #[error("duplicate source: {0}")]
    DuplicateSource(String),

    /// Ingress changes were rejected in strict mode
    #[error("rejected {count} change(s) on input {input}: {reason}")]
    IngressRejected {
        input: String,
        count: usize,
        reason: String,
    },

    /// A connector failed
    #[error("connector {name} failed: {message}")]
    Connector { name: String, message: String },

    /// An async worker went away before reporting its result
    #[error("async transformer channel closed")]
    ChannelClosed,
}

impl RuntimeError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn connector(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connector {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
