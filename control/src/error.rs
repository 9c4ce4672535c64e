use crate::controller::client::ClientError;
use common::KeyError;
use thiserror::Error;

/// Ingress manager control plane errors
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Malformed key {key:?}: {source}")]
    MalformedKey {
        key: String,
        #[source]
        source: KeyError,
    },

    #[error("Cluster client error: {0}")]
    Client(#[from] ClientError),

    #[error("Reconcile panicked: {0}")]
    ReconcilePanicked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Whether requeueing the key can fix this error
    ///
    /// A malformed key stays malformed, so it is dropped on first failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ControllerError::MalformedKey { .. } => false,
            ControllerError::Client(e) => e.is_retryable(),
            ControllerError::ReconcilePanicked(_) => true,
            ControllerError::Config(_) => false,
            ControllerError::Io(_) => true,
        }
    }
}
