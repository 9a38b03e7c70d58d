//! Host key trust error types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::StorageError;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Invalid host key: {0}")]
    InvalidKey(String),

    #[error(
        "HOST KEY VERIFICATION FAILED: {key_type} key for {host} has changed! \
         Expected: {expected_fingerprint}, Actual: {actual_fingerprint}. \
         This could indicate a man-in-the-middle attack. \
         If the key change is legitimate, remove the old entry from the known hosts file \
         and reconnect."
    )]
    KeyChanged {
        host: String,
        key_type: String,
        expected_fingerprint: String,
        actual_fingerprint: String,
    },

    #[error("Host key for {host} rejected by user (fingerprint: {fingerprint})")]
    UserRejected { host: String, fingerprint: String },

    #[error("Host key verification for {host} cancelled: {reason}")]
    Cancelled { host: String, reason: String },

    #[error("Known hosts store unavailable ({context}) at {path:?}: {source}")]
    StoreUnavailable {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to overwrite {key_type} key for {host}: a different key is already trusted")]
    Conflict { host: String, key_type: String },

    #[error("SSH transport error: {0}")]
    Transport(String),

    #[error("Trust config unusable: {0}")]
    Config(#[from] StorageError),
}

impl TrustError {
    /// Result code reported to the caller for this failure
    pub fn code(&self) -> ConnectResult {
        match self {
            TrustError::KeyChanged { .. } | TrustError::Conflict { .. } => {
                ConnectResult::KeyChanged
            }
            TrustError::UserRejected { .. } => ConnectResult::UserRejected,
            TrustError::Cancelled { .. } => ConnectResult::Cancelled,
            TrustError::StoreUnavailable { .. } => ConnectResult::StoreUnavailable,
            TrustError::InvalidKey(_) | TrustError::Transport(_) | TrustError::Config(_) => {
                ConnectResult::ConnectionFailed
            }
        }
    }
}

impl From<russh::Error> for TrustError {
    fn from(err: russh::Error) -> Self {
        TrustError::Transport(err.to_string())
    }
}

// Surface the message string, same as the command layer expects
impl Serialize for TrustError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Terminal result of one connection attempt's host key check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectResult {
    Success,
    UserRejected,
    Cancelled,
    /// Fatal, never promptable
    KeyChanged,
    StoreUnavailable,
    /// Failure outside the trust decision (transport, malformed key)
    ConnectionFailed,
}

impl ConnectResult {
    pub fn of(outcome: &Result<(), TrustError>) -> Self {
        match outcome {
            Ok(()) => ConnectResult::Success,
            Err(e) => e.code(),
        }
    }
}
