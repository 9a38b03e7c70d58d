//! Trust configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::StorageError;
use crate::session::DEFAULT_DECISION_TIMEOUT;
use crate::ssh::{default_known_hosts_path, RejectionPolicy};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Host key trust settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Known hosts file (default: ~/.ssh/known_hosts)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<PathBuf>,

    /// Trust unknown host keys without asking.
    /// Degraded-security mode; changed keys are still refused.
    #[serde(default)]
    pub auto_accept_unknown: bool,

    /// Whether a rejected key is asked about again on retry
    #[serde(default)]
    pub rejection_policy: RejectionPolicy,

    /// How long an attempt waits for the operator before cancelling
    #[serde(default = "default_decision_timeout_secs")]
    pub decision_timeout_secs: u64,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_decision_timeout_secs() -> u64 {
    DEFAULT_DECISION_TIMEOUT.as_secs()
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            known_hosts_path: None,
            auto_accept_unknown: false,
            rejection_policy: RejectionPolicy::default(),
            decision_timeout_secs: default_decision_timeout_secs(),
        }
    }
}

impl TrustConfig {
    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts_path
            .clone()
            .unwrap_or_else(default_known_hosts_path)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }

    /// Reject settings that would make every prompt unanswerable
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.decision_timeout_secs == 0 {
            return Err(StorageError::Invalid(
                "decisionTimeoutSecs must be at least 1".to_string(),
            ));
        }
        if self
            .known_hosts_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err(StorageError::Invalid(
                "knownHostsPath must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
