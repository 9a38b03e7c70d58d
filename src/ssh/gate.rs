//! Authentication Gate
//!
//! The synchronous "is this host key trusted?" decision point. Trusted keys
//! pass straight through, changed keys fail immediately, and unknown keys
//! suspend the calling thread until the operator answers through the
//! [`DecisionBroker`].
//!
//! A changed key is never turned into a prompt: it is a security event, not
//! a trust decision.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::TrustError;
use super::fingerprint::fingerprint;
use super::host_key_prompt::{DecisionBroker, PendingAuthentication, TicketId, Verdict};
use super::known_hosts::{HostKeyMatch, KnownHostsStore};

/// What to do with a key the operator rejected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Prompt again on the next attempt
    #[default]
    Forget,
    /// Reject the same key without prompting for as long as the gate lives
    SuppressForSession,
}

/// Gate behaviour knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct GatePolicy {
    /// Degraded-security mode: trust unknown keys without asking
    pub auto_accept_unknown: bool,
    pub rejection_policy: RejectionPolicy,
}

/// Host key presented by the transport for one connection attempt
#[derive(Debug, Clone)]
pub struct HostKeyRequest {
    /// Known hosts pattern, see [`KnownHostsStore::host_pattern`]
    pub host: String,
    pub remote_address: String,
    pub key_type: String,
    pub key_material: Vec<u8>,
}

/// (host, key_type, fingerprint)
type RejectedKey = (String, String, String);

pub struct AuthenticationGate {
    store: Arc<KnownHostsStore>,
    broker: Arc<DecisionBroker>,
    policy: GatePolicy,
    rejected: DashSet<RejectedKey>,
}

impl AuthenticationGate {
    pub fn new(store: Arc<KnownHostsStore>, broker: Arc<DecisionBroker>, policy: GatePolicy) -> Self {
        if policy.auto_accept_unknown {
            warn!("Host key gate running with auto-accept of unknown keys enabled");
        }
        Self {
            store,
            broker,
            policy,
            rejected: DashSet::new(),
        }
    }

    pub fn store(&self) -> &Arc<KnownHostsStore> {
        &self.store
    }

    /// Decide whether the presented key may be used
    ///
    /// Blocks the calling thread while an unknown key awaits a decision.
    /// `ticket_id` is used only if a prompt is needed; cancelling `cancel`
    /// and then the ticket unblocks the wait with [`TrustError::Cancelled`].
    pub fn authenticate(
        &self,
        ticket_id: TicketId,
        request: &HostKeyRequest,
        cancel: &CancellationToken,
    ) -> Result<(), TrustError> {
        let actual_fingerprint = fingerprint(&request.key_material)?;

        match self
            .store
            .matches(&request.host, &request.key_type, &request.key_material)
        {
            HostKeyMatch::Trusted => {
                info!(
                    "Host key verified for {} (type: {})",
                    request.host, request.key_type
                );
                Ok(())
            }
            HostKeyMatch::Conflicting {
                expected_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    request.host, request.key_type, expected_fingerprint, actual_fingerprint
                );
                Err(TrustError::KeyChanged {
                    host: request.host.clone(),
                    key_type: request.key_type.clone(),
                    expected_fingerprint,
                    actual_fingerprint,
                })
            }
            HostKeyMatch::Unknown => {
                self.resolve_unknown(ticket_id, request, actual_fingerprint, cancel)
            }
        }
    }

    fn resolve_unknown(
        &self,
        ticket_id: TicketId,
        request: &HostKeyRequest,
        fingerprint: String,
        cancel: &CancellationToken,
    ) -> Result<(), TrustError> {
        if self.policy.auto_accept_unknown {
            warn!(
                "Auto-accepting unknown host key for {} (type: {}, fingerprint: {})",
                request.host, request.key_type, fingerprint
            );
            return self.trust(request);
        }

        let rejected_key = (
            request.host.clone(),
            request.key_type.clone(),
            fingerprint.clone(),
        );
        if self.rejected.contains(&rejected_key) {
            info!(
                "Host key for {} was rejected earlier this session, not prompting again",
                request.host
            );
            return Err(TrustError::UserRejected {
                host: request.host.clone(),
                fingerprint,
            });
        }

        if cancel.is_cancelled() {
            return Err(self.cancelled(request));
        }

        info!(
            "Unknown host {} (type: {}, fingerprint: {}), awaiting decision",
            request.host, request.key_type, fingerprint
        );

        let ticket = self.broker.issue(PendingAuthentication {
            ticket_id,
            host: request.host.clone(),
            remote_address: request.remote_address.clone(),
            key_type: request.key_type.clone(),
            fingerprint: fingerprint.clone(),
            key_material: request.key_material.clone(),
            issued_at: Utc::now(),
        })?;

        // A cancel that raced issuance may have missed the registry
        if cancel.is_cancelled() {
            self.broker.cancel(ticket.id());
        }

        match ticket.wait() {
            Verdict::Decided { accepted: true } => self.trust(request),
            Verdict::Decided { accepted: false } => {
                warn!("Host key for {} rejected by user", request.host);
                if self.policy.rejection_policy == RejectionPolicy::SuppressForSession {
                    self.rejected.insert(rejected_key);
                }
                Err(TrustError::UserRejected {
                    host: request.host.clone(),
                    fingerprint,
                })
            }
            Verdict::Cancelled => Err(self.cancelled(request)),
        }
    }

    fn trust(&self, request: &HostKeyRequest) -> Result<(), TrustError> {
        self.store
            .append(&request.host, &request.key_type, &request.key_material)
            .map(|_| ())
    }

    fn cancelled(&self, request: &HostKeyRequest) -> TrustError {
        TrustError::Cancelled {
            host: request.host.clone(),
            reason: "connection attempt abandoned before a decision".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::host_key_prompt::{Decision, PromptEvent, PromptReceiver};
    use crate::ssh::ConnectResult;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    const M1: &[u8] = b"db1-ed25519-material-M1";
    const M2: &[u8] = b"db1-ed25519-material-M2";

    struct Fixture {
        _dir: TempDir,
        gate: Arc<AuthenticationGate>,
        broker: Arc<DecisionBroker>,
        rx: PromptReceiver,
    }

    fn fixture(policy: GatePolicy) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(KnownHostsStore::open(dir.path().join("known_hosts")).unwrap());
        let (broker, rx) = DecisionBroker::new();
        let broker = Arc::new(broker);
        let gate = Arc::new(AuthenticationGate::new(store, broker.clone(), policy));
        Fixture {
            _dir: dir,
            gate,
            broker,
            rx,
        }
    }

    fn request(material: &[u8]) -> HostKeyRequest {
        HostKeyRequest {
            host: "db1".to_string(),
            remote_address: "10.0.0.5:22".to_string(),
            key_type: "ssh-ed25519".to_string(),
            key_material: material.to_vec(),
        }
    }

    fn spawn_gate(
        gate: &Arc<AuthenticationGate>,
        req: HostKeyRequest,
        cancel: CancellationToken,
    ) -> (TicketId, thread::JoinHandle<Result<(), TrustError>>) {
        let gate = gate.clone();
        let ticket_id = TicketId::new();
        let id = ticket_id.clone();
        let handle = thread::spawn(move || gate.authenticate(id, &req, &cancel));
        (ticket_id, handle)
    }

    fn next_prompt(rx: &mut PromptReceiver) -> PendingAuthentication {
        match rx.blocking_recv().unwrap() {
            PromptEvent::Prompt(p) => p,
            other => panic!("expected prompt, got {:?}", other),
        }
    }

    #[test]
    fn test_accept_unknown_key_persists() {
        let mut fx = fixture(GatePolicy::default());
        let (ticket_id, handle) =
            spawn_gate(&fx.gate, request(M1), CancellationToken::new());

        let prompt = next_prompt(&mut fx.rx);
        assert_eq!(prompt.ticket_id, ticket_id);
        assert_eq!(prompt.host, "db1");
        assert_eq!(prompt.fingerprint, fingerprint(M1).unwrap());

        assert!(fx.broker.resolve(&Decision {
            ticket_id,
            accepted: true
        }));
        handle.join().unwrap().unwrap();

        let record = fx.gate.store().lookup("db1", "ssh-ed25519").unwrap();
        assert_eq!(record.key_material, M1);
        assert_eq!(fx.broker.pending_count(), 0);
    }

    #[test]
    fn test_second_accepted_key_conflicts() {
        let mut fx = fixture(GatePolicy::default());
        let (_, first) = spawn_gate(&fx.gate, request(M1), CancellationToken::new());
        let (_, second) = spawn_gate(&fx.gate, request(M2), CancellationToken::new());

        // Both attempts see an unknown host and wait on their own ticket
        let mut prompts = vec![next_prompt(&mut fx.rx), next_prompt(&mut fx.rx)];
        prompts.sort_by_key(|p| p.key_material != M1);
        let (for_m1, for_m2) = (prompts.remove(0), prompts.remove(0));

        assert!(fx.broker.resolve(&Decision {
            ticket_id: for_m1.ticket_id,
            accepted: true
        }));
        first.join().unwrap().unwrap();

        assert!(fx.broker.resolve(&Decision {
            ticket_id: for_m2.ticket_id,
            accepted: true
        }));
        let err = second.join().unwrap().unwrap_err();
        assert!(matches!(err, TrustError::Conflict { .. }));
        assert_eq!(err.code(), ConnectResult::KeyChanged);

        assert_eq!(
            fx.gate.store().matches("db1", "ssh-ed25519", M1),
            HostKeyMatch::Trusted
        );
        let content = std::fs::read_to_string(fx.gate.store().path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn test_accepted_key_on_unwritable_store() {
        let mut fx = fixture(GatePolicy::default());
        // The file location turns into a directory after the store was opened
        std::fs::create_dir(fx.gate.store().path()).unwrap();

        let (ticket_id, handle) =
            spawn_gate(&fx.gate, request(M1), CancellationToken::new());
        next_prompt(&mut fx.rx);
        assert!(fx.broker.resolve(&Decision {
            ticket_id,
            accepted: true
        }));

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, TrustError::StoreUnavailable { .. }));
        assert_eq!(err.code(), ConnectResult::StoreUnavailable);
        assert!(fx.gate.store().is_empty());
        assert_eq!(
            fx.gate.store().matches("db1", "ssh-ed25519", M1),
            HostKeyMatch::Unknown
        );
    }

    #[test]
    fn test_trusted_key_never_prompts() {
        let mut fx = fixture(GatePolicy::default());
        fx.gate.store().append("db1", "ssh-ed25519", M1).unwrap();

        fx.gate
            .authenticate(TicketId::new(), &request(M1), &CancellationToken::new())
            .unwrap();
        assert!(fx.rx.try_recv().is_err());
    }

    #[test]
    fn test_changed_key_is_fatal_without_prompt() {
        let mut fx = fixture(GatePolicy::default());
        fx.gate.store().append("db1", "ssh-ed25519", M1).unwrap();

        let err = fx
            .gate
            .authenticate(TicketId::new(), &request(M2), &CancellationToken::new())
            .unwrap_err();

        match &err {
            TrustError::KeyChanged {
                host,
                expected_fingerprint,
                actual_fingerprint,
                ..
            } => {
                assert_eq!(host, "db1");
                assert_eq!(expected_fingerprint, &fingerprint(M1).unwrap());
                assert_eq!(actual_fingerprint, &fingerprint(M2).unwrap());
            }
            other => panic!("expected KeyChanged, got {:?}", other),
        }
        assert_eq!(err.code(), ConnectResult::KeyChanged);
        assert!(fx.rx.try_recv().is_err());
        assert_eq!(fx.broker.pending_count(), 0);
        assert_eq!(
            fx.gate.store().lookup("db1", "ssh-ed25519").unwrap().key_material,
            M1
        );
    }

    #[test]
    fn test_changed_key_fatal_even_with_auto_accept() {
        let fx = fixture(GatePolicy {
            auto_accept_unknown: true,
            ..Default::default()
        });
        fx.gate.store().append("db1", "ssh-ed25519", M1).unwrap();

        let err = fx
            .gate
            .authenticate(TicketId::new(), &request(M2), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TrustError::KeyChanged { .. }));
    }

    #[test]
    fn test_reject_leaves_store_untouched() {
        let mut fx = fixture(GatePolicy::default());
        let (ticket_id, handle) =
            spawn_gate(&fx.gate, request(M1), CancellationToken::new());

        next_prompt(&mut fx.rx);
        fx.broker.resolve(&Decision {
            ticket_id,
            accepted: false,
        });

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, TrustError::UserRejected { .. }));
        assert!(fx.gate.store().lookup("db1", "ssh-ed25519").is_none());
    }

    #[test]
    fn test_cancel_before_decision() {
        let mut fx = fixture(GatePolicy::default());
        let (ticket_id, handle) =
            spawn_gate(&fx.gate, request(M1), CancellationToken::new());

        next_prompt(&mut fx.rx);
        assert!(fx.broker.cancel(&ticket_id));

        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.code(), ConnectResult::Cancelled);
        assert!(fx.gate.store().is_empty());
        // A late decision is dropped
        assert!(!fx.broker.resolve(&Decision {
            ticket_id,
            accepted: true
        }));
        assert!(fx.gate.store().is_empty());
    }

    #[test]
    fn test_already_cancelled_attempt_never_prompts() {
        let mut fx = fixture(GatePolicy::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .gate
            .authenticate(TicketId::new(), &request(M1), &cancel)
            .unwrap_err();
        assert!(matches!(err, TrustError::Cancelled { .. }));
        assert!(fx.rx.try_recv().is_err());
    }

    #[test]
    fn test_auto_accept_bypasses_broker() {
        let mut fx = fixture(GatePolicy {
            auto_accept_unknown: true,
            ..Default::default()
        });

        fx.gate
            .authenticate(TicketId::new(), &request(M1), &CancellationToken::new())
            .unwrap();
        assert!(fx.rx.try_recv().is_err());
        assert!(fx.gate.store().lookup("db1", "ssh-ed25519").is_some());
    }

    #[test]
    fn test_suppress_rejected_key_for_session() {
        let mut fx = fixture(GatePolicy {
            rejection_policy: RejectionPolicy::SuppressForSession,
            ..Default::default()
        });
        let (ticket_id, handle) =
            spawn_gate(&fx.gate, request(M1), CancellationToken::new());
        next_prompt(&mut fx.rx);
        fx.broker.resolve(&Decision {
            ticket_id,
            accepted: false,
        });
        handle.join().unwrap().unwrap_err();
        // Drain the withdrawal
        assert!(matches!(fx.rx.blocking_recv(), Some(PromptEvent::Withdrawn(_))));

        // Retry is rejected without a new prompt
        let err = fx
            .gate
            .authenticate(TicketId::new(), &request(M1), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TrustError::UserRejected { .. }));
        assert!(fx.rx.try_recv().is_err());
    }

    #[test]
    fn test_forget_policy_prompts_again() {
        let mut fx = fixture(GatePolicy::default());
        for _ in 0..2 {
            let (ticket_id, handle) =
                spawn_gate(&fx.gate, request(M1), CancellationToken::new());
            let prompt = next_prompt(&mut fx.rx);
            assert_eq!(prompt.ticket_id, ticket_id);
            fx.broker.resolve(&Decision {
                ticket_id,
                accepted: false,
            });
            handle.join().unwrap().unwrap_err();
            assert!(matches!(fx.rx.blocking_recv(), Some(PromptEvent::Withdrawn(_))));
        }
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let fx = fixture(GatePolicy::default());
        let err = fx
            .gate
            .authenticate(TicketId::new(), &request(&[]), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TrustError::InvalidKey(_)));
    }
}
