//! Session Coordinator
//!
//! Drives the host key check of one connection attempt end to end. Each
//! attempt runs the blocking gate on its own `spawn_blocking` thread and owns
//! its own ticket, so a prompt left unanswered for one host never holds up
//! another.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigStorage, TrustConfig};
use crate::ssh::{
    AuthenticationGate, ConnectResult, DecisionBroker, GatePolicy, HostKeyRequest,
    HostKeyResultEvent, KnownHostsStore, PromptReceiver, TicketId, TrustError,
};

/// Channel capacity for result broadcasts
const RESULT_BROADCAST_CAPACITY: usize = 64;

/// Default wait for an operator decision (same as keyboard-interactive prompts)
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SessionCoordinator {
    gate: Arc<AuthenticationGate>,
    broker: Arc<DecisionBroker>,
    decision_timeout: Duration,
    results: broadcast::Sender<HostKeyResultEvent>,
}

impl SessionCoordinator {
    pub fn new(
        gate: Arc<AuthenticationGate>,
        broker: Arc<DecisionBroker>,
        decision_timeout: Duration,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULT_BROADCAST_CAPACITY);
        Self {
            gate,
            broker,
            decision_timeout,
            results,
        }
    }

    /// Open the configured store and wire broker and gate together
    pub fn from_config(config: &TrustConfig) -> Result<(Self, PromptReceiver), TrustError> {
        config.validate()?;
        let store = Arc::new(KnownHostsStore::open(config.known_hosts_path())?);
        let (broker, prompt_rx) = DecisionBroker::new();
        let broker = Arc::new(broker);
        let gate = Arc::new(AuthenticationGate::new(
            store,
            broker.clone(),
            GatePolicy {
                auto_accept_unknown: config.auto_accept_unknown,
                rejection_policy: config.rejection_policy,
            },
        ));

        Ok((
            Self::new(gate, broker, config.decision_timeout()),
            prompt_rx,
        ))
    }

    /// Load the trust config from `storage` and build from it
    pub async fn load(storage: &ConfigStorage) -> Result<(Self, PromptReceiver), TrustError> {
        let config = storage.load().await?;
        info!(
            "Trust config loaded from {:?} (auto-accept: {}, decision timeout: {}s)",
            storage.path(),
            config.auto_accept_unknown,
            config.decision_timeout_secs
        );
        Self::from_config(&config)
    }

    /// `load` from `~/.hostkey-gate/trust.json`
    pub async fn load_default() -> Result<(Self, PromptReceiver), TrustError> {
        Self::load(&ConfigStorage::new()?).await
    }

    pub fn broker(&self) -> &Arc<DecisionBroker> {
        &self.broker
    }

    pub fn gate(&self) -> &Arc<AuthenticationGate> {
        &self.gate
    }

    /// Subscribe to terminal results of every attempt
    pub fn subscribe_results(&self) -> broadcast::Receiver<HostKeyResultEvent> {
        self.results.subscribe()
    }

    /// Start the host key check for one attempt
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin(&self, request: HostKeyRequest) -> AuthAttempt {
        let ticket_id = TicketId::new();
        let token = CancellationToken::new();
        let host = request.host.clone();

        debug!("Starting host key check for {} (ticket {})", host, ticket_id);

        let task = {
            let gate = self.gate.clone();
            let ticket_id = ticket_id.clone();
            let token = token.clone();
            tokio::task::spawn_blocking(move || gate.authenticate(ticket_id, &request, &token))
        };

        AuthAttempt {
            host,
            canceller: AttemptCanceller {
                ticket_id,
                token,
                broker: self.broker.clone(),
            },
            task,
            decision_timeout: self.decision_timeout,
            results: self.results.clone(),
            finished: false,
        }
    }

    /// Run one attempt to completion
    pub async fn authenticate(&self, request: HostKeyRequest) -> Result<(), TrustError> {
        self.begin(request).finish().await
    }
}

/// Cancels one attempt from anywhere (UI navigation, connection timeout)
#[derive(Clone)]
pub struct AttemptCanceller {
    ticket_id: TicketId,
    token: CancellationToken,
    broker: Arc<DecisionBroker>,
}

impl AttemptCanceller {
    pub fn ticket_id(&self) -> &TicketId {
        &self.ticket_id
    }

    /// Token first, then ticket: a gate that issues after this still sees the token
    pub fn cancel(&self) {
        self.token.cancel();
        self.broker.cancel(&self.ticket_id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One in-flight attempt
///
/// Dropping an unfinished attempt cancels it.
pub struct AuthAttempt {
    host: String,
    canceller: AttemptCanceller,
    task: JoinHandle<Result<(), TrustError>>,
    decision_timeout: Duration,
    results: broadcast::Sender<HostKeyResultEvent>,
    finished: bool,
}

impl AuthAttempt {
    pub fn ticket_id(&self) -> &TicketId {
        self.canceller.ticket_id()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn canceller(&self) -> AttemptCanceller {
        self.canceller.clone()
    }

    /// Wait for the gate's terminal outcome
    pub async fn finish(mut self) -> Result<(), TrustError> {
        let outcome = match tokio::time::timeout(self.decision_timeout, &mut self.task).await {
            Ok(joined) => self.flatten(joined),
            Err(_) => {
                warn!(
                    "No host key decision for {} within {}s, cancelling",
                    self.host,
                    self.decision_timeout.as_secs()
                );
                self.canceller.cancel();
                let joined = (&mut self.task).await;
                match self.flatten(joined) {
                    Err(TrustError::Cancelled { host, .. }) => Err(TrustError::Cancelled {
                        host,
                        reason: format!(
                            "no decision within {}s",
                            self.decision_timeout.as_secs()
                        ),
                    }),
                    other => other,
                }
            }
        };
        self.finished = true;

        let result = ConnectResult::of(&outcome);
        match &outcome {
            Ok(()) => info!("Host key check for {} succeeded", self.host),
            Err(e) => warn!("Host key check for {} failed: {}", self.host, e),
        }
        let _ = self.results.send(HostKeyResultEvent {
            ticket_id: self.canceller.ticket_id.clone(),
            host: self.host.clone(),
            result,
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });

        outcome
    }

    fn flatten(
        &self,
        joined: Result<Result<(), TrustError>, tokio::task::JoinError>,
    ) -> Result<(), TrustError> {
        joined.unwrap_or_else(|e| {
            error!("Host key check task for {} failed: {}", self.host, e);
            Err(TrustError::Cancelled {
                host: self.host.clone(),
                reason: format!("host key check task failed: {}", e),
            })
        })
    }
}

impl Drop for AuthAttempt {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Attempt for {} dropped before finishing, cancelling", self.host);
            self.canceller.cancel();
        }
    }
}
