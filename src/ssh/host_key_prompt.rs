//! Host Key Prompt Broker
//!
//! Routes "unknown host key" prompts to the UI and the operator's answer
//! back to the exact connection attempt that asked.
//!
//! # Architecture
//!
//! ```text
//! Gate (blocking thread)               Broker                     UI
//!    │                                   │                         │
//!    │──── issue(PendingAuthentication) ▶│ register oneshot        │
//!    │                                   │── PromptEvent::Prompt ─▶│
//!    │ blocking_recv()                   │                         │
//!    │                                   │◀──── resolve(Decision) ─│
//!    │◀─────────── Verdict ──────────────│── PromptEvent::Withdrawn▶│
//! ```
//!
//! Every ticket owns a single-slot channel. Removing the ticket from the
//! registry is what hands out the right to answer it, so a ticket is
//! answered at most once no matter how many resolves race.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::{ConnectResult, TrustError};

/// Event name for host key prompts
pub const EVENT_HOST_KEY_PROMPT: &str = "ssh_host_key_prompt";

/// Event name for host key results
pub const EVENT_HOST_KEY_RESULT: &str = "ssh_host_key_result";

/// Opaque handle correlating one suspended attempt with its decision
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TicketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One in-flight "unknown host key" event
#[derive(Debug, Clone)]
pub struct PendingAuthentication {
    pub ticket_id: TicketId,
    pub host: String,
    pub remote_address: String,
    pub key_type: String,
    pub fingerprint: String,
    pub key_material: Vec<u8>,
    pub issued_at: DateTime<Utc>,
}

/// Operator's answer: UI → Broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub ticket_id: TicketId,
    pub accepted: bool,
}

/// What the UI side receives from the broker
#[derive(Debug, Clone)]
pub enum PromptEvent {
    /// New prompt to show; published once per ticket
    Prompt(PendingAuthentication),
    /// Ticket resolved or cancelled; drop it if still shown
    Withdrawn(TicketId),
}

pub type PromptReceiver = mpsc::UnboundedReceiver<PromptEvent>;

/// What the waiting gate receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Decided { accepted: bool },
    Cancelled,
}

/// Event payload: Backend → Frontend
/// Renderable view of a pending prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyPromptEvent {
    pub ticket_id: TicketId,
    pub host: String,
    pub remote_address: String,
    pub key_type: String,
    pub fingerprint: String,
    /// Seconds since the prompt was issued
    pub waiting_secs: i64,
    pub warning: String,
}

impl HostKeyPromptEvent {
    pub fn from_pending(pending: &PendingAuthentication, now: DateTime<Utc>) -> Self {
        Self {
            ticket_id: pending.ticket_id.clone(),
            host: pending.host.clone(),
            remote_address: pending.remote_address.clone(),
            key_type: pending.key_type.clone(),
            fingerprint: pending.fingerprint.clone(),
            waiting_secs: (now - pending.issued_at).num_seconds().max(0),
            warning: format!(
                "The authenticity of host '{}' ({}) can't be established. \
                 This {} key has never been seen before. \
                 Verify the fingerprint out-of-band before accepting.",
                pending.host, pending.remote_address, pending.key_type
            ),
        }
    }
}

/// Event payload: Backend → Frontend
/// Sent when an attempt's host key check finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyResultEvent {
    pub ticket_id: TicketId,
    pub host: String,
    pub result: ConnectResult,
    /// Error message if failed
    pub error: Option<String>,
}

/// Command payload: Frontend → Backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyCancelRequest {
    pub ticket_id: TicketId,
}

/// Internal: delivery slot for one ticket
struct PendingTicket {
    host: String,
    sender: oneshot::Sender<Verdict>,
}

/// Issued ticket, held by the waiting gate
pub struct Ticket {
    id: TicketId,
    rx: oneshot::Receiver<Verdict>,
}

impl Ticket {
    pub fn id(&self) -> &TicketId {
        &self.id
    }

    /// Block the calling thread until the ticket is resolved or cancelled
    ///
    /// Must not be called from inside an async task; use `spawn_blocking`.
    pub fn wait(self) -> Verdict {
        self.rx.blocking_recv().unwrap_or(Verdict::Cancelled)
    }
}

/// Per-attempt routing of host key prompts and decisions
pub struct DecisionBroker {
    pending: DashMap<TicketId, PendingTicket>,
    prompt_tx: mpsc::UnboundedSender<PromptEvent>,
}

impl DecisionBroker {
    /// Create a broker and the receiving end for the UI
    pub fn new() -> (Self, PromptReceiver) {
        let (prompt_tx, prompt_rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: DashMap::new(),
                prompt_tx,
            },
            prompt_rx,
        )
    }

    /// Register a ticket and publish its prompt to the UI
    pub fn issue(&self, pending: PendingAuthentication) -> Result<Ticket, TrustError> {
        let id = pending.ticket_id.clone();
        let (tx, rx) = oneshot::channel();

        let host = pending.host.clone();

        // Register BEFORE publishing so a fast answer can't miss the slot
        let slot = match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!("Ticket {} already issued, refusing duplicate", id);
                return Err(TrustError::Cancelled {
                    host,
                    reason: format!("ticket {} already issued", id),
                });
            }
            Entry::Vacant(slot) => slot.insert(PendingTicket {
                host: host.clone(),
                sender: tx,
            }),
        };

        // Publish while the slot is still held: resolve/cancel block on the
        // shard, so their Withdrawn can never overtake this Prompt.
        let published = self.prompt_tx.send(PromptEvent::Prompt(pending)).is_ok();
        drop(slot);

        if !published {
            self.pending.remove(&id);
            warn!("No decision surface attached, cancelling ticket {}", id);
            return Err(TrustError::Cancelled {
                host,
                reason: "no decision surface attached".to_string(),
            });
        }

        info!("Issued host key ticket {} for {}", id, host);
        Ok(Ticket { id, rx })
    }

    /// Deliver a decision; unknown tickets are silently dropped
    pub fn resolve(&self, decision: &Decision) -> bool {
        let Some((id, ticket)) = self.pending.remove(&decision.ticket_id) else {
            debug!(
                "Dropping decision for unknown or resolved ticket {}",
                decision.ticket_id
            );
            return false;
        };

        info!(
            "Ticket {} for {} resolved: {}",
            id,
            ticket.host,
            if decision.accepted { "accepted" } else { "rejected" }
        );
        // Receiver gone means the gate already gave up
        let _ = ticket.sender.send(Verdict::Decided {
            accepted: decision.accepted,
        });
        let _ = self.prompt_tx.send(PromptEvent::Withdrawn(id));
        true
    }

    /// Abandon a ticket before a decision arrives
    pub fn cancel(&self, ticket_id: &TicketId) -> bool {
        let Some((id, ticket)) = self.pending.remove(ticket_id) else {
            return false;
        };

        info!("Ticket {} for {} cancelled", id, ticket.host);
        let _ = ticket.sender.send(Verdict::Cancelled);
        let _ = self.prompt_tx.send(PromptEvent::Withdrawn(id));
        true
    }

    pub fn is_pending(&self, ticket_id: &TicketId) -> bool {
        self.pending.contains_key(ticket_id)
    }

    /// Get count of pending tickets (for debugging/monitoring)
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
