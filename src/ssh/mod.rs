//! SSH module - host key trust decisions
//!
//! # Features
//! - Known hosts store (`host keyType base64`) with serialized appends
//! - SHA256 host key fingerprints
//! - Blocking authentication gate with suspend/resume on unknown keys
//! - Per-attempt ticket broker between the gate and the UI
//! - russh client handler wiring the gate into the SSH handshake

mod client;
mod error;
pub mod fingerprint;
pub mod gate;
pub mod host_key_prompt;
pub mod known_hosts;

pub use client::{connect_verified, host_key_request, GateHandler};
pub use error::{ConnectResult, TrustError};
pub use fingerprint::fingerprint;
pub use gate::{AuthenticationGate, GatePolicy, HostKeyRequest, RejectionPolicy};
pub use host_key_prompt::{
    Decision, DecisionBroker, HostKeyCancelRequest, HostKeyPromptEvent, HostKeyResultEvent,
    PendingAuthentication, PromptEvent, PromptReceiver, Ticket, TicketId, Verdict,
    EVENT_HOST_KEY_PROMPT, EVENT_HOST_KEY_RESULT,
};
pub use known_hosts::{
    default_known_hosts_path, AppendOutcome, HostKeyMatch, KnownHostsStore, TrustRecord,
};
