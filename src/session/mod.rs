//! Session Module
//!
//! Drives the host key check of each connection attempt:
//! - One blocking execution context and one ticket per attempt
//! - Decision timeout and external cancellation
//! - Result events for the frontend

pub mod coordinator;

pub use coordinator::{
    AttemptCanceller, AuthAttempt, SessionCoordinator, DEFAULT_DECISION_TIMEOUT,
};
