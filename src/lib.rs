//! hostkey-gate - interactive SSH host key trust decisions
//!
//! When a server presents a host key that isn't in the known hosts store,
//! the connection attempt is suspended, the key is surfaced to the operator,
//! and the attempt resumes or aborts on their answer. Changed keys are never
//! prompted for; they fail the attempt outright.

pub mod config;
pub mod session;
pub mod ssh;
pub mod ui;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::TrustConfig;
pub use session::SessionCoordinator;
pub use ssh::{ConnectResult, Decision, DecisionBroker, TrustError};
pub use ui::DecisionSurface;

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
