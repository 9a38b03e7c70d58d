//! russh client handler that routes host key checks through the gate

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{PublicKey, PublicKeyBase64};
use tracing::{debug, info};

use super::error::TrustError;
use super::gate::HostKeyRequest;
use super::known_hosts::KnownHostsStore;
use crate::session::SessionCoordinator;

/// Client handler for russh callbacks
///
/// `check_server_key` suspends the handshake until the coordinator's
/// attempt finishes; any gate failure becomes the connection's error verbatim.
pub struct GateHandler {
    coordinator: Arc<SessionCoordinator>,
    /// Known hosts pattern for the target
    host: String,
    remote_address: String,
}

impl GateHandler {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        host: &str,
        port: u16,
        remote_address: String,
    ) -> Self {
        Self {
            coordinator,
            host: KnownHostsStore::host_pattern(host, port),
            remote_address,
        }
    }
}

/// Build the gate request for a server key
pub fn host_key_request(host: &str, remote_address: &str, key: &PublicKey) -> HostKeyRequest {
    HostKeyRequest {
        host: host.to_string(),
        remote_address: remote_address.to_string(),
        key_type: key.algorithm().as_str().to_string(),
        key_material: key.public_key_bytes(),
    }
}

impl client::Handler for GateHandler {
    type Error = TrustError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let request = host_key_request(&self.host, &self.remote_address, server_public_key);
        self.coordinator.authenticate(request).await?;
        Ok(true)
    }
}

/// Run the SSH handshake against host:port with host key verification
///
/// Returns the handle ready for user authentication, which is up to the caller.
pub async fn connect_verified(
    coordinator: Arc<SessionCoordinator>,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<client::Handle<GateHandler>, TrustError> {
    let addr = format!("{}:{}", host, port);

    info!("Connecting to SSH server at {}", addr);

    let socket_addr = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| TrustError::Transport(format!("Failed to resolve address: {}", e)))?
        .next()
        .ok_or_else(|| TrustError::Transport(format!("No address found for {}", addr)))?;

    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };

    let handler = GateHandler::new(coordinator, host, port, socket_addr.to_string());

    // Dropping the connect future on timeout drops the attempt, which cancels its ticket
    let handle = tokio::time::timeout(
        timeout,
        client::connect(Arc::new(ssh_config), socket_addr, handler),
    )
    .await
    .map_err(|_| TrustError::Transport(format!("Connection to {} timed out", addr)))??;

    debug!("SSH handshake with {} completed", addr);
    Ok(handle)
}
