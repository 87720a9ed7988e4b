//! russh client handler for gateway connections.

use russh::{client, keys};

/// Client handler that accepts all host keys.
///
/// The gateway talks to a fixed roster of hosts on a trusted network,
/// similar to `StrictHostKeyChecking=no` in OpenSSH configuration. Extend
/// with known_hosts verification before exposing to untrusted networks.
pub struct GatewayClientHandler;

impl client::Handler for GatewayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
