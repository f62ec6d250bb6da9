use russh::client::Handler;
use russh::keys::PublicKey;

/// Client-side handler for russh sessions.
#[derive(Debug, Default)]
pub struct ClientHandler;

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Single-operator tool: accept all host keys, like
        // `ssh -o StrictHostKeyChecking=no`. This is the seam where
        // known_hosts verification would go.
        Ok(true)
    }
}
