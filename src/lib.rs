use std::{
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use anyhow::Context;
use log::info;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::{
    keys::{
        decode_secret_key,
        ssh_key::{private::Ed25519Keypair, LineEnding},
        PrivateKey,
    },
    server::{Config, Server as _},
};
use tokio::fs;

mod addressing;
pub mod auth;
mod config;
mod connection_handler;
mod endpoint;
mod error;
mod forwardings;
mod proxy;
mod ssh;

pub use auth::{AuthenticateRequest, Authenticator, AuthorizeRequest, Authorizer, Credentials};
pub use config::ApplicationConfig;
pub use proxy::{ProxyProvider, RendezvousDialer};

use crate::{
    addressing::RendezvousDirectory, error::ServerError, forwardings::ForwardingMap,
    ssh::SshServer,
};

// Data shared between all SSH connections and the proxy lookup interface.
pub struct SrpServer {
    // Directory holding the rendezvous socket of every registered endpoint.
    pub(crate) rendezvous: RendezvousDirectory,
    // Map of active endpoint registrations.
    pub(crate) forwardings: Arc<ForwardingMap>,
    // Optional policy hook for authentication attempts.
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    // Optional policy hook for forward-registration requests.
    pub(crate) authorizer: Option<Arc<dyn Authorizer>>,
    // Counter for assigning unique connection IDs.
    pub(crate) session_id: AtomicUsize,
}

impl SrpServer {
    /// Create the server state, materializing the rendezvous directory.
    pub fn new(
        config: &ApplicationConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> anyhow::Result<Self> {
        Ok(SrpServer {
            rendezvous: RendezvousDirectory::new(config.unix_directory.clone())?,
            forwardings: Arc::new(ForwardingMap::new()),
            authenticator,
            authorizer,
            session_id: AtomicUsize::new(0),
        })
    }

    /// Listen for SSH connections and serve until the listener fails.
    pub async fn listen(self: Arc<Self>, config: &ApplicationConfig) -> anyhow::Result<()> {
        // Find the private SSH key for the server or create a new one.
        let key = match fs::read_to_string(config.private_key_file.as_path()).await {
            Ok(key) => decode_secret_key(&key, None).with_context(|| "Error decoding secret key")?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                info!("Key file not found. Creating...");
                let key = PrivateKey::from(Ed25519Keypair::from_seed(
                    &ChaCha20Rng::from_os_rng().random(),
                ));
                fs::create_dir_all(
                    config
                        .private_key_file
                        .as_path()
                        .parent()
                        .ok_or(ServerError::InvalidFilePath)
                        .with_context(|| "Error parsing secret key path")?,
                )
                .await
                .with_context(|| "Error creating secret key directory")?;
                let key_string = key.to_openssh(LineEnding::LF)?;
                fs::write(config.private_key_file.as_path(), key_string.as_bytes())
                    .await
                    .with_context(|| "Error saving secret key to filesystem")?;
                key
            }
            Err(error) => return Err(error).with_context(|| "Error reading secret key"),
        };
        let ssh_config = Arc::new(Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![key],
            ..Default::default()
        });
        info!(
            "Listening for SSH connections on {}:{}",
            config.listen_address, config.ssh_port
        );
        let mut server = SshServer(self);
        server
            .run_on_address(ssh_config, (config.listen_address, config.ssh_port))
            .await
            .with_context(|| "Error listening to SSH port and address")?;
        Ok(())
    }
}

// Main entrypoint of the application.
pub async fn entrypoint(config: ApplicationConfig) -> anyhow::Result<()> {
    info!("Starting SRP server...");
    let server = Arc::new(SrpServer::new(&config, None, None)?);
    server.listen(&config).await
}
