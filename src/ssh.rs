use std::{net::SocketAddr, sync::atomic::Ordering, sync::Arc};

use async_trait::async_trait;
use log::{error, info, warn};
use russh::{
    keys::PublicKey,
    server::{Auth, Handler, Msg, Session},
    Channel, ChannelStream, MethodKind, MethodSet,
};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::{
    addressing::parse_bind_address,
    auth::{AuthenticateRequest, AuthorizeRequest, Credentials},
    connection_handler::ConnectionHandler,
    endpoint::serve_endpoint,
    error::ServerError,
    SrpServer,
};

// Struct for opening tunneling channels toward the SSH connection that
// registered an endpoint.
pub(crate) struct SshTunnelHandler {
    // Handle to the SSH connection, in order to open tunneling channels.
    handle: russh::server::Handle,
    // Bind address exactly as the client declared it, echoed in the
    // channel-open payload so the client can match its registration.
    declared_bind: String,
}

#[async_trait]
impl ConnectionHandler<ChannelStream<Msg>> for SshTunnelHandler {
    async fn tunneling_channel(&self) -> anyhow::Result<ChannelStream<Msg>> {
        let channel = self
            .handle
            .channel_open_forwarded_streamlocal(self.declared_bind.clone())
            .await?;
        Ok(channel.into_stream())
    }
}

// Shared data for each SSH connection.
pub(crate) struct ServerHandler {
    // The unique ID of this connection.
    id: usize,
    // The IP and port of this connection.
    peer: Option<SocketAddr>,
    // The username from this connection's authentication attempts.
    user: Option<String>,
    // Outcome of the latest authentication attempt. Forward requests are
    // refused unless this is set, regardless of the SSH engine's own state.
    authed: bool,
    // Cancelled when this connection ends; supervisors watch it to tear
    // down the connection's endpoints.
    cancellation_token: CancellationToken,
    // Reference to the server state and services.
    server: Arc<SrpServer>,
}

impl ServerHandler {
    fn user_name(&self) -> &str {
        self.user.as_deref().unwrap_or("unknown")
    }

    fn run_authenticator(&mut self, user: &str, credentials: Credentials) -> bool {
        self.user = Some(user.into());
        let accepted = match self.server.authenticator {
            Some(ref authenticator) => authenticator.authenticate(AuthenticateRequest {
                user: user.into(),
                peer: self.peer,
                credentials,
            }),
            None => true,
        };
        self.authed = accepted;
        accepted
    }

    // Validate a forward-registration request, returning the rendezvous
    // (host, port) pair it targets.
    fn validate_forward_request(
        &self,
        bind_address: &str,
    ) -> Result<(String, String), ServerError> {
        if !self.authed {
            return Err(ServerError::NotAuthenticated);
        }
        let Some((host, port)) = parse_bind_address(bind_address) else {
            return Err(ServerError::InvalidBindAddress);
        };
        if let Some(ref authorizer) = self.server.authorizer {
            if !authorizer.authorize(AuthorizeRequest {
                user: self.user_name().into(),
                peer: self.peer,
                target: format!("{host}:{port}"),
            }) {
                return Err(ServerError::ForwardingNotAuthorized);
            }
        }
        Ok((host.into(), port.into()))
    }
}

// Creates handlers for new SSH connections.
pub(crate) struct SshServer(pub(crate) Arc<SrpServer>);

impl russh::server::Server for SshServer {
    type Handler = ServerHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ServerHandler {
        let id = self.0.session_id.fetch_add(1, Ordering::AcqRel);
        info!(
            "SSH client connected from {}",
            peer_addr.map_or_else(|| "unknown".into(), |peer| peer.to_string())
        );
        ServerHandler {
            id,
            peer: peer_addr,
            user: None,
            authed: false,
            cancellation_token: CancellationToken::new(),
            server: Arc::clone(&self.0),
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                [MethodKind::PublicKey, MethodKind::Password].as_slice(),
            )),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.run_authenticator(user, Credentials::Password(password.into())) {
            info!("SSH client for user {} authenticated with password", user);
            Ok(Auth::Accept)
        } else {
            warn!("Failed password authentication for user {}", user);
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.run_authenticator(user, Credentials::PublicKey(public_key.clone())) {
            info!("SSH client for user {} authenticated with public key", user);
            Ok(Auth::Accept)
        } else {
            warn!("Failed public key authentication for user {}", user);
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    // Accept session channels so regular clients can hold the connection
    // open; no shell or exec service is provided on them.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    // Handle an endpoint registration request. The bind address carries the
    // rendezvous name as "/<host>/<port>"; the numeric port is ignored.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        _port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let (host, port) = match self.validate_forward_request(address) {
            Ok(target) => target,
            Err(error @ ServerError::NotAuthenticated) => {
                info!(
                    "User {} is not allowed to register forwardings: {}",
                    self.user_name(),
                    error
                );
                return Ok(false);
            }
            Err(error) => {
                error!(
                    "Rejecting forward request for {} from user {}: {}",
                    address,
                    self.user_name(),
                    error
                );
                return Ok(false);
            }
        };

        let socket = self.server.rendezvous.socket_path(&host, &port);
        let listener = match UnixListener::bind(&socket) {
            Ok(listener) => listener,
            Err(error) => {
                error!("Failed to listen on {}: {}", socket.display(), error);
                return Ok(false);
            }
        };
        let (registration, shutdown) =
            match self.server.forwardings.register(socket.clone(), self.id) {
                Ok(registration) => registration,
                Err(error) => {
                    // The bind created a fresh socket file; undo both halves
                    // before denying.
                    drop(listener);
                    let _ = std::fs::remove_file(&socket);
                    error!(
                        "Failed to register forwarding for {} from user {}: {}",
                        address,
                        self.user_name(),
                        error
                    );
                    return Ok(false);
                }
            };

        let handler = Arc::new(SshTunnelHandler {
            handle: session.handle(),
            declared_bind: address.to_string(),
        });
        tokio::spawn(serve_endpoint(
            listener,
            socket.clone(),
            registration,
            shutdown.clone(),
            handler,
            Arc::clone(&self.server.forwardings),
        ));

        // Supervisor: close this endpoint when the owning connection ends.
        let owner = self.cancellation_token.clone();
        let forwardings = Arc::clone(&self.server.forwardings);
        tokio::spawn(async move {
            tokio::select! {
                _ = owner.cancelled() => forwardings.shutdown_if_current(&socket, registration),
                _ = shutdown.cancelled() => (),
            }
        });

        info!(
            "Serving forward for {} requested by user {}",
            address,
            self.user_name()
        );
        Ok(true)
    }

    // Handle cancellation of an endpoint registration. Cancelling an
    // unregistered address still succeeds.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authed {
            info!(
                "User {} is not allowed to cancel forwardings",
                self.user_name()
            );
            return Ok(false);
        }
        let Some((host, port)) = parse_bind_address(address) else {
            error!(
                "User {} requested to cancel invalid bind address {}",
                self.user_name(),
                address
            );
            return Ok(false);
        };
        let socket = self.server.rendezvous.socket_path(host, port);
        if self.server.forwardings.cancel(&socket) {
            info!("Canceled forward for {}", address);
        }
        Ok(true)
    }
}

// Clean up endpoints on drop (i.e. disconnected from server).
impl Drop for ServerHandler {
    fn drop(&mut self) {
        let forwards = self.server.forwardings.owned_by(self.id).len();
        if forwards > 0 {
            info!(
                "SSH client for user {} disconnected; closing {} forwarding(s)",
                self.user_name(),
                forwards
            );
        } else {
            info!("SSH client for user {} disconnected", self.user_name());
        }
        self.cancellation_token.cancel();
    }
}
