use std::net::SocketAddr;

use russh::keys::PublicKey;

// Credentials presented by a single SSH authentication attempt.
#[derive(Debug, Clone)]
pub enum Credentials {
    Password(String),
    PublicKey(PublicKey),
}

// An authentication attempt, as presented to an [`Authenticator`].
#[derive(Debug, Clone)]
pub struct AuthenticateRequest {
    pub user: String,
    pub peer: Option<SocketAddr>,
    pub credentials: Credentials,
}

// A forward-registration request, as presented to an [`Authorizer`].
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub user: String,
    pub peer: Option<SocketAddr>,
    // The rendezvous target, as `host:port`.
    pub target: String,
}

/// Policy hook consulted once per SSH authentication attempt, for both the
/// password and public-key methods. When no authenticator is configured,
/// every attempt is accepted.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: AuthenticateRequest) -> bool;
}

/// Policy hook consulted once per forward-registration request. When no
/// authorizer is configured, every registration is accepted.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, request: AuthorizeRequest) -> bool;
}
