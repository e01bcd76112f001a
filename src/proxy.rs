use std::path::{Path, PathBuf};

use tokio::net::UnixStream;

use crate::{
    addressing::parse_target,
    error::ServerError,
    SrpServer,
};

/// Dialer for a single rendezvous endpoint.
pub struct RendezvousDialer {
    socket: PathBuf,
}

impl RendezvousDialer {
    /// Open a connection to the endpoint. Fails if the endpoint is not
    /// currently registered.
    pub async fn connect(&self) -> std::io::Result<UnixStream> {
        UnixStream::connect(&self.socket).await
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

/// Interface the proxy front-end uses to reach registered endpoints.
pub trait ProxyProvider {
    /// Resolve a `host:port` target into a dialer for its rendezvous
    /// endpoint. This does not check readiness: resolving an unregistered
    /// target succeeds, and the resulting dial simply fails.
    fn provide(&self, target: &str) -> anyhow::Result<RendezvousDialer>;

    /// Whether the endpoint for a `host:port` target is currently
    /// registered. False for targets that don't split into host and port.
    fn readiness(&self, target: &str) -> bool;
}

impl ProxyProvider for SrpServer {
    fn provide(&self, target: &str) -> anyhow::Result<RendezvousDialer> {
        let (host, port) = parse_target(target).ok_or(ServerError::InvalidTarget)?;
        Ok(RendezvousDialer {
            socket: self.rendezvous.socket_path(host, port),
        })
    }

    fn readiness(&self, target: &str) -> bool {
        match parse_target(target) {
            Some((host, port)) => self
                .forwardings
                .exists(&self.rendezvous.socket_path(host, port)),
            None => false,
        }
    }
}

#[cfg(test)]
mod proxy_tests {
    use clap::Parser;

    use super::ProxyProvider;
    use crate::{ApplicationConfig, SrpServer};

    fn server_for_test() -> SrpServer {
        let config = ApplicationConfig::parse_from(["srp"]);
        SrpServer::new(&config, None, None).unwrap()
    }

    #[test]
    fn readiness_reflects_registration() {
        let server = server_for_test();
        assert!(!server.readiness("app:8080"));
        let socket = server.rendezvous.socket_path("app", "8080");
        let (registration, _) = server
            .forwardings
            .register(socket.clone(), 1)
            .unwrap();
        assert!(server.readiness("app:8080"));
        assert!(!server.readiness("app:8081"));
        assert!(!server.readiness("other:8080"));
        server.forwardings.remove_if_current(&socket, registration);
        assert!(!server.readiness("app:8080"));
    }

    #[test]
    fn readiness_is_false_for_invalid_targets() {
        let server = server_for_test();
        assert!(!server.readiness("no-port"));
        assert!(!server.readiness(""));
        assert!(!server.readiness(":8080"));
    }

    #[test]
    fn provides_dialers_without_checking_readiness() {
        let server = server_for_test();
        let dialer = server.provide("app:8080").unwrap();
        assert_eq!(
            dialer.socket_path(),
            server.rendezvous.socket_path("app", "8080")
        );
        assert!(server.provide("no-port").is_err());
    }

    #[tokio::test]
    async fn dialing_an_unregistered_endpoint_fails() {
        let server = server_for_test();
        let dialer = server.provide("app:8080").unwrap();
        assert!(dialer.connect().await.is_err());
    }
}
