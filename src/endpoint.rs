use std::{path::PathBuf, sync::Arc};

use log::{debug, error};
use tokio::{
    fs,
    io::{copy_bidirectional, AsyncRead, AsyncWrite},
    net::{UnixListener, UnixStream},
};
use tokio_util::sync::CancellationToken;

use crate::{connection_handler::ConnectionHandler, forwardings::ForwardingMap};

// Accept loop for one registered endpoint. Owns the listener; runs until the
// registration is shut down or accepting fails, then cleans up after itself.
pub(crate) async fn serve_endpoint<H, T>(
    listener: UnixListener,
    socket: PathBuf,
    registration: usize,
    shutdown: CancellationToken,
    handler: Arc<H>,
    forwardings: Arc<ForwardingMap>,
) where
    H: ConnectionHandler<T> + Send + Sync + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(handle_connection(stream, handler));
                }
                Err(error) => {
                    error!(
                        "Failed to accept connection for {}: {}",
                        socket.display(),
                        error
                    );
                    break;
                }
            }
        }
    }
    // Dropping the listener is the single close on every exit path.
    drop(listener);
    // The socket file must be gone before the map entry is; otherwise a
    // re-registration could bind this path and have its fresh socket
    // unlinked by this cleanup.
    let _ = fs::remove_file(&socket).await;
    forwardings.remove_if_current(&socket, registration);
}

// Bridge one inbound connection into a new tunneling channel toward the
// endpoint's owner, then splice bytes both ways until either side ends.
async fn handle_connection<H, T>(mut stream: UnixStream, handler: Arc<H>)
where
    H: ConnectionHandler<T> + Send + Sync,
    T: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    let mut channel = match handler.tunneling_channel().await {
        Ok(channel) => channel,
        Err(error) => {
            error!("Failed to open tunneling channel: {}", error);
            return;
        }
    };
    if let Err(error) = copy_bidirectional(&mut stream, &mut channel).await {
        debug!("Tunneled connection ended: {}", error);
    }
}

#[cfg(test)]
mod endpoint_tests {
    use std::sync::Arc;

    use tokio::{
        io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
        net::{UnixListener, UnixStream},
    };

    use super::serve_endpoint;
    use crate::{
        addressing::RendezvousDirectory, connection_handler::MockConnectionHandler,
        forwardings::ForwardingMap,
    };

    #[tokio::test]
    async fn splices_bytes_between_connection_and_channel() {
        let directory = RendezvousDirectory::new(None).unwrap();
        let socket = directory.socket_path("app", "8080");
        let forwardings = Arc::new(ForwardingMap::new());
        let (registration, shutdown) = forwardings
            .register(socket.clone(), 1)
            .unwrap();
        let listener = UnixListener::bind(&socket).unwrap();
        let (mut local, remote) = duplex(1024);
        let mut mock = MockConnectionHandler::<DuplexStream>::new();
        mock.expect_tunneling_channel()
            .times(1)
            .return_once(move || Ok(remote));
        let task = tokio::spawn(serve_endpoint(
            listener,
            socket.clone(),
            registration,
            shutdown.clone(),
            Arc::new(mock),
            Arc::clone(&forwardings),
        ));

        let mut stream = UnixStream::connect(&socket)
            .await
            .expect("Endpoint connection failed");
        stream.write_all(b"PING").await.unwrap();
        let mut buffer = [0u8; 4];
        local.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"PING");
        local.write_all(b"PONG").await.unwrap();
        let mut buffer = [0u8; 4];
        stream.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"PONG");

        shutdown.cancel();
        task.await.unwrap();
        assert!(!forwardings.exists(&socket));
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn shutdown_closes_the_endpoint() {
        let directory = RendezvousDirectory::new(None).unwrap();
        let socket = directory.socket_path("app", "8080");
        let forwardings = Arc::new(ForwardingMap::new());
        let (registration, shutdown) = forwardings
            .register(socket.clone(), 1)
            .unwrap();
        let listener = UnixListener::bind(&socket).unwrap();
        let mock = MockConnectionHandler::<DuplexStream>::new();
        let task = tokio::spawn(serve_endpoint(
            listener,
            socket.clone(),
            registration,
            shutdown.clone(),
            Arc::new(mock),
            Arc::clone(&forwardings),
        ));

        shutdown.cancel();
        task.await.unwrap();
        assert!(!forwardings.exists(&socket));
        assert!(
            UnixStream::connect(&socket).await.is_err(),
            "closed endpoint shouldn't accept connections"
        );

        // The key is free again for a new registration.
        forwardings
            .register(socket.clone(), 2)
            .unwrap();
        UnixListener::bind(&socket).expect("Rebinding the endpoint failed");
    }

    #[tokio::test]
    async fn keeps_accepting_after_a_failed_channel_open() {
        let directory = RendezvousDirectory::new(None).unwrap();
        let socket = directory.socket_path("app", "8080");
        let forwardings = Arc::new(ForwardingMap::new());
        let (registration, shutdown) = forwardings
            .register(socket.clone(), 1)
            .unwrap();
        let listener = UnixListener::bind(&socket).unwrap();
        let (mut local, remote) = duplex(1024);
        let mut mock = MockConnectionHandler::<DuplexStream>::new();
        let mut sequence = mockall::Sequence::new();
        mock.expect_tunneling_channel()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Err(anyhow::anyhow!("channel refused")));
        mock.expect_tunneling_channel()
            .times(1)
            .in_sequence(&mut sequence)
            .return_once(move || Ok(remote));
        tokio::spawn(serve_endpoint(
            listener,
            socket.clone(),
            registration,
            shutdown.clone(),
            Arc::new(mock),
            Arc::clone(&forwardings),
        ));

        // The first connection is closed without any data.
        let mut first = UnixStream::connect(&socket).await.unwrap();
        let mut buffer = [0u8; 1];
        assert!(matches!(first.read(&mut buffer).await, Ok(0) | Err(_)));

        // The endpoint keeps serving connections afterwards.
        let mut second = UnixStream::connect(&socket).await.unwrap();
        second.write_all(b"PING").await.unwrap();
        let mut buffer = [0u8; 4];
        local.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"PING");
        shutdown.cancel();
    }
}
