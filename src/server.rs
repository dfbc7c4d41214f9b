//! TCP server for file transfer connections.
//!
//! Accepts connections and hands each one to the transfer handler on its
//! own task. Connections share nothing mutable; the resolver and limits
//! are read-only after startup.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::config::{ServerConfig, MAX_CONNECTIONS_LIMIT};
use crate::handler::{handle_connection, TransferContext};
use crate::resolver::PathResolver;

/// Server instance
pub struct Server {
    listener: TcpListener,
    context: Arc<TransferContext>,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Server {
    /// Bind the listener and validate the root directory.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        if config.max_connections == 0 || config.max_connections > MAX_CONNECTIONS_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "max_connections must be between 1 and {MAX_CONNECTIONS_LIMIT}, got {}",
                    config.max_connections
                ),
            ));
        }

        let addr = config.listen.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for '{}'", config.listen),
            )
        })?;

        let listener = create_listener(addr, config.backlog)?;
        let listener = TcpListener::from_std(listener)?;

        let resolver = PathResolver::new(&config.root).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("invalid root '{}': {}", config.root.display(), e),
            )
        })?;

        info!(
            address = %listener.local_addr()?,
            root = %resolver.root().display(),
            mode = ?config.limits.mode,
            "Server listening"
        );

        Ok(Server {
            listener,
            context: Arc::new(TransferContext {
                resolver,
                limits: config.limits,
            }),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
    }

    /// Accept connections until `shutdown` resolves, then wait for
    /// in-flight transfers to finish.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    let context = Arc::clone(&self.context);

                    tokio::spawn(async move {
                        serve_connection(stream, peer, context).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        drop(self.listener);
        let in_flight = self.max_connections - self.connection_limit.available_permits();
        if in_flight > 0 {
            info!(in_flight, "Waiting for transfers to finish");
        }
        // bind() keeps max_connections within u32.
        let all = self.max_connections as u32;
        let _ = self.connection_limit.acquire_many(all).await;
        info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, context: Arc<TransferContext>) {
    let _ = stream.set_nodelay(true);

    match handle_connection(stream, &context).await {
        Ok(outcome) => {
            info!(
                peer = %peer,
                path = %outcome.path,
                bytes = outcome.bytes_sent,
                "Transfer complete"
            );
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connection closed with error");
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Requester;
    use crate::config::{ClientConfig, TransferLimits};
    use crate::error::TransferError;
    use crate::protocol::ResponseMode;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct TestServer {
        root_dir: TempDir,
        port: u16,
        shutdown: Option<oneshot::Sender<()>>,
        handle: JoinHandle<io::Result<()>>,
    }

    impl TestServer {
        async fn stop(mut self) {
            if let Some(tx) = self.shutdown.take() {
                let _ = tx.send(());
            }
            self.handle.await.unwrap().unwrap();
        }
    }

    fn start(mode: ResponseMode, limits: impl FnOnce(&mut TransferLimits)) -> TestServer {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), b"hello world").unwrap();
        std::fs::write(root.path().join("empty.txt"), b"").unwrap();
        std::fs::create_dir(root.path().join("nested")).unwrap();
        std::fs::write(root.path().join("nested/inner.txt"), b"inner").unwrap();

        let mut config = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            root: root.path().to_path_buf(),
            ..ServerConfig::default()
        };
        config.limits.mode = mode;
        limits(&mut config.limits);

        let server = Server::bind(config).unwrap();
        let port = server.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        TestServer {
            root_dir: root,
            port,
            shutdown: Some(tx),
            handle,
        }
    }

    fn requester(server: &TestServer, mode: ResponseMode) -> Requester {
        Requester::new(ClientConfig {
            port: server.port,
            mode,
            ..ClientConfig::default()
        })
    }

    async fn raw_exchange(port: u16, request: &[u8]) -> Vec<u8> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        response
    }

    #[tokio::test]
    async fn test_round_trip() {
        let server = start(ResponseMode::Status, |_| {});
        let client = requester(&server, ResponseMode::Status);

        assert_eq!(&client.fetch("hello.txt").await.unwrap()[..], b"hello world");
        assert_eq!(&client.fetch("nested/inner.txt").await.unwrap()[..], b"inner");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_round_trip_raw() {
        let server = start(ResponseMode::Raw, |_| {});
        let client = requester(&server, ResponseMode::Raw);

        assert_eq!(&client.fetch("hello.txt").await.unwrap()[..], b"hello world");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root() {
        let server = start(ResponseMode::Status, |_| {});
        let client = requester(&server, ResponseMode::Status);

        let root = std::fs::canonicalize(server.root_dir.path()).unwrap();
        let absolute = root.join("hello.txt");
        let body = client.fetch(absolute.to_str().unwrap()).await.unwrap();
        assert_eq!(&body[..], b"hello world");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let server = start(ResponseMode::Status, |_| {});
        let client = requester(&server, ResponseMode::Status);

        for path in ["../../../../etc/passwd", "nested/../../hello.txt", "/etc/passwd"] {
            match client.fetch(path).await {
                Err(TransferError::InvalidRequest(_)) => {}
                other => panic!("{path}: unexpected {:?}", other),
            }
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_traversal_rejected_raw() {
        let server = start(ResponseMode::Raw, |_| {});
        let response = raw_exchange(server.port, b"../../../../etc/passwd\n").await;
        assert!(response.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_empty_file_distinct_from_rejection() {
        let server = start(ResponseMode::Status, |_| {});

        assert_eq!(raw_exchange(server.port, b"empty.txt\n").await, b"OK 0\n");
        assert_eq!(
            raw_exchange(server.port, b"missing.txt\n").await,
            b"ERR not_found no such file\n"
        );
        assert_eq!(
            raw_exchange(server.port, b"nested\n").await,
            b"ERR not_found not a regular file\n"
        );

        let client = requester(&server, ResponseMode::Status);
        assert!(client.fetch("empty.txt").await.unwrap().is_empty());
        assert!(matches!(
            client.fetch("missing.txt").await,
            Err(TransferError::NotFound(_))
        ));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_large_file_streaming() {
        let server = start(ResponseMode::Status, |limits| limits.chunk_size = 4096);
        let contents: Vec<u8> = (0..1_000_003u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(server.root_dir.path().join("large.bin"), &contents).unwrap();

        let body = requester(&server, ResponseMode::Status)
            .fetch("large.bin")
            .await
            .unwrap();
        assert_eq!(body.len(), contents.len());
        assert!(body[..] == contents[..]);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_line_length_bound() {
        let server = start(ResponseMode::Status, |limits| limits.max_request_line = 64);

        // No newline at all: the server gives up after 65 bytes instead of
        // waiting for more.
        let mut stream = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
        stream.write_all(&[b'a'; 65]).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("server should not block")
            .ok();
        assert_eq!(response, b"ERR invalid_request request line exceeds 64 bytes\n");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let server = start(ResponseMode::Status, |limits| {
            limits.request_timeout = Duration::from_millis(100)
        });

        let mut stream = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();
        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("server should close the idle connection")
            .unwrap();
        assert!(response.is_empty());

        // Other clients are still served.
        let body = requester(&server, ResponseMode::Status)
            .fetch("hello.txt")
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_isolation() {
        let server = start(ResponseMode::Status, |limits| limits.chunk_size = 512);
        let a: Vec<u8> = vec![b'a'; 200_000];
        let b: Vec<u8> = vec![b'b'; 150_000];
        std::fs::write(server.root_dir.path().join("a.bin"), &a).unwrap();
        std::fs::write(server.root_dir.path().join("b.bin"), &b).unwrap();

        // A stalled client holding a connection must not block the others.
        let stalled = TcpStream::connect(("127.0.0.1", server.port)).await.unwrap();

        let client = requester(&server, ResponseMode::Status);
        let mut tasks = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            let name = if i % 2 == 0 { "a.bin" } else { "b.bin" };
            tasks.push(tokio::spawn(async move {
                (name, client.fetch(name).await.unwrap())
            }));
        }

        for task in tasks {
            let (name, body) = task.await.unwrap();
            let expected = if name == "a.bin" { &a } else { &b };
            assert!(body[..] == expected[..], "{name} was corrupted");
        }

        drop(stalled);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_bind_rejects_missing_root() {
        let config = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            root: "/definitely/not/a/real/root".into(),
            ..ServerConfig::default()
        };
        assert!(Server::bind(config).is_err());
    }

    #[tokio::test]
    async fn test_bind_rejects_out_of_range_max_connections() {
        let root = tempfile::tempdir().unwrap();
        for max_connections in [0, usize::MAX / 2, MAX_CONNECTIONS_LIMIT + 1] {
            let config = ServerConfig {
                listen: "127.0.0.1:0".to_string(),
                root: root.path().to_path_buf(),
                max_connections,
                ..ServerConfig::default()
            };
            match Server::bind(config) {
                Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
                Ok(_) => panic!("{max_connections} should be rejected"),
            }
        }
    }

    #[tokio::test]
    async fn test_bind_conflict_is_error() {
        let server = start(ResponseMode::Status, |_| {});
        let config = ServerConfig {
            listen: format!("127.0.0.1:{}", server.port),
            root: server.root_dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        assert!(Server::bind(config).is_err());
        server.stop().await;
    }
}
