//! Socket client
//!
//! Composition root for one client connection: a [`ProxyTunnel`] produces
//! the raw channel, a [`SocketTransport`] carries bytes over it (optionally
//! encrypted), and this module tracks connection state and buffer sizing.
//! One read and one write may be outstanding at a time; the `&mut self`
//! methods enforce that by construction.

use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::common::{Endpoint, Error, IntoStream, Result, Stream};
use crate::proxy::ProxyTunnel;
use crate::tls::TlsEngine;
use crate::transport::SocketTransport;

/// Lifecycle of one connection. Transitions are monotonic; `Closed` is
/// terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    TunnelNegotiating,
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Per-connection tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Timeout covering admission and the TCP dial
    pub connect_timeout_secs: u64,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
        }
    }
}

impl SocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Ceiling on simultaneous in-flight connect attempts, so a burst of
/// connection requests cannot exhaust socket resources
const MAX_CONCURRENT_CONNECTS: usize = 50;

/// Tokio semaphores queue waiters in FIFO order, so admission is fair
fn connect_permits() -> &'static Semaphore {
    static PERMITS: OnceLock<Semaphore> = OnceLock::new();
    PERMITS.get_or_init(|| Semaphore::new(MAX_CONCURRENT_CONNECTS))
}

/// One client connection
pub struct SocketClient {
    transport: Option<SocketTransport>,
    state: ConnectionState,
    config: SocketConfig,
    peer: Option<Endpoint>,
}

impl std::fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketClient")
            .field("state", &self.state)
            .field("config", &self.config)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SocketClient {
    /// Connect to `endpoint`, optionally through the tunnel's proxy. The
    /// timeout covers admission and the TCP dial; hitting it surfaces as
    /// [`Error::ConnectTimeout`], distinct from refusal. Tunnel negotiation
    /// runs after the dial and is not bounded by it.
    pub async fn connect(
        endpoint: Endpoint,
        tunnel: ProxyTunnel,
        config: SocketConfig,
    ) -> Result<Self> {
        let mut client = Self {
            transport: None,
            state: ConnectionState::Idle,
            config,
            peer: Some(endpoint.clone()),
        };
        match client.dial(&endpoint, &tunnel).await {
            Ok(()) => {
                client.state = ConnectionState::Open;
                debug!(peer = %endpoint, "connected");
                Ok(client)
            }
            Err(e) => {
                client.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    async fn dial(&mut self, endpoint: &Endpoint, tunnel: &ProxyTunnel) -> Result<()> {
        self.state = ConnectionState::Connecting;
        let dial_target = tunnel.dial_endpoint(endpoint);

        // The permit is held for the dial only; negotiation on an
        // established channel does not compete for socket resources
        let attempt = timeout(self.config.connect_timeout(), async {
            let _permit = connect_permits()
                .acquire()
                .await
                .map_err(|_| Error::InvalidState("connection limiter closed".into()))?;
            Ok::<_, Error>(TcpStream::connect(dial_target.authority()).await?)
        })
        .await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::ConnectTimeout),
        };
        stream.set_nodelay(true)?;
        let mut stream = stream.into_stream();

        self.state = ConnectionState::TunnelNegotiating;
        tunnel.establish(&mut stream, endpoint).await?;
        self.transport = Some(SocketTransport::plain(stream));
        Ok(())
    }

    /// Adopt an already-connected channel
    pub fn from_stream(stream: Stream, config: SocketConfig) -> Self {
        Self {
            transport: Some(SocketTransport::plain(stream)),
            state: ConnectionState::Open,
            config,
            peer: None,
        }
    }

    fn transport_mut(&mut self) -> Result<&mut SocketTransport> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::InvalidState("socket is not connected".into()))
    }

    /// Read at least one byte into `buf`. `Ok(0)` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.transport_mut()?.read(buf).await;
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    /// Read until `buf` is full. End of stream before that is an error.
    pub async fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.state = ConnectionState::Closed;
                return Err(Error::ConnectionClosed);
            }
            filled += n;
        }
        Ok(())
    }

    /// Write all of `src`; partial writes loop inside the transport
    pub async fn write(&mut self, src: &[u8]) -> Result<()> {
        let result = self.transport_mut()?.write(src).await;
        if result.is_err() {
            self.state = ConnectionState::Closed;
        }
        result
    }

    /// Replace the plain transport with an encrypted one and run its
    /// handshake. Allowed exactly once, only while open and unencrypted.
    pub async fn upgrade_to_tls(&mut self, engine: Box<dyn TlsEngine>) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::InvalidState(format!(
                "cannot upgrade while {:?}",
                self.state
            )));
        }
        let transport = self
            .transport
            .take()
            .ok_or_else(|| Error::InvalidState("socket is not connected".into()))?;
        let stream = match transport {
            SocketTransport::Plain { stream } => stream,
            secure @ SocketTransport::Secure { .. } => {
                self.transport = Some(secure);
                return Err(Error::InvalidState("connection is already encrypted".into()));
            }
        };

        self.state = ConnectionState::Handshaking;
        let mut secure = SocketTransport::secure(stream, engine);
        match secure.handshake().await {
            Ok(()) => {
                self.transport = Some(secure);
                self.state = ConnectionState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Closed;
                Err(e)
            }
        }
    }

    /// Close the connection. Safe to call more than once; shutdown
    /// failures are logged, never surfaced.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown().await {
                warn!("shutdown failed: {e}");
            }
        }
        self.state = ConnectionState::Closed;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn peer(&self) -> Option<&Endpoint> {
        self.peer.as_ref()
    }

    /// Protocol negotiated by the secure transport, when there is one
    pub fn application_protocol(&self) -> Option<String> {
        self.transport
            .as_ref()
            .and_then(SocketTransport::application_protocol)
    }

    pub fn receive_buffer_size(&self) -> usize {
        self.config.receive_buffer_size
    }

    pub fn send_buffer_size(&self) -> usize {
        self.config.send_buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_and_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            peer.write_all(&buf).await.unwrap();
        });

        let endpoint = Endpoint::new("127.0.0.1", port);
        let mut client =
            SocketClient::connect(endpoint, ProxyTunnel::direct(), SocketConfig::default())
                .await
                .unwrap();
        assert!(client.is_connected());

        client.write(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_fully(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_surfaces_as_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = SocketConfig {
            connect_timeout_secs: 0,
            ..SocketConfig::default()
        };
        let err = SocketClient::connect(
            Endpoint::new("127.0.0.1", port),
            ProxyTunnel::direct(),
            config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout));
    }

    #[tokio::test]
    async fn refused_connections_surface_as_io_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = SocketClient::connect(
            Endpoint::new("127.0.0.1", port),
            ProxyTunnel::direct(),
            SocketConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn read_fully_errors_when_the_peer_ends_early() {
        let (client, server) = tokio::io::duplex(64);
        let mut socket = SocketClient::from_stream(Box::new(client), SocketConfig::default());

        let mut server = server;
        server.write_all(b"abc").await.unwrap();
        drop(server);

        let mut buf = [0u8; 8];
        let err = socket.read_fully(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(socket.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn upgrade_is_rejected_unless_open_and_plain() {
        let (client, _server) = tokio::io::duplex(64);
        let mut socket = SocketClient::from_stream(Box::new(client), SocketConfig::default());
        socket.close().await;

        let engine = crate::tls::RustlsEngine::client(
            "example.org",
            &crate::tls::TlsOptions::default(),
        )
        .unwrap();
        let err = socket.upgrade_to_tls(engine).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn socket_config_deserializes_with_defaults() {
        let config: SocketConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.receive_buffer_size, 8192);
        assert_eq!(config.send_buffer_size, 8192);

        let full: SocketConfig =
            serde_json::from_str(r#"{"connect_timeout_secs":5,"receive_buffer_size":1024}"#)
                .unwrap();
        assert_eq!(full.connect_timeout_secs, 5);
        assert_eq!(full.receive_buffer_size, 1024);
        assert_eq!(full.send_buffer_size, 8192);
    }
}
