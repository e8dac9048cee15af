//! Wireline - an async client transport stack
//!
//! # Architecture (Layered Pipeline)
//!
//! ```text
//! ProxyTunnel (direct / HTTP CONNECT / SOCKS5)
//! → SocketTransport (plain, or encrypted through a TLS engine)
//! → SocketClient (connect / read / write / upgrade-to-TLS)
//! → HttpClient · WebSocketClient
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing
//! - Data flows leaf-to-top: the tunnel produces a connected channel, the
//!   transport carries bytes over it, the decoders turn bytes into
//!   structured responses and frames
//! - One read and one write outstanding per connection, by construction
//! - Failures complete the operation exceptionally and close the
//!   connection; retrying belongs to the caller
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Endpoint
//! ├── proxy/           # Tunnel establishment: HTTP CONNECT, SOCKS5
//! ├── tls/             # TLS engine abstraction + rustls engine
//! ├── transport/       # Plain and encrypted byte transports
//! ├── socket/          # SocketClient composition root
//! ├── http/            # Incremental HTTP/1.1 decoding + client
//! └── websocket/       # RFC 6455 client
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod proxy;
pub mod tls;
pub mod transport;
pub mod socket;
pub mod http;
pub mod websocket;

// Re-exports for convenience
pub use common::{Endpoint, Stream};
pub use error::{Error, Result};

pub use http::{HttpClient, HttpResponse, HttpResult, ResponseDecoder, ResponseHead};
pub use proxy::{ProxyDescriptor, ProxyScheme, ProxyTunnel};
pub use socket::{ConnectionState, SocketClient, SocketConfig};
pub use tls::{RustlsEngine, TlsEngine, TlsOptions};
pub use transport::SocketTransport;
pub use websocket::{WebSocketClient, WebSocketListener};
