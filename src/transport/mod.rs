//! Transport Layer
//!
//! Responsibilities:
//! - Byte-oriented read/write over an established channel
//! - Optional encryption through a [`TlsEngine`](crate::tls::TlsEngine)
//! - NO connection establishment, NO protocol parsing
//!
//! A transport starts plain and can be replaced in place by its secure
//! counterpart once the caller upgrades the connection.

mod secure;

pub use secure::SocketTransport;
