//! TLS engine abstraction
//!
//! The secure transport drives encryption through [`TlsEngine`], a
//! non-blocking wrap/unwrap interface: `wrap` turns plaintext into protocol
//! records, `unwrap` turns received records back into plaintext, and
//! [`HandshakeStatus`] tells the driver what the engine needs next. The
//! engine never touches the network; the transport moves its bytes.

mod rustls;

pub use self::rustls::{RustlsEngine, TlsOptions};

/// What the engine needs before the handshake can advance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has records to produce; wrap and write them out
    NeedWrap,
    /// The engine needs more records; read and unwrap them
    NeedUnwrap,
    /// The engine has internal computation pending; run it
    NeedTask,
    /// Handshake complete; wrap/unwrap now carry application data
    Finished,
}

/// Outcome classification of a single wrap/unwrap call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// Not enough input to produce anything; feed more bytes
    BufferUnderflow,
    /// The output buffer cannot hold the next record
    BufferOverflow,
    /// The peer closed the secure session
    Closed,
}

/// Byte accounting for one wrap/unwrap call
#[derive(Debug, Clone, Copy)]
pub struct EngineResult {
    pub status: EngineStatus,
    /// Bytes consumed from the source buffer
    pub consumed: usize,
    /// Bytes produced into the destination buffer
    pub produced: usize,
}

/// Largest protocol record an engine may produce: 16 KiB of payload plus
/// header and cipher overhead.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 + 512;

/// Non-blocking encryption engine
///
/// Implementations must be drivable from a single task: every method is
/// synchronous and the caller owns all buffering and I/O.
pub trait TlsEngine: Send {
    /// Encrypt bytes from `src` into `dst`. During the handshake `src` is
    /// ignored and `dst` receives handshake records.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> crate::common::Result<EngineResult>;

    /// Decrypt received records from `src` into `dst`. Partial records are
    /// retained inside the engine, so `consumed` normally equals `src.len()`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> crate::common::Result<EngineResult>;

    /// Current handshake position
    fn handshake_status(&self) -> HandshakeStatus;

    /// Run pending internal computation while the status is `NeedTask`
    fn run_tasks(&mut self) -> crate::common::Result<()> {
        Ok(())
    }

    /// Size the transport should use for the record scratch buffer
    fn record_size(&self) -> usize {
        MAX_RECORD_SIZE
    }

    /// Protocol negotiated via ALPN, when the handshake agreed on one
    fn application_protocol(&self) -> Option<String> {
        None
    }

    /// Queue a session-close record; subsequent `wrap` calls drain it
    fn initiate_close(&mut self) {}
}
