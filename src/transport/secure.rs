//! Plain and encrypted byte transports
//!
//! [`SocketTransport`] is the seam between socket I/O and the TLS engine.
//! The secure variant owns all engine buffering: received ciphertext that
//! has not been unwrapped yet, unwrapped plaintext not yet claimed by a
//! read, and the scratch space wrap/unwrap work through. The engine itself
//! never blocks and never touches the network.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::common::{Error, Result, Stream};
use crate::tls::{EngineStatus, HandshakeStatus, TlsEngine};

pub enum SocketTransport {
    /// Pass-through byte I/O
    Plain { stream: Stream },
    /// Engine-encrypted byte I/O
    Secure {
        stream: Stream,
        engine: Box<dyn TlsEngine>,
        /// Ciphertext received but not yet unwrapped
        recv: BytesMut,
        /// Plaintext unwrapped but not yet served to a read
        plain: BytesMut,
        /// Scratch for records produced by wrap
        record: Box<[u8]>,
        /// Scratch for plaintext produced by unwrap
        scratch: Box<[u8]>,
    },
}

impl SocketTransport {
    pub fn plain(stream: Stream) -> Self {
        SocketTransport::Plain { stream }
    }

    pub fn secure(stream: Stream, engine: Box<dyn TlsEngine>) -> Self {
        let record_size = engine.record_size();
        SocketTransport::Secure {
            stream,
            engine,
            recv: BytesMut::with_capacity(record_size),
            plain: BytesMut::new(),
            record: vec![0u8; record_size].into_boxed_slice(),
            scratch: vec![0u8; record_size].into_boxed_slice(),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, SocketTransport::Secure { .. })
    }

    /// Drive the engine's handshake to completion. No-op for plain
    /// transports.
    ///
    /// Each engine status maps to one I/O obligation: `NeedWrap` produces
    /// records to write, `NeedUnwrap` consumes received records (reading
    /// from the socket only when nothing is buffered), `NeedTask` runs
    /// engine-internal computation.
    pub async fn handshake(&mut self) -> Result<()> {
        let SocketTransport::Secure {
            stream,
            engine,
            recv,
            plain,
            record,
            scratch,
        } = self
        else {
            return Ok(());
        };

        loop {
            match engine.handshake_status() {
                HandshakeStatus::Finished => break,
                HandshakeStatus::NeedTask => engine.run_tasks()?,
                HandshakeStatus::NeedWrap => {
                    let result = engine.wrap(&[], &mut record[..])?;
                    trace!(produced = result.produced, "handshake wrap");
                    if result.produced > 0 {
                        stream.write_all(&record[..result.produced]).await?;
                        stream.flush().await?;
                    } else if result.status == EngineStatus::BufferOverflow {
                        return Err(Error::Tls("record buffer overflow during handshake".into()));
                    }
                    if result.status == EngineStatus::Closed {
                        return Err(Error::Tls("session closed during handshake".into()));
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    if recv.is_empty() {
                        recv.reserve(record.len());
                        let n = stream.read_buf(recv).await?;
                        if n == 0 {
                            return Err(Error::Tls("connection closed during handshake".into()));
                        }
                        trace!(bytes = n, "handshake read");
                    }
                    let result = engine.unwrap(&recv[..], &mut scratch[..])?;
                    recv.advance(result.consumed);
                    if result.produced > 0 {
                        // Plaintext arriving with the final flight is kept
                        // for the first post-handshake read
                        plain.extend_from_slice(&scratch[..result.produced]);
                    }
                    match result.status {
                        EngineStatus::Closed => {
                            return Err(Error::Tls("session closed during handshake".into()))
                        }
                        EngineStatus::BufferOverflow => {
                            return Err(Error::Tls(
                                "plaintext buffer overflow during handshake".into(),
                            ))
                        }
                        _ => {}
                    }
                }
            }
        }

        debug!(protocol = ?engine.application_protocol(), "handshake complete");
        Ok(())
    }

    /// Read decrypted bytes into `buf`. `Ok(0)` means end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            SocketTransport::Plain { stream } => Ok(stream.read(buf).await?),
            SocketTransport::Secure {
                stream,
                engine,
                recv,
                plain,
                record,
                scratch,
            } => {
                loop {
                    // Serve previously unwrapped plaintext first
                    if !plain.is_empty() {
                        let n = plain.len().min(buf.len());
                        buf[..n].copy_from_slice(&plain.split_to(n));
                        return Ok(n);
                    }

                    let result = engine.unwrap(&recv[..], &mut scratch[..])?;
                    recv.advance(result.consumed);
                    if result.produced > 0 {
                        plain.extend_from_slice(&scratch[..result.produced]);
                        continue;
                    }
                    match result.status {
                        EngineStatus::Closed => return Ok(0),
                        EngineStatus::BufferOverflow => {
                            return Err(Error::Tls("plaintext buffer overflow".into()))
                        }
                        _ => {}
                    }
                    if result.consumed > 0 && !recv.is_empty() {
                        continue;
                    }

                    recv.reserve(record.len());
                    let n = stream.read_buf(recv).await?;
                    if n == 0 {
                        if recv.is_empty() {
                            return Ok(0);
                        }
                        // Peer vanished mid-record
                        return Err(Error::ConnectionClosed);
                    }
                }
            }
        }
    }

    /// Write all of `src`, encrypting through the engine when secure.
    /// Partial progress loops here; callers never see a short write.
    pub async fn write(&mut self, src: &[u8]) -> Result<()> {
        match self {
            SocketTransport::Plain { stream } => {
                stream.write_all(src).await?;
                stream.flush().await?;
                Ok(())
            }
            SocketTransport::Secure {
                stream,
                engine,
                record,
                ..
            } => {
                let mut offset = 0;
                while offset < src.len() {
                    let result = engine.wrap(&src[offset..], &mut record[..])?;
                    if result.consumed == 0 && result.produced == 0 {
                        return Err(Error::Tls("engine made no progress wrapping".into()));
                    }
                    offset += result.consumed;
                    if result.produced > 0 {
                        stream.write_all(&record[..result.produced]).await?;
                    }
                }
                // Flush records the engine is still holding
                loop {
                    let result = engine.wrap(&[], &mut record[..])?;
                    if result.produced == 0 {
                        break;
                    }
                    stream.write_all(&record[..result.produced]).await?;
                }
                stream.flush().await?;
                Ok(())
            }
        }
    }

    /// Close the channel. Secure transports send a best-effort close
    /// record first; the peer may already be gone.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            SocketTransport::Plain { stream } => {
                stream.shutdown().await?;
                Ok(())
            }
            SocketTransport::Secure {
                stream,
                engine,
                record,
                ..
            } => {
                engine.initiate_close();
                if let Ok(result) = engine.wrap(&[], &mut record[..]) {
                    if result.produced > 0 {
                        let _ = stream.write_all(&record[..result.produced]).await;
                        let _ = stream.flush().await;
                    }
                }
                stream.shutdown().await?;
                Ok(())
            }
        }
    }

    pub fn application_protocol(&self) -> Option<String> {
        match self {
            SocketTransport::Plain { .. } => None,
            SocketTransport::Secure { engine, .. } => engine.application_protocol(),
        }
    }
}
