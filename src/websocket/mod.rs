//! WebSocket client
//!
//! Responsibilities:
//! - Opening handshake over an already-connected [`SocketClient`]
//! - RFC 6455 frame encoding with per-frame masking
//! - Inbound frame decoding and listener dispatch
//! - Close handshake with best-effort close frames
//!
//! The upgrade reply is read raw rather than through the HTTP decoder: a
//! 101 carries no body, and any bytes past the blank line are already the
//! first frames.

mod decoder;
mod frame;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::common::{Error, Result};
use crate::socket::SocketClient;

use decoder::{DecodeEvent, MessageDecoder};
use frame::Opcode;

const NORMAL_CLOSURE: u16 = 1000;
const PROTOCOL_ERROR: u16 = 1002;
/// Reported when the peer's close frame carried no status code
const NO_STATUS_CODE: u16 = 1005;
/// Reported locally when the channel dies without a close handshake;
/// never sent on the wire
const ABNORMAL_CLOSURE: u16 = 1006;

/// Inbound events of one WebSocket session. Messages arrive reassembled,
/// fragments already joined. Ping/pong frames are consumed by the client
/// itself; replies are left to the application protocol.
#[async_trait]
pub trait WebSocketListener: Send {
    async fn on_text(&mut self, _message: String) {}
    async fn on_binary(&mut self, _payload: Bytes) {}
    async fn on_close(&mut self, _code: u16, _reason: String) {}
}

pub struct WebSocketClient<L: WebSocketListener> {
    socket: SocketClient,
    listener: L,
    decoder: MessageDecoder,
    read_buf: BytesMut,
    /// Payload slices of the in-flight message, reassembled for delivery
    message: BytesMut,
    close_sent: bool,
    closed: bool,
}

impl<L: WebSocketListener> std::fmt::Debug for WebSocketClient<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("socket", &self.socket)
            .field("close_sent", &self.close_sent)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<L: WebSocketListener> WebSocketClient<L> {
    /// Upgrade an open socket to a WebSocket session.
    ///
    /// Sends the RFC 6455 §1.3 upgrade request and requires a 101 reply
    /// whose `Sec-WebSocket-Accept` matches the key we sent. Any other
    /// status or a mismatched accept token fails the upgrade; the
    /// connection is not a WebSocket then.
    pub async fn connect(
        mut socket: SocketClient,
        host: &str,
        path: &str,
        listener: L,
    ) -> Result<Self> {
        let key = frame::client_key();
        let request = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n\r\n"
        );
        socket.write(request.as_bytes()).await?;

        let mut head = Vec::new();
        let mut chunk = vec![0u8; socket.receive_buffer_size()];
        let head_end = loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::HttpDecode("connection closed during upgrade".into()));
            }
            head.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_head_end(&head) {
                break end;
            }
        };

        // Frames may trail the reply in the same read
        let mut read_buf = BytesMut::new();
        read_buf.extend_from_slice(&head[head_end..]);
        head.truncate(head_end);
        verify_upgrade(&head, &key)?;
        debug!(host, path, "websocket established");

        Ok(Self {
            socket,
            listener,
            decoder: MessageDecoder::new(),
            read_buf,
            message: BytesMut::new(),
            close_sent: false,
            closed: false,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.closed && self.socket.is_connected()
    }

    pub async fn send_text(&mut self, message: &str) -> Result<()> {
        self.send_frame(Opcode::Text, message.as_bytes()).await
    }

    pub async fn send_binary(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(Opcode::Binary, payload).await
    }

    pub async fn send_ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_control(Opcode::Ping, payload).await
    }

    pub async fn send_pong(&mut self, payload: &[u8]) -> Result<()> {
        self.send_control(Opcode::Pong, payload).await
    }

    async fn send_frame(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if self.closed || self.close_sent {
            return Err(Error::InvalidState("websocket is closed".into()));
        }
        self.socket
            .write(&frame::encode_frame(opcode, payload, true))
            .await
    }

    async fn send_control(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        if payload.len() > frame::MAX_CONTROL_PAYLOAD {
            return Err(Error::Framing(format!(
                "oversized control frame: {}",
                payload.len()
            )));
        }
        self.send_frame(opcode, payload).await
    }

    /// Pump inbound frames to the listener until the session ends.
    ///
    /// Returns `Ok` once the peer closes (cleanly or by dropping the
    /// channel); framing violations and I/O failures tear the session down
    /// and propagate.
    pub async fn listen(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; self.socket.receive_buffer_size()];
        loop {
            loop {
                match self.decoder.decode(&mut self.read_buf) {
                    Ok(Some(DecodeEvent::Data {
                        opcode,
                        payload,
                        fin,
                    })) => {
                        self.message.extend_from_slice(&payload);
                        if !fin {
                            continue;
                        }
                        let message = self.message.split().freeze();
                        match opcode {
                            Opcode::Text => match String::from_utf8(message.to_vec()) {
                                Ok(text) => self.listener.on_text(text).await,
                                Err(_) => {
                                    self.shutdown(PROTOCOL_ERROR, String::new()).await;
                                    return Err(Error::Framing(
                                        "text message is not valid utf-8".into(),
                                    ));
                                }
                            },
                            _ => self.listener.on_binary(message).await,
                        }
                    }
                    Ok(Some(DecodeEvent::Close { code, reason })) => {
                        self.shutdown(code, reason).await;
                        return Ok(());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.shutdown(PROTOCOL_ERROR, String::new()).await;
                        return Err(e);
                    }
                }
            }

            match self.socket.read(&mut chunk).await {
                Ok(0) => {
                    self.shutdown(ABNORMAL_CLOSURE, String::new()).await;
                    return Ok(());
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    self.shutdown(ABNORMAL_CLOSURE, String::new()).await;
                    return Err(e);
                }
            }
        }
    }

    /// Close the session with the normal-closure code. Safe to call more
    /// than once; only the first call does anything.
    pub async fn close(&mut self) {
        self.shutdown(NORMAL_CLOSURE, String::new()).await;
    }

    /// One-shot teardown: best-effort close frame, then the socket, then
    /// the listener. Write failures are logged and swallowed; the channel
    /// may already be half-broken. Codes that only exist for local
    /// reporting go on the wire as a normal closure, except 1006, which
    /// means the channel is already gone and gets no frame at all.
    async fn shutdown(&mut self, code: u16, reason: String) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.close_sent && code != ABNORMAL_CLOSURE {
            self.close_sent = true;
            let wire_code = if frame::is_legal_close_code(code) {
                code
            } else {
                NORMAL_CLOSURE
            };
            if let Err(e) = self
                .socket
                .write(&frame::encode_close(wire_code, &reason))
                .await
            {
                warn!("close frame write failed: {e}");
            }
        }
        self.socket.close().await;
        self.listener.on_close(code, reason).await;
    }
}

fn find_head_end(head: &[u8]) -> Option<usize> {
    head.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn verify_upgrade(head: &[u8], key: &str) -> Result<()> {
    let text: String = head.iter().map(|&b| b as char).collect();
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::HttpDecode(format!("malformed upgrade reply: {status_line}")))?;
    if status != "101" {
        return Err(Error::HttpDecode(format!(
            "upgrade rejected with status {status}"
        )));
    }

    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|(_, value)| value.trim().to_string())
        .ok_or_else(|| Error::HttpDecode("upgrade reply without Sec-WebSocket-Accept".into()))?;
    if accept != frame::accept_key(key) {
        return Err(Error::HttpDecode("Sec-WebSocket-Accept mismatch".into()));
    }
    Ok(())
}
