//! RFC 6455 frame decoding state machine
//!
//! A push parser over received bytes: header, optional extended length,
//! payload. State persists across reads, so frames split at any byte
//! boundary decode identically. Data payloads stream out in bounded
//! slices as soon as they arrive instead of accumulating; only control
//! frames are buffered whole, since they are capped at 125 bytes.

use bytes::{Buf, Bytes, BytesMut};

use crate::common::{Error, Result};
use crate::websocket::frame::{is_legal_close_code, Opcode, MAX_CONTROL_PAYLOAD};

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DecodeEvent {
    /// A slice of a TEXT or BINARY message. `opcode` is the opcode that
    /// opened the message, also for CONTINUATION frames; `fin` marks the
    /// final slice of the final fragment.
    Data {
        opcode: Opcode,
        payload: Bytes,
        fin: bool,
    },
    /// The peer requested close. An empty close payload reads as the
    /// no-status pseudo-code 1005.
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    FirstByte,
    SecondByte { fin: bool, opcode: Opcode },
    Length16 { fin: bool, opcode: Opcode },
    Length64 { fin: bool, opcode: Opcode },
    Payload { fin: bool, opcode: Opcode, remaining: u64 },
}

pub(crate) struct MessageDecoder {
    state: DecodeState,
    /// Opcode that opened the current fragment sequence
    message_opcode: Option<Opcode>,
    control: BytesMut,
}

impl MessageDecoder {
    pub(crate) fn new() -> Self {
        Self {
            state: DecodeState::FirstByte,
            message_opcode: None,
            control: BytesMut::new(),
        }
    }

    /// Consume bytes from `src` until one event completes or more input is
    /// needed. Call repeatedly to drain multiple buffered frames.
    pub(crate) fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodeEvent>> {
        loop {
            match self.state {
                DecodeState::FirstByte => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let byte = src.get_u8();
                    if byte & 0x70 != 0 {
                        return Err(Error::Framing("reserved bits set".into()));
                    }
                    let fin = byte & 0x80 != 0;
                    let opcode = Opcode::from_bits(byte & 0x0F).ok_or_else(|| {
                        Error::Framing(format!("unknown opcode {:#x}", byte & 0x0F))
                    })?;
                    if opcode.is_control() && !fin {
                        return Err(Error::Framing("fragmented control frame".into()));
                    }
                    match opcode {
                        Opcode::Text | Opcode::Binary => self.message_opcode = Some(opcode),
                        Opcode::Continuation if self.message_opcode.is_none() => {
                            return Err(Error::Framing(
                                "continuation without a started message".into(),
                            ));
                        }
                        _ => {}
                    }
                    self.state = DecodeState::SecondByte { fin, opcode };
                }
                DecodeState::SecondByte { fin, opcode } => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let byte = src.get_u8();
                    if byte & 0x80 != 0 {
                        return Err(Error::Framing("masked frame from server".into()));
                    }
                    match byte & 0x7F {
                        126 => self.state = DecodeState::Length16 { fin, opcode },
                        127 => self.state = DecodeState::Length64 { fin, opcode },
                        len => {
                            check_control_length(opcode, u64::from(len))?;
                            self.state = DecodeState::Payload {
                                fin,
                                opcode,
                                remaining: u64::from(len),
                            };
                        }
                    }
                }
                DecodeState::Length16 { fin, opcode } => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let len = u64::from(src.get_u16());
                    if len < 126 {
                        return Err(Error::Framing(format!(
                            "non-minimal 16-bit length encoding: {len}"
                        )));
                    }
                    check_control_length(opcode, len)?;
                    self.state = DecodeState::Payload {
                        fin,
                        opcode,
                        remaining: len,
                    };
                }
                DecodeState::Length64 { fin, opcode } => {
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    let len = src.get_u64();
                    if len < 65536 {
                        return Err(Error::Framing(format!(
                            "non-minimal 64-bit length encoding: {len}"
                        )));
                    }
                    check_control_length(opcode, len)?;
                    self.state = DecodeState::Payload {
                        fin,
                        opcode,
                        remaining: len,
                    };
                }
                DecodeState::Payload {
                    fin,
                    opcode,
                    mut remaining,
                } => {
                    if opcode.is_control() {
                        let take = remaining.min(src.len() as u64) as usize;
                        self.control.extend_from_slice(&src.split_to(take));
                        remaining -= take as u64;
                        if remaining > 0 {
                            self.state = DecodeState::Payload {
                                fin,
                                opcode,
                                remaining,
                            };
                            return Ok(None);
                        }
                        self.state = DecodeState::FirstByte;
                        if let Some(event) = self.finish_control(opcode)? {
                            return Ok(Some(event));
                        }
                        continue;
                    }

                    let message_opcode = self.message_opcode.ok_or_else(|| {
                        Error::InvalidState("data payload without an opening opcode".into())
                    })?;
                    if remaining == 0 {
                        // An empty frame still ends the message when fin is set
                        self.state = DecodeState::FirstByte;
                        if fin {
                            self.message_opcode = None;
                            return Ok(Some(DecodeEvent::Data {
                                opcode: message_opcode,
                                payload: Bytes::new(),
                                fin: true,
                            }));
                        }
                        continue;
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64) as usize;
                    let payload = src.split_to(take).freeze();
                    remaining -= take as u64;
                    let last = remaining == 0;
                    self.state = if last {
                        DecodeState::FirstByte
                    } else {
                        DecodeState::Payload {
                            fin,
                            opcode,
                            remaining,
                        }
                    };
                    if last && fin {
                        self.message_opcode = None;
                    }
                    return Ok(Some(DecodeEvent::Data {
                        opcode: message_opcode,
                        payload,
                        fin: last && fin,
                    }));
                }
            }
        }
    }

    fn finish_control(&mut self, opcode: Opcode) -> Result<Option<DecodeEvent>> {
        match opcode {
            Opcode::Close => {
                let payload = self.control.split();
                let (code, reason) = if payload.is_empty() {
                    (super::NO_STATUS_CODE, String::new())
                } else {
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    if !is_legal_close_code(code) {
                        return Err(Error::Framing(format!("illegal close code {code}")));
                    }
                    let reason = std::str::from_utf8(&payload[2..])
                        .map_err(|_| Error::Framing("close reason is not valid utf-8".into()))?;
                    (code, reason.to_string())
                };
                Ok(Some(DecodeEvent::Close { code, reason }))
            }
            // Framed and bounded; replies are the caller's business
            _ => {
                self.control.clear();
                Ok(None)
            }
        }
    }
}

fn check_control_length(opcode: Opcode, len: u64) -> Result<()> {
    if opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(Error::Framing(format!("oversized control frame: {len}")));
    }
    // A close status code takes 2 bytes; a 1-byte payload can't carry one
    if opcode == Opcode::Close && len == 1 {
        return Err(Error::Framing("close frame with a 1-byte payload".into()));
    }
    Ok(())
}
