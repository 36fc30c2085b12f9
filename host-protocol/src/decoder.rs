// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::{encode_frame, frame_crc, EncodeError, Response, Status, MAX_PAYLOAD, START_MARKER};
use heapless::Vec;

/// One decoded frame. Only handed out once its CRC has been checked.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    opcode: u8,
    length: u16,
    payload: Vec<u8, MAX_PAYLOAD>,
    crc32: u32,
}

impl Frame {
    pub const fn empty() -> Self {
        Self {
            opcode: 0,
            length: 0,
            payload: Vec::new(),
            crc32: 0,
        }
    }

    /// Build a frame locally, computing its CRC.
    pub fn new(opcode: u8, payload: &[u8]) -> Result<Self, EncodeError> {
        let payload = Vec::from_slice(payload).map_err(|_| EncodeError::PayloadTooLarge)?;
        Ok(Self {
            opcode,
            length: payload.len() as u16,
            crc32: frame_crc(opcode, &payload),
            payload,
        })
    }

    /// Raw opcode byte, kept even when it is not a known `Opcode`.
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn encode<'a>(&self, out: &'a mut [u8]) -> Result<&'a [u8], EncodeError> {
        encode_frame(self.opcode, &self.payload, out)
    }

    fn clear(&mut self) {
        self.opcode = 0;
        self.length = 0;
        self.payload.clear();
        self.crc32 = 0;
    }
}

/// Receive progress. Every state keeps its own counters, so a reset only
/// has to put the decoder back in `AwaitingStart`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecoderState {
    AwaitingStart,
    AwaitingOpcode,
    /// `low` holds the first length byte once received
    AwaitingLength { low: Option<u8> },
    AwaitingPayload,
    /// `value` accumulates the little-endian CRC, `received` bytes so far
    AwaitingCrc { received: u8, value: u32 },
    /// A checked frame is held until `FrameDecoder::reset`
    Ready,
}

/// A frame dropped by the decoder, with the response owed to the host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rejection {
    pub opcode: u8,
    pub status: Status,
}

impl Rejection {
    pub fn response(&self) -> Response {
        Response::error(self.opcode, self.status)
    }
}

/// Byte-at-a-time frame decoder.
pub struct FrameDecoder {
    state: DecoderState,
    frame: Frame,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub const fn new() -> Self {
        Self {
            state: DecoderState::AwaitingStart,
            frame: Frame::empty(),
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// True while a partial frame is buffered.
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, DecoderState::AwaitingStart | DecoderState::Ready)
    }

    /// The completed frame, once `feed` returned `Ok(true)` and until `reset`.
    pub fn frame(&self) -> Option<&Frame> {
        match self.state {
            DecoderState::Ready => Some(&self.frame),
            _ => None,
        }
    }

    /// Drop any partial or completed frame.
    pub fn reset(&mut self) {
        self.frame.clear();
        self.state = DecoderState::AwaitingStart;
    }

    /// Consume one byte. `Ok(true)` means a CRC-valid frame is ready.
    /// On `Err` the decoder has already reset itself.
    pub fn feed(&mut self, byte: u8) -> Result<bool, Rejection> {
        match self.state {
            DecoderState::AwaitingStart => {
                if byte == START_MARKER {
                    self.state = DecoderState::AwaitingOpcode;
                }
            }
            DecoderState::AwaitingOpcode => {
                self.frame.opcode = byte;
                self.state = DecoderState::AwaitingLength { low: None };
            }
            DecoderState::AwaitingLength { low: None } => {
                self.state = DecoderState::AwaitingLength { low: Some(byte) };
            }
            DecoderState::AwaitingLength { low: Some(low) } => {
                let length = u16::from_le_bytes([low, byte]);
                if usize::from(length) > MAX_PAYLOAD {
                    return Err(self.reject(Status::ErrOverflow));
                }
                self.frame.length = length;
                self.state = if length == 0 {
                    DecoderState::AwaitingCrc { received: 0, value: 0 }
                } else {
                    DecoderState::AwaitingPayload
                };
            }
            DecoderState::AwaitingPayload => {
                if self.frame.payload.push(byte).is_err() {
                    return Err(self.reject(Status::ErrOpcode));
                }
                if self.frame.payload.len() == usize::from(self.frame.length) {
                    self.state = DecoderState::AwaitingCrc { received: 0, value: 0 };
                }
            }
            DecoderState::AwaitingCrc { received, value } => {
                let value = value | u32::from(byte) << (8 * u32::from(received));
                let received = received + 1;
                if received < 4 {
                    self.state = DecoderState::AwaitingCrc { received, value };
                } else {
                    if frame_crc(self.frame.opcode, &self.frame.payload) != value {
                        return Err(self.reject(Status::ErrVerify));
                    }
                    self.frame.crc32 = value;
                    self.state = DecoderState::Ready;
                    return Ok(true);
                }
            }
            // Bytes arriving while a frame is still held
            DecoderState::Ready => return Err(self.reject(Status::ErrOpcode)),
        }
        Ok(false)
    }

    fn reject(&mut self, status: Status) -> Rejection {
        let rejection = Rejection {
            opcode: self.frame.opcode,
            status,
        };
        self.reset();
        rejection
    }
}
