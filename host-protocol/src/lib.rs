// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Update tool to bootloader communication protocol.
//! The operator tool is the host and the bootloader is the target.
//!
//! Every message, in both directions, uses the same little-endian framing:
//!
//! ```text
//! | 0xAA | opcode | length | payload       | crc32 |
//! | u8   | u8     | u16    | length bytes  | u32   |
//! ```
//!
//! The CRC32 covers everything before it.

#![cfg_attr(not(test), no_std)]

mod decoder;
mod request;
mod response;

pub use decoder::{DecoderState, Frame, FrameDecoder, Rejection};
pub use request::{EraseRequest, Inquiry, Request, VerifyRequest, WriteRequest};
pub use response::{Response, RESPONSE_DATA_MAX};

use crc::{Crc, CRC_32_ISO_HDLC};

/// First byte of every frame.
pub const START_MARKER: u8 = 0xAA;

/// Maximum payload carried by a single frame.
/// Frames announcing more than this are rejected with `Status::ErrOverflow`.
pub const MAX_PAYLOAD: usize = 4096;

/// Start marker, opcode and length.
pub const HEADER_SIZE: usize = 4;

pub const CRC_SIZE: usize = 4;

/// Bytes added around the payload by the framing.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;

pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD + FRAME_OVERHEAD;

/// IEEE CRC32, shared by the framing and by flash verification.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Operation selector carried by the second byte of a frame.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    None = 0x00,
    /// Query version or maximum transfer unit
    Inquiry = 0x10,
    /// Jump to the application
    Boot = 0x11,
    /// Software reset
    Reset = 0x1F,
    /// Erase flash sectors
    Erase = 0x20,
    /// Reserved
    Read = 0x21,
    /// Program flash
    Write = 0x22,
    /// CRC32 check of a flash range
    Verify = 0x23,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Opcode::None,
            0x10 => Opcode::Inquiry,
            0x11 => Opcode::Boot,
            0x1F => Opcode::Reset,
            0x20 => Opcode::Erase,
            0x21 => Opcode::Read,
            0x22 => Opcode::Write,
            0x23 => Opcode::Verify,
            other => return Err(other),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> u8 {
        opcode as u8
    }
}

/// Result code, first payload byte of every response.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Ok = 0,
    ErrOpcode = 1,
    ErrOverflow = 2,
    ErrTimeout = 3,
    ErrFormat = 4,
    ErrVerify = 5,
    ErrParam = 6,
    ErrUnknown = 0xFF,
}

impl TryFrom<u8> for Status {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Status::Ok,
            1 => Status::ErrOpcode,
            2 => Status::ErrOverflow,
            3 => Status::ErrTimeout,
            4 => Status::ErrFormat,
            5 => Status::ErrVerify,
            6 => Status::ErrParam,
            0xFF => Status::ErrUnknown,
            other => return Err(other),
        })
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncodeError {
    /// Payload longer than `MAX_PAYLOAD`
    PayloadTooLarge,
    /// Output buffer cannot hold the whole frame
    BufferTooSmall,
}

/// Size on the wire of a frame carrying `payload_len` bytes.
pub const fn frame_len(payload_len: usize) -> usize {
    payload_len + FRAME_OVERHEAD
}

/// CRC32 over start marker, opcode, length and payload, exactly as they are sent.
pub fn frame_crc(opcode: u8, payload: &[u8]) -> u32 {
    let length = payload.len() as u16;
    let mut digest = CRC32.digest();
    digest.update(&[START_MARKER, opcode]);
    digest.update(&length.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// Frame `payload` under `opcode` into `out`, returning the used part of `out`.
pub fn encode_frame<'a>(opcode: u8, payload: &[u8], out: &'a mut [u8]) -> Result<&'a [u8], EncodeError> {
    let body = payload_slot(out, payload.len())?;
    body.copy_from_slice(payload);
    seal_frame(opcode, payload.len(), out)
}

/// Borrow the payload area of `out` for a frame of `payload_len` bytes.
pub(crate) fn payload_slot(out: &mut [u8], payload_len: usize) -> Result<&mut [u8], EncodeError> {
    if payload_len > MAX_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge);
    }
    if out.len() < frame_len(payload_len) {
        return Err(EncodeError::BufferTooSmall);
    }
    Ok(&mut out[HEADER_SIZE..HEADER_SIZE + payload_len])
}

/// Write header and CRC around a payload already placed by `payload_slot`.
pub(crate) fn seal_frame(opcode: u8, payload_len: usize, out: &mut [u8]) -> Result<&[u8], EncodeError> {
    payload_slot(out, payload_len)?;
    let length = payload_len as u16;
    out[0] = START_MARKER;
    out[1] = opcode;
    out[2..HEADER_SIZE].copy_from_slice(&length.to_le_bytes());
    let crc = frame_crc(opcode, &out[HEADER_SIZE..HEADER_SIZE + payload_len]);
    let end = HEADER_SIZE + payload_len;
    out[end..end + CRC_SIZE].copy_from_slice(&crc.to_le_bytes());
    Ok(&out[..end + CRC_SIZE])
}

/// Standalone CRC32 of `data`, as the host computes it for VERIFY requests.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Size of the `{size, crc32}` record provisioning stores next to an image.
pub const IMAGE_RECORD_SIZE: usize = 8;

/// Metadata record for `image`: its length and CRC32, both little-endian.
/// The bootloader refuses to autoboot an image without a matching record.
pub fn image_record(image: &[u8]) -> [u8; IMAGE_RECORD_SIZE] {
    let mut record = [0u8; IMAGE_RECORD_SIZE];
    record[..4].copy_from_slice(&(image.len() as u32).to_le_bytes());
    record[4..].copy_from_slice(&checksum(image).to_le_bytes());
    record
}
