// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Request payload layouts.

use crate::{payload_slot, seal_frame, EncodeError, Frame, Opcode, Status};

/// INQUIRY subcode
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Inquiry {
    /// Bootloader version, answered with `{major, minor}`
    Version,
    /// Maximum payload size, answered with a little-endian u16
    Mtu,
}

impl Inquiry {
    pub const SIZE: usize = 1;

    pub fn subcode(&self) -> u8 {
        match self {
            Inquiry::Version => 0,
            Inquiry::Mtu => 1,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, Status> {
        match payload {
            [0] => Ok(Inquiry::Version),
            [1] => Ok(Inquiry::Mtu),
            _ => Err(Status::ErrParam),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EraseRequest {
    pub address: u32,
    pub size: u32,
}

impl EraseRequest {
    pub const SIZE: usize = 8;

    pub fn parse(payload: &[u8]) -> Result<Self, Status> {
        if payload.len() != Self::SIZE {
            return Err(Status::ErrParam);
        }
        Ok(Self {
            address: read_u32(payload, 0),
            size: read_u32(payload, 4),
        })
    }

    fn write(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
    }
}

/// WRITE request; `size` on the wire is `data.len()`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteRequest<'a> {
    pub address: u32,
    pub data: &'a [u8],
}

impl<'a> WriteRequest<'a> {
    /// `{address, size}` ahead of the data
    pub const HEADER_SIZE: usize = 8;

    /// Largest data chunk a single WRITE can carry.
    pub const MAX_DATA: usize = crate::MAX_PAYLOAD - Self::HEADER_SIZE;

    pub fn parse(payload: &'a [u8]) -> Result<Self, Status> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(Status::ErrParam);
        }
        let address = read_u32(payload, 0);
        let size = read_u32(payload, 4);
        let data = &payload[Self::HEADER_SIZE..];
        if data.len() as u64 != u64::from(size) {
            return Err(Status::ErrParam);
        }
        Ok(Self { address, data })
    }

    fn write(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..8].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        out[Self::HEADER_SIZE..].copy_from_slice(self.data);
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VerifyRequest {
    pub address: u32,
    pub size: u32,
    pub crc: u32,
}

impl VerifyRequest {
    pub const SIZE: usize = 12;

    pub fn parse(payload: &[u8]) -> Result<Self, Status> {
        if payload.len() != Self::SIZE {
            return Err(Status::ErrParam);
        }
        Ok(Self {
            address: read_u32(payload, 0),
            size: read_u32(payload, 4),
            crc: read_u32(payload, 8),
        })
    }

    fn write(&self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..12].copy_from_slice(&self.crc.to_le_bytes());
    }
}

/// A decoded command, one variant per known opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Request<'a> {
    Inquiry(Inquiry),
    Boot,
    Reset,
    Erase(EraseRequest),
    Read,
    Write(WriteRequest<'a>),
    Verify(VerifyRequest),
}

impl<'a> Request<'a> {
    /// Interpret a checked frame.
    /// Unknown opcodes, `Opcode::None` included, give `ErrUnknown`;
    /// malformed payloads give `ErrParam`.
    pub fn parse(frame: &'a Frame) -> Result<Self, Status> {
        let payload = frame.payload();
        let opcode = Opcode::try_from(frame.opcode()).map_err(|_| Status::ErrUnknown)?;
        Ok(match opcode {
            Opcode::Inquiry => Request::Inquiry(Inquiry::parse(payload)?),
            Opcode::Boot => Request::Boot,
            Opcode::Reset => Request::Reset,
            Opcode::Erase => Request::Erase(EraseRequest::parse(payload)?),
            Opcode::Read => Request::Read,
            Opcode::Write => Request::Write(WriteRequest::parse(payload)?),
            Opcode::Verify => Request::Verify(VerifyRequest::parse(payload)?),
            Opcode::None => return Err(Status::ErrUnknown),
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Inquiry(_) => Opcode::Inquiry,
            Request::Boot => Opcode::Boot,
            Request::Reset => Opcode::Reset,
            Request::Erase(_) => Opcode::Erase,
            Request::Read => Opcode::Read,
            Request::Write(_) => Opcode::Write,
            Request::Verify(_) => Opcode::Verify,
        }
    }

    pub fn payload_len(&self) -> usize {
        match self {
            Request::Inquiry(_) => Inquiry::SIZE,
            Request::Boot | Request::Reset | Request::Read => 0,
            Request::Erase(_) => EraseRequest::SIZE,
            Request::Write(write) => WriteRequest::HEADER_SIZE + write.data.len(),
            Request::Verify(_) => VerifyRequest::SIZE,
        }
    }

    /// Encode as a complete frame into `out`.
    pub fn encode<'b>(&self, out: &'b mut [u8]) -> Result<&'b [u8], EncodeError> {
        let len = self.payload_len();
        let body = payload_slot(out, len)?;
        match self {
            Request::Inquiry(inquiry) => body[0] = inquiry.subcode(),
            Request::Boot | Request::Reset | Request::Read => {}
            Request::Erase(erase) => erase.write(body),
            Request::Write(write) => write.write(body),
            Request::Verify(verify) => verify.write(body),
        }
        seal_frame(self.opcode().into(), len, out)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
