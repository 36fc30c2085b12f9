// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::{encode_frame, frame_len, EncodeError, Frame, Opcode, Status};
use heapless::Vec;

/// Room for response data after the status byte.
pub const RESPONSE_DATA_MAX: usize = 8;

/// Reply to exactly one request. On the wire the payload is `[status, data...]`
/// and the opcode echoes the request's.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    opcode: u8,
    status: Status,
    data: Vec<u8, RESPONSE_DATA_MAX>,
}

impl Response {
    /// Largest encoded response.
    pub const MAX_SIZE: usize = frame_len(1 + RESPONSE_DATA_MAX);

    pub fn ack(opcode: u8) -> Self {
        Self::error(opcode, Status::Ok)
    }

    pub fn error(opcode: u8, status: Status) -> Self {
        Self {
            opcode,
            status,
            data: Vec::new(),
        }
    }

    /// Successful response carrying `data`, cut to `RESPONSE_DATA_MAX` bytes.
    pub fn with_data(opcode: u8, data: &[u8]) -> Self {
        let len = data.len().min(RESPONSE_DATA_MAX);
        Self {
            opcode,
            status: Status::Ok,
            data: Vec::from_slice(&data[..len]).unwrap_or_default(),
        }
    }

    pub fn version(major: u8, minor: u8) -> Self {
        Self::with_data(Opcode::Inquiry.into(), &[major, minor])
    }

    pub fn mtu(mtu: u16) -> Self {
        Self::with_data(Opcode::Inquiry.into(), &mtu.to_le_bytes())
    }

    /// Host side: interpret a received frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, Status> {
        let (&status, data) = frame.payload().split_first().ok_or(Status::ErrFormat)?;
        let status = Status::try_from(status).map_err(|_| Status::ErrFormat)?;
        let data = Vec::from_slice(data).map_err(|_| Status::ErrFormat)?;
        Ok(Self {
            opcode: frame.opcode(),
            status,
            data,
        })
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn encode<'a>(&self, out: &'a mut [u8]) -> Result<&'a [u8], EncodeError> {
        let mut payload = [0u8; 1 + RESPONSE_DATA_MAX];
        payload[0] = self.status.into();
        payload[1..1 + self.data.len()].copy_from_slice(&self.data);
        encode_frame(self.opcode, &payload[..1 + self.data.len()], out)
    }
}
