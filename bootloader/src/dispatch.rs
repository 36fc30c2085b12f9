// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Opcode handlers. Every decoded frame gets exactly one response.

use crate::flash::{FlashUpdater, SectorFlash, UpdateError};
use consts::{VERSION_MAJOR, VERSION_MINOR};
use host_protocol::{EraseRequest, Frame, Inquiry, Request, Response, Status, VerifyRequest, WriteRequest, MAX_PAYLOAD};

/// What the caller must do once the response has been sent.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    None,
    /// Jump to the application
    Boot,
    /// Reset the MCU
    Reset,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dispatch {
    pub response: Response,
    pub action: Action,
}

impl Dispatch {
    fn reply(response: Response) -> Self {
        Self {
            response,
            action: Action::None,
        }
    }
}

pub struct CommandDispatcher<F> {
    updater: FlashUpdater<F>,
}

impl<F: SectorFlash> CommandDispatcher<F> {
    pub fn new(flash: F) -> Self {
        Self {
            updater: FlashUpdater::new(flash),
        }
    }

    pub fn release(self) -> F {
        self.updater.release()
    }

    pub fn dispatch(&mut self, frame: &Frame) -> Dispatch {
        let opcode = frame.opcode();
        let request = match Request::parse(frame) {
            Ok(request) => request,
            Err(status) => {
                warn!("opcode {:#x} with {} bytes rejected: {}", opcode, frame.length(), status);
                return Dispatch::reply(Response::error(opcode, status));
            }
        };

        match request {
            Request::Inquiry(Inquiry::Version) => {
                debug!("inquiry version");
                Dispatch::reply(Response::version(VERSION_MAJOR, VERSION_MINOR))
            }
            Request::Inquiry(Inquiry::Mtu) => {
                debug!("inquiry mtu");
                Dispatch::reply(Response::mtu(MAX_PAYLOAD as u16))
            }
            Request::Boot => {
                info!("boot requested");
                Dispatch {
                    response: Response::ack(opcode),
                    action: Action::Boot,
                }
            }
            Request::Reset => {
                info!("reset requested");
                Dispatch {
                    response: Response::ack(opcode),
                    action: Action::Reset,
                }
            }
            Request::Read => Dispatch::reply(Response::ack(opcode)),
            Request::Erase(erase) => Dispatch::reply(respond(opcode, self.erase(erase))),
            Request::Write(write) => Dispatch::reply(respond(opcode, self.write(write))),
            Request::Verify(verify) => Dispatch::reply(respond(opcode, self.verify(verify))),
        }
    }

    fn erase(&mut self, erase: EraseRequest) -> Result<(), Status> {
        info!("erase addr: {:#x}, size: {:#x}", erase.address, erase.size);
        let erased = self.updater.erase(erase.address, erase.size).map_err(status_of)?;
        info!("{} sectors erased", erased);
        Ok(())
    }

    fn write(&mut self, write: WriteRequest<'_>) -> Result<(), Status> {
        debug!("write addr: {:#x}, size: {}", write.address, write.data.len());
        let failed = self.updater.write(write.address, write.data).map_err(status_of)?;
        if failed > 0 {
            warn!("{} words failed to program at {:#x}", failed, write.address);
        }
        Ok(())
    }

    fn verify(&mut self, verify: VerifyRequest) -> Result<(), Status> {
        let crc = self.updater.crc32(verify.address, verify.size).map_err(status_of)?;
        if crc != verify.crc {
            warn!(
                "verify failed at {:#x}+{:#x}: expected {:#x}, got {:#x}",
                verify.address, verify.size, verify.crc, crc
            );
            return Err(Status::ErrVerify);
        }
        info!("verify ok at {:#x}+{:#x}", verify.address, verify.size);
        Ok(())
    }
}

fn respond(opcode: u8, result: Result<(), Status>) -> Response {
    match result {
        Ok(()) => Response::ack(opcode),
        Err(status) => Response::error(opcode, status),
    }
}

fn status_of(error: UpdateError) -> Status {
    match error {
        UpdateError::Protected => Status::ErrUnknown,
        UpdateError::OutOfRange | UpdateError::Unaligned => Status::ErrParam,
        UpdateError::Flash(_) => Status::ErrUnknown,
    }
}
