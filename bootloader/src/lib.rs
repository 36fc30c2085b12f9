// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware independent part of the serial bootloader.
//!
//! The target binary supplies a [`Board`] and a [`SectorFlash`] and feeds
//! received bytes through a [`fifo::Producer`]; everything else lives here
//! and runs on the host under test.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod dispatch;
pub mod fifo;
pub mod flash;
pub mod sequencer;
pub mod verify;

#[cfg(test)]
mod mock;

pub use dispatch::{Action, CommandDispatcher, Dispatch};
pub use fifo::{ByteFifo, Consumer, Producer};
pub use flash::{FlashRange, FlashUpdater, SectorFlash, UpdateError};
pub use sequencer::{startup_delay, Board, BootMode, BootSequencer, Step};
pub use verify::{check_application, verify_application, BootMetadata, ImageError};
