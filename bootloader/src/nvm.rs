// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! STM32F4 flash controller, driven through the PAC.

use bootloader::SectorFlash;
use consts::{FLASH_BASE, FLASH_SECTOR_SIZES, FLASH_SIZE, FLASH_WORD_SIZE};
use embassy_stm32::pac;
use embassy_stm32::pac::flash::vals::Psize;
use embassy_stm32::peripherals::FLASH;
use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind, ReadNorFlash};

const KEY1: u32 = 0x4567_0123;
const KEY2: u32 = 0xCDEF_89AB;

#[derive(Clone, Copy, Debug, Eq, PartialEq, defmt::Format)]
pub enum NvmError {
    OutOfBounds,
    NotAligned,
    /// WRPERR: sector is write protected
    Protected,
    /// PGSERR, PGPERR or PGAERR
    Program,
}

impl NorFlashError for NvmError {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            NvmError::OutOfBounds => NorFlashErrorKind::OutOfBounds,
            NvmError::NotAligned => NorFlashErrorKind::NotAligned,
            NvmError::Protected | NvmError::Program => NorFlashErrorKind::Other,
        }
    }
}

/// Owns the FLASH peripheral; reads go through the memory mapped array.
pub struct Nvm {
    _flash: FLASH,
}

impl Nvm {
    pub fn new(flash: FLASH) -> Self {
        Self { _flash: flash }
    }

    fn wait_ready() -> Result<(), NvmError> {
        let sr = loop {
            let sr = pac::FLASH.sr().read();
            if !sr.bsy() {
                break sr;
            }
        };
        // error flags are cleared by writing them back
        pac::FLASH.sr().write_value(sr);
        if sr.wrperr() {
            Err(NvmError::Protected)
        } else if sr.pgserr() || sr.pgperr() || sr.pgaerr() {
            Err(NvmError::Program)
        } else {
            Ok(())
        }
    }
}

impl ErrorType for Nvm {
    type Error = NvmError;
}

impl ReadNorFlash for Nvm {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if offset as usize + bytes.len() > FLASH_SIZE as usize {
            return Err(NvmError::OutOfBounds);
        }
        // SAFETY: inside the memory mapped flash array, which is always readable
        let src = unsafe { core::slice::from_raw_parts((FLASH_BASE + offset) as *const u8, bytes.len()) };
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE as usize
    }
}

impl SectorFlash for Nvm {
    fn unlock(&mut self) {
        if pac::FLASH.cr().read().lock() {
            pac::FLASH.keyr().write_value(KEY1);
            pac::FLASH.keyr().write_value(KEY2);
        }
    }

    fn lock(&mut self) {
        pac::FLASH.cr().modify(|w| {
            w.set_pg(false);
            w.set_ser(false);
            w.set_lock(true);
        });
    }

    fn erase_sector(&mut self, index: usize) -> Result<(), Self::Error> {
        if index >= FLASH_SECTOR_SIZES.len() {
            return Err(NvmError::OutOfBounds);
        }
        Self::wait_ready()?;
        pac::FLASH.cr().modify(|w| {
            w.set_pg(false);
            w.set_ser(true);
            w.set_snb(index as u8);
        });
        pac::FLASH.cr().modify(|w| w.set_strt(true));
        let result = Self::wait_ready();
        pac::FLASH.cr().modify(|w| w.set_ser(false));
        result
    }

    fn program_word(&mut self, offset: u32, word: u32) -> Result<(), Self::Error> {
        if offset % FLASH_WORD_SIZE != 0 {
            return Err(NvmError::NotAligned);
        }
        if offset + FLASH_WORD_SIZE > FLASH_SIZE {
            return Err(NvmError::OutOfBounds);
        }
        Self::wait_ready()?;
        pac::FLASH.cr().modify(|w| {
            w.set_ser(false);
            w.set_psize(Psize::PSIZE32);
            w.set_pg(true);
        });
        // SAFETY: word aligned address inside the flash array, controller in PG mode
        unsafe { core::ptr::write_volatile((FLASH_BASE + offset) as *mut u32, word) };
        cortex_m::asm::dsb();
        let result = Self::wait_ready();
        pac::FLASH.cr().modify(|w| w.set_pg(false));
        result
    }
}
