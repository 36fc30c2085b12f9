// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Erase, program and checksum policy over the internal flash.

use consts::{FLASH_BASE, FLASH_BOOT_ADDRESS, FLASH_BOOT_SIZE, FLASH_SECTOR_SIZES, FLASH_SIZE, FLASH_WORD_SIZE};
use core::ops::{Deref, DerefMut};
use crc::Digest;
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind, ReadNorFlash};
use host_protocol::CRC32;

/// Flash controller as used by the updater.
///
/// All offsets are relative to `FLASH_BASE`, like the `ReadNorFlash` ones.
/// Erase and program are only valid between `unlock` and `lock`.
pub trait SectorFlash: ReadNorFlash {
    fn unlock(&mut self);
    fn lock(&mut self);
    /// Erase hardware sector `index` of `FLASH_SECTOR_SIZES`.
    fn erase_sector(&mut self, index: usize) -> Result<(), Self::Error>;
    /// Program one 32-bit word at a word-aligned `offset`.
    fn program_word(&mut self, offset: u32, word: u32) -> Result<(), Self::Error>;
}

/// Half-open address range `[address, address + size)` on the system bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRange {
    pub address: u32,
    pub size: u32,
}

impl FlashRange {
    pub const fn new(address: u32, size: u32) -> Self {
        Self { address, size }
    }

    /// One past the last byte; may be 2^32.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.size)
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && u64::from(address) < self.end()
    }

    pub fn intersects(&self, other: &FlashRange) -> bool {
        self.size != 0
            && other.size != 0
            && u64::from(self.address) < other.end()
            && u64::from(other.address) < self.end()
    }
}

/// The bootloader's own image.
pub const PROTECTED_REGION: FlashRange = FlashRange::new(FLASH_BOOT_ADDRESS, FLASH_BOOT_SIZE);

/// RAII unlock of the flash controller: unlocked on creation, locked again
/// on drop whatever path leaves the scope.
pub struct Unlocked<'a, F: SectorFlash> {
    flash: &'a mut F,
}

impl<'a, F: SectorFlash> Unlocked<'a, F> {
    pub fn new(flash: &'a mut F) -> Self {
        debug!("flash unlock");
        flash.unlock();
        Self { flash }
    }
}

impl<F: SectorFlash> Deref for Unlocked<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        self.flash
    }
}

impl<F: SectorFlash> DerefMut for Unlocked<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.flash
    }
}

impl<F: SectorFlash> Drop for Unlocked<'_, F> {
    fn drop(&mut self) {
        self.flash.lock();
        debug!("flash lock");
    }
}

/// One erase sector.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Sector {
    pub index: usize,
    pub address: u32,
    pub size: u32,
}

/// Erase sectors in address order, offsets accumulated from `FLASH_BASE`.
pub fn sectors() -> impl Iterator<Item = Sector> {
    FLASH_SECTOR_SIZES.iter().enumerate().scan(FLASH_BASE, |address, (index, &size)| {
        let sector = Sector {
            index,
            address: *address,
            size,
        };
        *address = address.wrapping_add(size);
        Some(sector)
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateError {
    /// The range touches the bootloader region; nothing was done
    Protected,
    /// The range wraps the address space or leaves the flash
    OutOfRange,
    /// Programming must start on a word boundary
    Unaligned,
    /// The controller reported an error
    Flash(NorFlashErrorKind),
}

#[cfg(feature = "defmt")]
impl defmt::Format for UpdateError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            UpdateError::Protected => defmt::write!(f, "Protected"),
            UpdateError::OutOfRange => defmt::write!(f, "OutOfRange"),
            UpdateError::Unaligned => defmt::write!(f, "Unaligned"),
            UpdateError::Flash(kind) => defmt::write!(f, "Flash({})", defmt::Debug2Format(kind)),
        }
    }
}

/// Reads are done in chunks of this many bytes.
const READ_CHUNK: usize = 256;

pub struct FlashUpdater<F> {
    flash: F,
}

impl<F: SectorFlash> FlashUpdater<F> {
    pub fn new(flash: F) -> Self {
        Self { flash }
    }

    /// Give the controller back, e.g. before jumping to the application.
    pub fn release(self) -> F {
        self.flash
    }

    /// Erase every sector whose start lies in `[address, address + size)`.
    /// Sectors are always erased whole. A failing sector is logged and the
    /// walk goes on. Returns the number of sectors erased.
    pub fn erase(&mut self, address: u32, size: u32) -> Result<usize, UpdateError> {
        let range = FlashRange::new(address, size);
        check_range(&range)?;

        let mut flash = Unlocked::new(&mut self.flash);
        let mut erased = 0;
        for sector in sectors().filter(|sector| range.contains(sector.address)) {
            info!(
                "erase sector{}, addr: {:#x}, size: {}",
                sector.index, sector.address, sector.size
            );
            match flash.erase_sector(sector.index) {
                Ok(()) => erased += 1,
                Err(_) => warn!("erase sector {} failed", sector.index),
            }
        }
        Ok(erased)
    }

    /// Program `data` at `address` word by word, padding a trailing partial
    /// word with `0xFF`. A failing word is logged and skipped; the caller is
    /// expected to VERIFY afterwards. Returns the number of failed words.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<usize, UpdateError> {
        let size = u32::try_from(data.len()).map_err(|_| UpdateError::OutOfRange)?;
        let range = FlashRange::new(address, size);
        check_range(&range)?;
        if address % FLASH_WORD_SIZE != 0 {
            return Err(UpdateError::Unaligned);
        }
        let start = to_offset(&range)?;

        let mut flash = Unlocked::new(&mut self.flash);
        let mut failed = 0;
        for (offset, chunk) in (start..).step_by(FLASH_WORD_SIZE as usize).zip(data.chunks(FLASH_WORD_SIZE as usize)) {
            let mut word = [0xFF; FLASH_WORD_SIZE as usize];
            word[..chunk.len()].copy_from_slice(chunk);
            if flash.program_word(offset, u32::from_le_bytes(word)).is_err() {
                warn!("write flash error, addr: {:#x}", FLASH_BASE + offset);
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// CRC32 of `[address, address + size)` as read back from flash.
    pub fn crc32(&mut self, address: u32, size: u32) -> Result<u32, UpdateError> {
        let mut digest = CRC32.digest();
        digest_range(&mut self.flash, &mut digest, FlashRange::new(address, size))?;
        Ok(digest.finalize())
    }
}

/// Feed `range` of `flash` into `digest`.
pub fn digest_range<F: ReadNorFlash>(flash: &mut F, digest: &mut Digest<'_, u32>, range: FlashRange) -> Result<(), UpdateError> {
    let mut offset = to_offset(&range)?;
    let mut remaining = range.size as usize;
    let mut chunk = [0u8; READ_CHUNK];
    while remaining > 0 {
        let len = remaining.min(READ_CHUNK);
        flash
            .read(offset, &mut chunk[..len])
            .map_err(|e| UpdateError::Flash(e.kind()))?;
        digest.update(&chunk[..len]);
        offset += len as u32;
        remaining -= len;
    }
    Ok(())
}

fn check_range(range: &FlashRange) -> Result<(), UpdateError> {
    if range.end() > u64::from(u32::MAX) + 1 {
        return Err(UpdateError::OutOfRange);
    }
    if range.intersects(&PROTECTED_REGION) {
        warn!(
            "range {:#x}+{:#x} overlaps the bootloader region",
            range.address, range.size
        );
        return Err(UpdateError::Protected);
    }
    Ok(())
}

/// Offset from `FLASH_BASE` of a range that must lie inside the flash.
fn to_offset(range: &FlashRange) -> Result<u32, UpdateError> {
    let flash = FlashRange::new(FLASH_BASE, FLASH_SIZE);
    if range.address < FLASH_BASE || range.end() > flash.end() {
        return Err(UpdateError::OutOfRange);
    }
    Ok(range.address - FLASH_BASE)
}
