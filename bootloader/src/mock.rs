// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory stand-ins for the flash controller and the board.

use crate::flash::SectorFlash;
use crate::sequencer::Board;
use consts::{FLASH_APP_ADDRESS, FLASH_BASE, FLASH_META_ADDRESS, FLASH_META_RECORD_OFFSET, FLASH_SECTOR_SIZES, FLASH_SIZE, FLASH_WORD_SIZE, SRAM_BASE, SRAM_SIZE};
use embedded_storage::nor_flash::{ErrorType, NorFlashErrorKind, ReadNorFlash};
use host_protocol::image_record;

/// NOR flash image with the F4 sector layout, starting fully erased.
pub struct MockFlash {
    mem: Vec<u8>,
    pub unlocked: bool,
    pub unlocks: usize,
    pub locks: usize,
    /// Sector indices erased successfully, in call order
    pub erased: Vec<usize>,
    /// Successful word programs
    pub programmed: usize,
    pub fail_sectors: Vec<usize>,
    /// Word offsets whose program call fails
    pub fail_words: Vec<u32>,
}

impl MockFlash {
    pub fn new() -> Self {
        Self {
            mem: vec![0xFF; FLASH_SIZE as usize],
            unlocked: false,
            unlocks: 0,
            locks: 0,
            erased: Vec::new(),
            programmed: 0,
            fail_sectors: Vec::new(),
            fail_words: Vec::new(),
        }
    }

    pub fn bytes(&self, address: u32, len: usize) -> &[u8] {
        let start = (address - FLASH_BASE) as usize;
        &self.mem[start..start + len]
    }

    /// Overwrite memory directly, bypassing the controller.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        let start = (address - FLASH_BASE) as usize;
        self.mem[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Place `image` in the application region with a matching metadata record.
    pub fn provision(&mut self, image: &[u8]) {
        self.load(FLASH_APP_ADDRESS, image);
        self.load(FLASH_META_ADDRESS + FLASH_META_RECORD_OFFSET, &image_record(image));
    }

    fn sector_offset(index: usize) -> u32 {
        FLASH_SECTOR_SIZES[..index].iter().sum()
    }
}

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(NorFlashErrorKind::OutOfBounds)?;
        let src = self.mem.get(start..end).ok_or(NorFlashErrorKind::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mem.len()
    }
}

impl SectorFlash for MockFlash {
    fn unlock(&mut self) {
        self.unlocked = true;
        self.unlocks += 1;
    }

    fn lock(&mut self) {
        self.unlocked = false;
        self.locks += 1;
    }

    fn erase_sector(&mut self, index: usize) -> Result<(), Self::Error> {
        assert!(self.unlocked, "erase while locked");
        if self.fail_sectors.contains(&index) {
            return Err(NorFlashErrorKind::Other);
        }
        let start = Self::sector_offset(index) as usize;
        let size = FLASH_SECTOR_SIZES[index] as usize;
        self.mem[start..start + size].fill(0xFF);
        self.erased.push(index);
        Ok(())
    }

    fn program_word(&mut self, offset: u32, word: u32) -> Result<(), Self::Error> {
        assert!(self.unlocked, "program while locked");
        if offset % FLASH_WORD_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if self.fail_words.contains(&offset) {
            return Err(NorFlashErrorKind::Other);
        }
        let start = offset as usize;
        let cells = self.mem.get_mut(start..start + 4).ok_or(NorFlashErrorKind::OutOfBounds)?;
        // programming can only clear bits
        for (cell, byte) in cells.iter_mut().zip(word.to_le_bytes()) {
            *cell &= byte;
        }
        self.programmed += 1;
        Ok(())
    }
}

/// Application image of `len` bytes (at least 8) with a plausible vector table.
pub fn app_image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(7)).collect();
    image[..4].copy_from_slice(&(SRAM_BASE + SRAM_SIZE).to_le_bytes());
    image[4..8].copy_from_slice(&(FLASH_APP_ADDRESS + 8 + 1).to_le_bytes());
    image
}

/// Board with a hand-driven clock. The non-returning operations panic with
/// a recognizable message so tests can catch them.
#[derive(Default)]
pub struct MockBoard {
    pub now: u32,
    /// Every `transmit` call, in order
    pub sent: Vec<Vec<u8>>,
    pub pressed: bool,
    pub releases: usize,
    pub trapped_led: bool,
}

impl MockBoard {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Board for MockBoard {
    fn now_ms(&self) -> u32 {
        self.now
    }

    fn transmit(&mut self, bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
    }

    fn button_is_pressed(&mut self) -> bool {
        self.pressed
    }

    fn button_wait_release(&mut self) {
        self.pressed = false;
        self.releases += 1;
    }

    fn indicate_trapped(&mut self) {
        self.trapped_led = true;
    }

    fn system_reset(self) -> ! {
        panic!("system reset");
    }

    unsafe fn boot_application(self, app_base: u32) -> ! {
        panic!("boot application at {app_base:#x}");
    }
}
