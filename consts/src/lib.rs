// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]

/// Base address of the internal flash as seen on the system bus.
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Start address of the bootloader in flash memory.
/// Sectors 0 to 2 hold the bootloader image and are never erased or
/// programmed through the update protocol.
pub const FLASH_BOOT_ADDRESS: u32 = 0x0800_0000;

/// Size of the bootloader partition (48KB)
pub const FLASH_BOOT_SIZE: u32 = 48 * 1024;

/// Start address of the metadata partition (sector 3).
/// Provisioning writes the application size and CRC32 here.
pub const FLASH_META_ADDRESS: u32 = 0x0800_C000;

/// Size of the metadata partition (16KB)
pub const FLASH_META_SIZE: u32 = 16 * 1024;

/// Offset of the `{size, crc32}` record inside the metadata partition.
pub const FLASH_META_RECORD_OFFSET: u32 = 0;

/// Base address for the application in flash memory.
/// The vector table of the application is expected right at this address.
pub const FLASH_APP_ADDRESS: u32 = 0x0801_0000;

/// Size of the application area in flash memory (320KB)
pub const FLASH_APP_SIZE: u32 = 320 * 1024;

/// Erase sector sizes of the STM32F40x/41x flash, in address order from
/// `FLASH_BASE`. The index in this table is the hardware sector number.
pub const FLASH_SECTOR_SIZES: [u32; 12] = [
    16 * 1024,
    16 * 1024,
    16 * 1024,
    16 * 1024,
    64 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
    128 * 1024,
];

/// Total size of the internal flash described by `FLASH_SECTOR_SIZES` (1MB)
pub const FLASH_SIZE: u32 = 1024 * 1024;

/// Minimum programming unit of the flash controller, in bytes
pub const FLASH_WORD_SIZE: u32 = 4;

/// Main SRAM window, used to sanity check the initial stack pointer of the application
pub const SRAM_BASE: u32 = 0x2000_0000;
pub const SRAM_SIZE: u32 = 128 * 1024;

/// Countdown before autoboot when the application image checks out
pub const BOOT_DELAY_MS: u32 = 3000;

/// A partial frame idle for longer than this is dropped
pub const PACKET_TIMEOUT_MS: u32 = 500;

/// Backing size of the receive FIFO between the UART interrupt and the main loop
pub const RX_FIFO_SIZE: usize = 512;

/// Button debounce window
pub const BUTTON_DEBOUNCE_MS: u32 = 100;

pub const UART_BAUDRATE: u32 = 115_200;

/// Bootloader version reported by INQUIRY
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;
