// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Application image checks done before any autoboot decision.

use crate::flash::{digest_range, FlashRange, UpdateError};
use consts::{FLASH_APP_ADDRESS, FLASH_APP_SIZE, FLASH_BASE, FLASH_META_ADDRESS, FLASH_META_RECORD_OFFSET, SRAM_BASE, SRAM_SIZE};
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind, ReadNorFlash};
use host_protocol::CRC32;

/// Record written by provisioning into the metadata partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootMetadata {
    pub app_size: u32,
    pub app_crc32: u32,
}

impl BootMetadata {
    pub const SIZE: usize = host_protocol::IMAGE_RECORD_SIZE;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            app_size: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            app_crc32: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..4].copy_from_slice(&self.app_size.to_le_bytes());
        bytes[4..].copy_from_slice(&self.app_crc32.to_le_bytes());
        bytes
    }

    pub fn read<F: ReadNorFlash>(flash: &mut F) -> Result<Self, NorFlashErrorKind> {
        let mut bytes = [0u8; Self::SIZE];
        flash
            .read(FLASH_META_ADDRESS + FLASH_META_RECORD_OFFSET - FLASH_BASE, &mut bytes)
            .map_err(|e| e.kind())?;
        Ok(Self::from_bytes(bytes))
    }

    /// False for an erased or zeroed record, or one larger than the partition.
    pub fn is_provisioned(&self) -> bool {
        self.app_size != 0 && self.app_size != u32::MAX && self.app_size <= FLASH_APP_SIZE
    }
}

/// First two words of the application image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VectorTable {
    pub initial_sp: u32,
    pub reset_vector: u32,
}

impl VectorTable {
    pub fn read<F: ReadNorFlash>(flash: &mut F, base: u32) -> Result<Self, NorFlashErrorKind> {
        let mut bytes = [0u8; 8];
        let offset = base.checked_sub(FLASH_BASE).ok_or(NorFlashErrorKind::OutOfBounds)?;
        flash.read(offset, &mut bytes).map_err(|e| e.kind())?;
        Ok(Self {
            initial_sp: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            reset_vector: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Stack in SRAM, Thumb reset handler inside `image`.
    pub fn is_plausible(&self, image: &FlashRange) -> bool {
        let sp_ok = self.initial_sp > SRAM_BASE && u64::from(self.initial_sp) <= u64::from(SRAM_BASE) + u64::from(SRAM_SIZE);
        let rv_ok = self.reset_vector & 1 == 1 && image.contains(self.reset_vector & !1);
        sp_ok && rv_ok
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageError {
    Unreadable,
    Unprovisioned,
    BadVectorTable,
    CrcMismatch { expected: u32, actual: u32 },
}

/// Check the application against its metadata record.
pub fn check_application<F: ReadNorFlash>(flash: &mut F) -> Result<BootMetadata, ImageError> {
    let meta = BootMetadata::read(flash).map_err(|_| ImageError::Unreadable)?;
    if !meta.is_provisioned() {
        return Err(ImageError::Unprovisioned);
    }

    let image = FlashRange::new(FLASH_APP_ADDRESS, meta.app_size);
    let vectors = VectorTable::read(flash, FLASH_APP_ADDRESS).map_err(|_| ImageError::Unreadable)?;
    if !vectors.is_plausible(&image) {
        return Err(ImageError::BadVectorTable);
    }

    let mut digest = CRC32.digest();
    digest_range(flash, &mut digest, image).map_err(|e: UpdateError| {
        debug!("image read failed: {}", e);
        ImageError::Unreadable
    })?;
    let actual = digest.finalize();
    if actual != meta.app_crc32 {
        return Err(ImageError::CrcMismatch {
            expected: meta.app_crc32,
            actual,
        });
    }
    Ok(meta)
}

/// True iff the application image matches its persisted size and CRC32.
pub fn verify_application<F: ReadNorFlash>(flash: &mut F) -> bool {
    match check_application(flash) {
        Ok(meta) => {
            info!("application ok, size: {}, crc: {:#x}", meta.app_size, meta.app_crc32);
            true
        }
        Err(e) => {
            warn!("application check failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{app_image, MockFlash};

    #[test]
    fn metadata_layout() {
        let meta = BootMetadata {
            app_size: 0x1234,
            app_crc32: 0xDEAD_BEEF,
        };
        assert_eq!(meta.to_bytes(), [0x34, 0x12, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(BootMetadata::from_bytes(meta.to_bytes()), meta);
    }

    #[test]
    fn host_record_matches_metadata() {
        let image = app_image(300);
        let meta = BootMetadata::from_bytes(host_protocol::image_record(&image));
        assert_eq!(meta.app_size, 300);
        assert_eq!(meta.app_crc32, CRC32.checksum(&image));
        assert!(meta.is_provisioned());
    }

    #[test]
    fn valid_image_passes() {
        let mut flash = MockFlash::new();
        flash.provision(&app_image(1024));
        assert!(verify_application(&mut flash));
    }

    #[test]
    fn erased_metadata_fails() {
        let mut flash = MockFlash::new();
        assert_eq!(check_application(&mut flash), Err(ImageError::Unprovisioned));
        assert!(!verify_application(&mut flash));
    }

    #[test]
    fn oversize_metadata_fails() {
        let mut flash = MockFlash::new();
        flash.provision(&app_image(64));
        flash.load(
            FLASH_META_ADDRESS,
            &BootMetadata {
                app_size: FLASH_APP_SIZE + 4,
                app_crc32: 0,
            }
            .to_bytes(),
        );
        assert_eq!(check_application(&mut flash), Err(ImageError::Unprovisioned));
    }

    #[test]
    fn corrupted_image_fails() {
        let image = app_image(256);
        let mut flash = MockFlash::new();
        flash.provision(&image);
        flash.load(FLASH_APP_ADDRESS + 100, &[image[100] ^ 0xFF]);
        assert!(matches!(check_application(&mut flash), Err(ImageError::CrcMismatch { .. })));
    }

    #[test]
    fn implausible_vector_table_fails() {
        let mut image = app_image(256);
        // reset handler without the Thumb bit
        image[4] &= !1;
        let mut flash = MockFlash::new();
        flash.provision(&image);
        assert_eq!(check_application(&mut flash), Err(ImageError::BadVectorTable));

        let mut image = app_image(256);
        image[..4].copy_from_slice(&0x0800_0000u32.to_le_bytes());
        let mut flash = MockFlash::new();
        flash.provision(&image);
        assert_eq!(check_application(&mut flash), Err(ImageError::BadVectorTable));
    }
}
