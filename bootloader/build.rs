// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! This build script generates `memory.x` from the flash layout in `consts`
//! into a directory where the linker can always find it at build time.
//! The linker scripts are only passed on when the target binary is being
//! built, so host builds of the library and its tests are unaffected.

use consts::{FLASH_BOOT_ADDRESS, FLASH_BOOT_SIZE, SRAM_BASE, SRAM_SIZE};
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    if env::var_os("CARGO_FEATURE_STM32F407").is_none() {
        return;
    }

    let memory_x_content = format!(
        r##"
        MEMORY
        {{
            /* NOTE 1 K = 1 KiBi = 1024 bytes */
            /* The bootloader owns flash sectors 0 to 2 */
            FLASH (rx) : ORIGIN = {:#X}, LENGTH = {}K
            RAM (rwx) : ORIGIN = {:#X}, LENGTH = {}K
        }}
        "##,
        FLASH_BOOT_ADDRESS,
        FLASH_BOOT_SIZE / 1024,
        SRAM_BASE,
        SRAM_SIZE / 1024,
    );
    // Put `memory.x` in our output directory and ensure it's
    // on the linker search path.
    let out = &PathBuf::from(env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo"));
    File::create(out.join("memory.x"))
        .and_then(|mut file| file.write_all(memory_x_content.as_bytes()))
        .expect("failed to write memory.x");
    println!("cargo:rustc-link-search={}", out.display());

    println!("cargo:rustc-link-arg-bins=-Tlink.x");
    println!("cargo:rustc-link-arg-bins=-Tdefmt.x");
}
