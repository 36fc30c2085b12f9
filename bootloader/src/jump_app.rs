// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use cortex_m::peripheral::{NVIC, SCB, SYST};
use defmt::info;
use embassy_stm32::pac;

/// Boots the application whose vector table is at `app_base`.
///
/// # Safety
///
/// This modifies the stack pointer and reset vector and will run code placed in the application partition.
pub unsafe fn jump_to_app(app_base: u32) -> ! {
    let msp = core::ptr::read_volatile(app_base as *const u32);
    let rv = core::ptr::read_volatile((app_base + 4) as *const u32);
    info!("msp = {=u32:x}, rv = {=u32:x}", msp, rv);

    critical_section::with(|_| {
        // Return the peripherals the bootloader started to their reset state
        pac::USART2.cr1().modify(|w| {
            w.set_rxneie(false);
            w.set_ue(false);
        });
        pac::TIM2.cr1().modify(|w| w.set_cen(false));

        let rcc = pac::RCC;
        rcc.apb1rstr().modify(|w| {
            w.set_usart2rst(true);
            w.set_tim2rst(true);
        });
        rcc.apb1rstr().modify(|w| {
            w.set_usart2rst(false);
            w.set_tim2rst(false);
        });
        rcc.ahb1rstr().modify(|w| {
            w.set_gpioarst(true);
            w.set_gpiodrst(true);
            w.set_gpioerst(true);
        });
        rcc.ahb1rstr().modify(|w| {
            w.set_gpioarst(false);
            w.set_gpiodrst(false);
            w.set_gpioerst(false);
        });
        rcc.apb1enr().modify(|w| {
            w.set_usart2en(false);
            w.set_tim2en(false);
        });
        rcc.ahb1enr().modify(|w| {
            w.set_gpioaen(false);
            w.set_gpioden(false);
            w.set_gpioeen(false);
        });

        let nvic = &*NVIC::PTR;
        for (icer, icpr) in nvic.icer.iter().zip(nvic.icpr.iter()) {
            icer.write(0xFFFF_FFFF);
            icpr.write(0xFFFF_FFFF);
        }

        let syst = &*SYST::PTR;
        syst.csr.write(0);
        syst.rvr.write(0);
        syst.cvr.write(0);

        // PENDSTCLR | PENDSVCLR
        (*SCB::PTR).icsr.write((1 << 25) | (1 << 27));
        (*SCB::PTR).vtor.write(app_base);

        // These instructions perform the following operations:
        //
        // * Modify control register to use MSP as stack pointer (clear spsel bit)
        // * Synchronize instruction barrier
        // * Initialize stack pointer from the application vector table
        // * Set link register to not return (0xFF)
        // * Enable interrupts again, the application expects them on
        // * Jump to the application reset vector
        core::arch::asm!(
            "mrs {tmp}, CONTROL",
            "bics {tmp}, {spsel}",
            "msr CONTROL, {tmp}",
            "isb",
            "msr MSP, {msp}",
            "mov lr, {new_lr}",
            "cpsie i",
            "bx {rv}",
            // `out(reg) _` is not permitted in a `noreturn` asm! call,
            // so instead use `in(reg) 0` and don't restore it afterwards.
            tmp = in(reg) 0,
            spsel = in(reg) 2,
            new_lr = in(reg) 0xFFFFFFFFu32,
            msp = in(reg) msp,
            rv = in(reg) rv,
            options(noreturn),
        );
    })
}
