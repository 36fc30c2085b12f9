// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! STM32F407 board: USART2 on PA2/PA3, boot button on PE0 (active low),
//! status LED on PD12.

use crate::jump_app::jump_to_app;
use bootloader::Board;
use consts::{BUTTON_DEBOUNCE_MS, UART_BAUDRATE};
use embassy_stm32::gpio::{AnyPin, Input, Output};
use embassy_stm32::pac;
use embassy_stm32::pac::gpio::vals::Moder;
use embassy_time::{block_for, Duration, Instant};

/// APB1 clock with the default `embassy_stm32::Config` (16 MHz HSI, no PLL)
const APB1_HZ: u32 = 16_000_000;

/// GPIOA alternate function of USART2
const AF_USART2: u8 = 7;

/// Configure USART2 for 8N1 at `UART_BAUDRATE` with the RXNE interrupt on.
/// The interrupt handler itself lives in `main`.
pub fn init_uart() {
    pac::RCC.apb1enr().modify(|w| w.set_usart2en(true));
    pac::RCC.ahb1enr().modify(|w| w.set_gpioaen(true));
    for pin in [2, 3] {
        pac::GPIOA.moder().modify(|w| w.set_moder(pin, Moder::ALTERNATE));
        pac::GPIOA.afr(0).modify(|w| w.set_afr(pin, AF_USART2));
    }

    let usart = pac::USART2;
    usart.brr().write_value(pac::usart::regs::Brr((APB1_HZ + UART_BAUDRATE / 2) / UART_BAUDRATE));
    usart.cr1().write(|w| {
        w.set_ue(true);
        w.set_te(true);
        w.set_re(true);
        w.set_rxneie(true);
    });
}

/// Pop one received byte, if any. Clears an overrun by the same SR then DR read.
pub fn uart_read_byte() -> Option<u8> {
    let sr = pac::USART2.sr().read();
    if sr.rxne() || sr.ore() {
        let byte = pac::USART2.dr().read().dr() as u8;
        if sr.rxne() {
            return Some(byte);
        }
    }
    None
}

pub struct Stm32Board {
    button: Input<'static, AnyPin>,
    led: Output<'static, AnyPin>,
}

impl Stm32Board {
    pub fn new(button: Input<'static, AnyPin>, led: Output<'static, AnyPin>) -> Self {
        Self { button, led }
    }
}

impl Board for Stm32Board {
    fn now_ms(&self) -> u32 {
        Instant::now().as_millis() as u32
    }

    fn transmit(&mut self, bytes: &[u8]) {
        let usart = pac::USART2;
        for &byte in bytes {
            while !usart.sr().read().txe() {}
            usart.dr().write(|w| w.set_dr(u16::from(byte)));
        }
        while !usart.sr().read().tc() {}
    }

    fn button_is_pressed(&mut self) -> bool {
        if self.button.is_high() {
            return false;
        }
        block_for(Duration::from_millis(BUTTON_DEBOUNCE_MS.into()));
        self.button.is_low()
    }

    fn button_wait_release(&mut self) {
        while self.button.is_low() {}
        block_for(Duration::from_millis(BUTTON_DEBOUNCE_MS.into()));
    }

    fn indicate_trapped(&mut self) {
        self.led.set_high();
    }

    fn system_reset(self) -> ! {
        defmt::info!("system reset");
        cortex_m::peripheral::SCB::sys_reset()
    }

    unsafe fn boot_application(mut self, app_base: u32) -> ! {
        self.led.set_low();
        drop(self);
        jump_to_app(app_base)
    }
}
