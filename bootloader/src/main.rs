// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

#![no_std]
#![no_main]
mod board;
mod jump_app;
mod nvm;

// global logger
use defmt_rtt as _;
use panic_probe as _;

use board::{init_uart, uart_read_byte, Stm32Board};
use bootloader::{startup_delay, BootSequencer, ByteFifo, Producer};
use consts::{RX_FIFO_SIZE, UART_BAUDRATE, VERSION_MAJOR, VERSION_MINOR};
use core::cell::RefCell;
use cortex_m::peripheral::NVIC;
use cortex_m_rt::entry;
use defmt::{info, warn};
use embassy_stm32::gpio::{Input, Level, Output, Pin, Pull, Speed};
use embassy_stm32::interrupt;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use nvm::Nvm;
use static_cell::StaticCell;

static RX_FIFO: StaticCell<ByteFifo<RX_FIFO_SIZE>> = StaticCell::new();

// Producer half of RX_FIFO, only used by the USART2 interrupt once installed
static RX_PRODUCER: Mutex<CriticalSectionRawMutex, RefCell<Option<Producer<'static, RX_FIFO_SIZE>>>> =
    Mutex::new(RefCell::new(None));

#[interrupt]
fn USART2() {
    RX_PRODUCER.lock(|cell| {
        let mut producer = cell.borrow_mut();
        while let Some(byte) = uart_read_byte() {
            match producer.as_mut() {
                Some(tx) if tx.put_slice(&[byte]) == 1 => {}
                Some(_) => warn!("rx fifo full, byte dropped"),
                None => {}
            }
        }
    });
}

#[entry]
fn main() -> ! {
    let p = embassy_stm32::init(Default::default());

    let fifo = RX_FIFO.init(ByteFifo::new());
    let (producer, consumer) = fifo.split();
    RX_PRODUCER.lock(|cell| cell.borrow_mut().replace(producer));

    init_uart();
    // SAFETY: the handler only touches RX_PRODUCER, installed above
    unsafe { NVIC::unmask(embassy_stm32::pac::Interrupt::USART2) };

    let button = Input::new(p.PE0.degrade(), Pull::Up);
    let led = Output::new(p.PD12.degrade(), Level::Low, Speed::Low);
    let mut board = Stm32Board::new(button, led);
    let mut flash = Nvm::new(p.FLASH);

    // the host link carries frames only
    info!("Hello from bootloader v{}.{}, uart {} baud", VERSION_MAJOR, VERSION_MINOR, UART_BAUDRATE);

    let delay = startup_delay(&mut board, &mut flash);
    BootSequencer::new(board, flash, consumer, delay).run()
}
