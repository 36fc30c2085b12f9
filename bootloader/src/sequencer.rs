// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Foreground loop: autoboot countdown, manual trap, byte pump into the
//! decoder and responses back out.

use crate::dispatch::{Action, CommandDispatcher};
use crate::fifo::Consumer;
use crate::flash::SectorFlash;
use crate::verify::verify_application;
use consts::{BOOT_DELAY_MS, FLASH_APP_ADDRESS, PACKET_TIMEOUT_MS};
use embedded_storage::nor_flash::ReadNorFlash;
use host_protocol::{FrameDecoder, Response};

/// Everything the loop needs from the hardware.
pub trait Board {
    /// Milliseconds since power-up, wrapping.
    fn now_ms(&self) -> u32;
    /// Blocking send of `bytes` on the host link.
    fn transmit(&mut self, bytes: &[u8]);
    /// Debounced state of the boot button.
    fn button_is_pressed(&mut self) -> bool;
    fn button_wait_release(&mut self);
    fn indicate_trapped(&mut self);
    fn system_reset(self) -> !;
    /// Hand the core over to the image at `app_base`.
    ///
    /// # Safety
    ///
    /// `app_base` must hold a vector table of a runnable image, and nothing
    /// may still expect the bootloader's peripherals or stack.
    unsafe fn boot_application(self, app_base: u32) -> !;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BootMode {
    /// Autoboot once `delay_ms` has passed since `entered_ms`
    Countdown {
        entered_ms: u32,
        delay_ms: u32,
        /// Last remaining-seconds value logged
        announced_s: Option<u32>,
    },
    /// Stay in the bootloader until told otherwise
    Trapped,
}

/// Outcome of one loop iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    Continue,
    Boot,
    Reset,
}

pub struct BootSequencer<'a, B, F, const N: usize> {
    board: B,
    dispatcher: CommandDispatcher<F>,
    decoder: FrameDecoder,
    rx: Consumer<'a, N>,
    mode: BootMode,
    last_activity_ms: u32,
}

impl<'a, B: Board, F: SectorFlash, const N: usize> BootSequencer<'a, B, F, N> {
    /// `boot_delay_ms == 0` starts trapped.
    pub fn new(board: B, flash: F, rx: Consumer<'a, N>, boot_delay_ms: u32) -> Self {
        let now = board.now_ms();
        let mode = if boot_delay_ms == 0 {
            BootMode::Trapped
        } else {
            BootMode::Countdown {
                entered_ms: now,
                delay_ms: boot_delay_ms,
                announced_s: None,
            }
        };
        Self {
            board,
            dispatcher: CommandDispatcher::new(flash),
            decoder: FrameDecoder::new(),
            rx,
            mode,
            last_activity_ms: now,
        }
    }

    pub fn mode(&self) -> BootMode {
        self.mode
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub fn poll(&mut self) -> Step {
        let now = self.board.now_ms();

        if let BootMode::Countdown {
            entered_ms,
            delay_ms,
            ref mut announced_s,
        } = self.mode
        {
            let elapsed = now.wrapping_sub(entered_ms);
            if elapsed >= delay_ms {
                info!("boot delay elapsed");
                return Step::Boot;
            }
            let remaining_s = (delay_ms - elapsed).div_ceil(1000);
            if *announced_s != Some(remaining_s) {
                info!("booting in {}s", remaining_s);
                *announced_s = Some(remaining_s);
            }
        }

        if self.board.button_is_pressed() {
            info!("button pressed, resetting");
            self.board.button_wait_release();
            return Step::Reset;
        }

        let Some(byte) = self.rx.get() else {
            if !self.decoder.in_progress() {
                self.last_activity_ms = now;
            } else if now.wrapping_sub(self.last_activity_ms) > PACKET_TIMEOUT_MS {
                warn!("stale frame dropped in {}", self.decoder.state());
                self.decoder.reset();
            }
            return Step::Continue;
        };

        self.last_activity_ms = now;
        match self.decoder.feed(byte) {
            Ok(false) => Step::Continue,
            Ok(true) => self.complete(),
            Err(rejection) => {
                self.send(&rejection.response());
                Step::Continue
            }
        }
    }

    fn complete(&mut self) -> Step {
        let dispatch = match self.decoder.frame() {
            Some(frame) => self.dispatcher.dispatch(frame),
            None => return Step::Continue,
        };
        self.decoder.reset();
        if self.mode != BootMode::Trapped {
            info!("host connected, autoboot cancelled");
            self.mode = BootMode::Trapped;
        }
        self.send(&dispatch.response);
        match dispatch.action {
            Action::None => Step::Continue,
            Action::Boot => Step::Boot,
            Action::Reset => Step::Reset,
        }
    }

    fn send(&mut self, response: &Response) {
        let mut out = [0u8; Response::MAX_SIZE];
        match response.encode(&mut out) {
            Ok(bytes) => self.board.transmit(bytes),
            Err(e) => error!("response encode failed: {}", e),
        }
    }

    pub fn run(mut self) -> ! {
        loop {
            match self.poll() {
                Step::Continue => {}
                Step::Boot => self.boot(),
                Step::Reset => self.board.system_reset(),
            }
        }
    }

    fn boot(self) -> ! {
        let Self { board, dispatcher, .. } = self;
        // lock and drop the controller before leaving
        drop(dispatcher.release());
        info!("jumping to application at {:#x}", FLASH_APP_ADDRESS);
        // SAFETY: the loop only boots after the countdown, which startup only
        // arms for a verified image, or on the host's explicit request.
        unsafe { board.boot_application(FLASH_APP_ADDRESS) }
    }
}

/// Decide the autoboot delay at power-up: `0` (trapped) when the button is
/// held or the application does not verify, `BOOT_DELAY_MS` otherwise.
pub fn startup_delay<B: Board, F: ReadNorFlash>(board: &mut B, flash: &mut F) -> u32 {
    let trap = if board.button_is_pressed() {
        info!("button held at power-up, staying in bootloader");
        true
    } else if !verify_application(flash) {
        info!("no valid application, staying in bootloader");
        true
    } else {
        false
    };

    if trap {
        board.indicate_trapped();
        board.button_wait_release();
        0
    } else {
        BOOT_DELAY_MS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::{ByteFifo, Producer};
    use crate::mock::{app_image, MockBoard, MockFlash};
    use host_protocol::{checksum, EraseRequest, Frame, FrameDecoder, Inquiry, Request, Status, VerifyRequest, WriteRequest, MAX_FRAME_SIZE};

    type Sequencer<'a> = BootSequencer<'a, MockBoard, MockFlash, 512>;

    fn encode(request: Request) -> Vec<u8> {
        let mut out = [0u8; MAX_FRAME_SIZE];
        request.encode(&mut out).unwrap().to_vec()
    }

    /// Poll until the FIFO is drained, collecting non-`Continue` steps.
    fn drain(seq: &mut Sequencer<'_>) -> Vec<Step> {
        let mut steps = Vec::new();
        while !seq.rx.is_empty() {
            match seq.poll() {
                Step::Continue => {}
                step => steps.push(step),
            }
        }
        steps
    }

    fn responses(board: &MockBoard) -> Vec<Response> {
        board
            .sent
            .iter()
            .map(|bytes| {
                let mut decoder = FrameDecoder::new();
                let done = bytes.iter().map(|&b| decoder.feed(b).unwrap()).last();
                assert_eq!(done, Some(true), "incomplete response frame");
                Response::from_frame(decoder.frame().unwrap()).unwrap()
            })
            .collect()
    }

    fn send(tx: &mut Producer<'_, 512>, bytes: &[u8]) {
        assert_eq!(tx.put_slice(bytes), bytes.len());
    }

    #[test]
    fn autoboots_after_the_delay() {
        let mut fifo = ByteFifo::<512>::new();
        let (_tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 3000);
        for now in [0, 1, 999, 1000, 2999] {
            seq.board_mut().now = now;
            assert_eq!(seq.poll(), Step::Continue);
        }
        assert_eq!(
            seq.mode(),
            BootMode::Countdown {
                entered_ms: 0,
                delay_ms: 3000,
                announced_s: Some(1)
            }
        );
        seq.board_mut().now = 3000;
        assert_eq!(seq.poll(), Step::Boot);
        assert!(seq.board().sent.is_empty());
    }

    #[test]
    fn countdown_survives_tick_wraparound() {
        let mut fifo = ByteFifo::<512>::new();
        let (_tx, rx) = fifo.split();
        let mut board = MockBoard::new();
        board.now = u32::MAX - 100;
        let mut seq = Sequencer::new(board, MockFlash::new(), rx, 3000);
        seq.board_mut().now = 1000;
        assert_eq!(seq.poll(), Step::Continue);
        seq.board_mut().now = 2899;
        assert_eq!(seq.poll(), Step::Boot);
    }

    #[test]
    fn valid_frame_cancels_autoboot() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 3000);
        seq.board_mut().now = 100;
        send(&mut tx, &encode(Request::Inquiry(Inquiry::Version)));
        assert!(drain(&mut seq).is_empty());
        assert_eq!(seq.mode(), BootMode::Trapped);

        seq.board_mut().now = 100_000;
        assert_eq!(seq.poll(), Step::Continue);
        let responses = responses(seq.board());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status(), Status::Ok);
        assert_eq!(responses[0].data(), &[consts::VERSION_MAJOR, consts::VERSION_MINOR]);
    }

    #[test]
    fn zero_delay_stays_trapped() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        assert_eq!(seq.mode(), BootMode::Trapped);
        send(&mut tx, &encode(Request::Inquiry(Inquiry::Mtu)));
        assert!(drain(&mut seq).is_empty());
        for now in [3000, 60_000, u32::MAX] {
            seq.board_mut().now = now;
            assert_eq!(seq.poll(), Step::Continue);
        }
        assert_eq!(seq.mode(), BootMode::Trapped);
        assert_eq!(responses(seq.board())[0].data(), &4096u16.to_le_bytes());
    }

    #[test]
    fn partial_frame_times_out_silently() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        send(&mut tx, &[0xAA, 0x10]);
        drain(&mut seq);
        assert!(seq.decoder().in_progress());

        seq.board_mut().now = PACKET_TIMEOUT_MS;
        seq.poll();
        assert!(seq.decoder().in_progress(), "reset before the timeout passed");

        seq.board_mut().now = PACKET_TIMEOUT_MS + 1;
        seq.poll();
        assert!(!seq.decoder().in_progress());
        assert!(seq.board().sent.is_empty());

        // the link recovers for the next frame
        send(&mut tx, &encode(Request::Inquiry(Inquiry::Version)));
        drain(&mut seq);
        assert_eq!(responses(seq.board()).len(), 1);
    }

    #[test]
    fn slow_but_steady_bytes_do_not_time_out() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        for (i, &byte) in encode(Request::Inquiry(Inquiry::Version)).iter().enumerate() {
            seq.board_mut().now = (i as u32 + 1) * 400;
            seq.poll();
            send(&mut tx, &[byte]);
            seq.poll();
        }
        assert_eq!(responses(seq.board())[0].status(), Status::Ok);
    }

    #[test]
    fn oversize_length_is_answered_immediately() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        let len = 4097u16.to_le_bytes();
        send(&mut tx, &[0xAA, 0x22, len[0], len[1]]);
        drain(&mut seq);
        let responses = responses(seq.board());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].opcode(), 0x22);
        assert_eq!(responses[0].status(), Status::ErrOverflow);
        assert!(!seq.decoder().in_progress());
    }

    #[test]
    fn corrupted_frame_is_answered_with_err_verify() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 3000);
        let mut frame = encode(Request::Inquiry(Inquiry::Version));
        frame[4] ^= 0x01;
        send(&mut tx, &frame);
        assert!(drain(&mut seq).is_empty());
        assert_eq!(responses(seq.board())[0].status(), Status::ErrVerify);
        // only a dispatched frame cancels the countdown
        assert!(matches!(seq.mode(), BootMode::Countdown { .. }));
    }

    #[test]
    fn button_press_resets() {
        let mut fifo = ByteFifo::<512>::new();
        let (_tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        seq.board_mut().pressed = true;
        assert_eq!(seq.poll(), Step::Reset);
        assert_eq!(seq.board().releases, 1);
    }

    #[test]
    fn boot_request_is_acked_first() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        send(&mut tx, &encode(Request::Boot));
        assert_eq!(drain(&mut seq), [Step::Boot]);
        let responses = responses(seq.board());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].opcode(), 0x11);
        assert_eq!(responses[0].status(), Status::Ok);
    }

    #[test]
    fn reset_request_is_acked_first() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        send(&mut tx, &encode(Request::Reset));
        assert_eq!(drain(&mut seq), [Step::Reset]);
        assert_eq!(responses(seq.board())[0].opcode(), 0x1F);
    }

    #[test]
    fn update_session() {
        let image = app_image(600);
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);

        send(
            &mut tx,
            &encode(Request::Erase(EraseRequest {
                address: FLASH_APP_ADDRESS,
                size: 0x1_0000,
            })),
        );
        drain(&mut seq);
        for (i, chunk) in image.chunks(200).enumerate() {
            send(
                &mut tx,
                &encode(Request::Write(WriteRequest {
                    address: FLASH_APP_ADDRESS + 200 * i as u32,
                    data: chunk,
                })),
            );
            drain(&mut seq);
        }
        send(
            &mut tx,
            &encode(Request::Verify(VerifyRequest {
                address: FLASH_APP_ADDRESS,
                size: image.len() as u32,
                crc: checksum(&image),
            })),
        );
        drain(&mut seq);

        let responses = responses(seq.board());
        let opcodes: Vec<u8> = responses.iter().map(|r| r.opcode()).collect();
        assert_eq!(opcodes, [0x20, 0x22, 0x22, 0x22, 0x23]);
        assert!(responses.iter().all(|r| r.status() == Status::Ok));
    }

    #[test]
    fn read_opcode_is_acknowledged() {
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);
        let mut out = [0u8; MAX_FRAME_SIZE];
        let frame = Frame::new(0x21, &[]).unwrap();
        send(&mut tx, frame.encode(&mut out).unwrap());
        drain(&mut seq);
        assert_eq!(responses(seq.board())[0].status(), Status::Ok);
    }

    #[test]
    #[should_panic(expected = "boot application at 0x8010000")]
    fn run_jumps_to_the_application() {
        let mut fifo = ByteFifo::<512>::new();
        let (_tx, rx) = fifo.split();
        let mut board = MockBoard::new();
        board.now = 5000;
        let mut seq = Sequencer::new(board, MockFlash::new(), rx, 1);
        seq.board_mut().now = 5001;
        seq.run();
    }

    #[test]
    fn startup_with_valid_image_counts_down() {
        let mut board = MockBoard::new();
        let mut flash = MockFlash::new();
        flash.provision(&app_image(1024));
        assert_eq!(startup_delay(&mut board, &mut flash), BOOT_DELAY_MS);
        assert!(!board.trapped_led);
    }

    #[test]
    fn updated_image_autoboots_after_power_cycle() {
        let image = app_image(1000);
        let mut fifo = ByteFifo::<512>::new();
        let (mut tx, rx) = fifo.split();
        let mut seq = Sequencer::new(MockBoard::new(), MockFlash::new(), rx, 0);

        let mut requests = vec![
            encode(Request::Erase(EraseRequest {
                address: consts::FLASH_META_ADDRESS,
                size: consts::FLASH_META_SIZE,
            })),
            encode(Request::Erase(EraseRequest {
                address: FLASH_APP_ADDRESS,
                size: consts::FLASH_APP_SIZE,
            })),
        ];
        for (i, chunk) in image.chunks(256).enumerate() {
            requests.push(encode(Request::Write(WriteRequest {
                address: FLASH_APP_ADDRESS + 256 * i as u32,
                data: chunk,
            })));
        }
        let record = host_protocol::image_record(&image);
        requests.push(encode(Request::Write(WriteRequest {
            address: consts::FLASH_META_ADDRESS + consts::FLASH_META_RECORD_OFFSET,
            data: &record,
        })));
        for request in &requests {
            send(&mut tx, request);
            drain(&mut seq);
        }
        assert!(responses(seq.board()).iter().all(|r| r.status() == Status::Ok));

        let mut flash = seq.dispatcher.release();
        let mut board = MockBoard::new();
        assert_eq!(startup_delay(&mut board, &mut flash), BOOT_DELAY_MS);
    }

    #[test]
    fn startup_sends_nothing_on_the_link() {
        let mut board = MockBoard::new();
        let mut flash = MockFlash::new();
        flash.provision(&app_image(1024));
        startup_delay(&mut board, &mut flash);
        assert!(board.sent.is_empty());

        let mut board = MockBoard::new();
        startup_delay(&mut board, &mut MockFlash::new());
        assert!(board.sent.is_empty());
    }

    #[test]
    fn startup_traps_on_button() {
        let mut board = MockBoard::new();
        board.pressed = true;
        let mut flash = MockFlash::new();
        flash.provision(&app_image(1024));
        assert_eq!(startup_delay(&mut board, &mut flash), 0);
        assert!(board.trapped_led);
        assert_eq!(board.releases, 1);
        assert!(!board.pressed);
    }

    #[test]
    fn startup_traps_on_bad_metadata() {
        let mut board = MockBoard::new();
        let mut flash = MockFlash::new();
        assert_eq!(startup_delay(&mut board, &mut flash), 0);
        assert!(board.trapped_led);

        let mut board = MockBoard::new();
        let mut flash = MockFlash::new();
        flash.provision(&app_image(1024));
        flash.load(FLASH_APP_ADDRESS + 512, &[0]);
        assert_eq!(startup_delay(&mut board, &mut flash), 0);
    }
}
