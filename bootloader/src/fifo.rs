// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Single-producer/single-consumer byte ring between the UART receive
//! interrupt and the main loop.

use heapless::spsc::{self, Queue};

/// Ring of `N` bytes holding at most `N - 1` of them: one slot is given up
/// so that full and empty differ.
pub struct ByteFifo<const N: usize> {
    queue: Queue<u8, N>,
}

impl<const N: usize> ByteFifo<N> {
    pub const fn new() -> Self {
        assert!(N >= 2, "a ByteFifo needs at least two slots");
        Self { queue: Queue::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Hand out the only producer and the only consumer of this FIFO.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        let (tx, rx) = self.queue.split();
        (Producer { inner: tx }, Consumer { inner: rx })
    }
}

impl<const N: usize> Default for ByteFifo<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side, owned by the receive interrupt.
pub struct Producer<'a, const N: usize> {
    inner: spsc::Producer<'a, u8, N>,
}

impl<'a, const N: usize> Producer<'a, N> {
    /// Queue one byte. `false` means the FIFO was full and the byte is lost;
    /// the interrupt never waits for room.
    pub fn put(&mut self, byte: u8) -> bool {
        self.inner.enqueue(byte).is_ok()
    }

    /// Receive callback entry point: queue `bytes` up to the first one that
    /// does not fit, returning how many were accepted.
    pub fn put_slice(&mut self, bytes: &[u8]) -> usize {
        bytes.iter().take_while(|&&byte| self.inner.enqueue(byte).is_ok()).count()
    }

    pub fn is_full(&self) -> bool {
        !self.inner.ready()
    }
}

/// Read side, owned by the main loop.
pub struct Consumer<'a, const N: usize> {
    inner: spsc::Consumer<'a, u8, N>,
}

impl<'a, const N: usize> Consumer<'a, N> {
    pub fn get(&mut self) -> Option<u8> {
        self.inner.dequeue()
    }

    pub fn is_empty(&self) -> bool {
        !self.inner.ready()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}
