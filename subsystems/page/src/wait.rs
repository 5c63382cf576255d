//! # Wait Channels
//!
//! The sleep/wakeup primitive the page layer blocks on: busy waiters
//! sleep on page identity, allocation waiters sleep on a per-domain
//! free condition. A channel is a generation word; sleepers capture the
//! generation, re-check their predicate, and spin-pause until the
//! generation moves. Wakers bump the generation.
//!
//! A full kernel would park the thread on a sleep queue here. The
//! protocol is identical either way: every wake forces the sleeper to
//! re-validate its predicate, never to assume progress.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use strata_hal::cpu::relax;

/// A single wakeup channel.
#[derive(Debug, Default)]
pub struct WaitChannel {
    gen: AtomicU32,
}

impl WaitChannel {
    /// Create an idle channel.
    pub const fn new() -> Self {
        Self { gen: AtomicU32::new(0) }
    }

    /// Capture the current generation. Must be read before the final
    /// predicate check that decides to sleep, so a wakeup between the
    /// check and the sleep is not lost.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.gen.load(Ordering::Acquire)
    }

    /// Sleep until the generation moves past `gen`.
    pub fn sleep(&self, gen: u32) {
        while self.gen.load(Ordering::Acquire) == gen {
            relax();
        }
    }

    /// Sleep until the generation moves past `gen` or `cond` holds.
    pub fn sleep_until<F: Fn() -> bool>(&self, gen: u32, cond: F) {
        while self.gen.load(Ordering::Acquire) == gen && !cond() {
            relax();
        }
    }

    /// Wake every sleeper on this channel.
    #[inline]
    pub fn wake_all(&self) {
        self.gen.fetch_add(1, Ordering::Release);
    }
}

/// Hashed table of wait channels keyed by an opaque identity, used to
/// sleep on "this page" without a channel per descriptor.
#[derive(Debug)]
pub struct WaitTable {
    channels: Box<[WaitChannel]>,
    mask: u64,
}

impl WaitTable {
    /// Create a table with `buckets` channels, rounded up to a power of
    /// two.
    pub fn new(buckets: usize) -> Self {
        let n = buckets.next_power_of_two().max(2);
        let mut channels = Vec::with_capacity(n);
        channels.resize_with(n, WaitChannel::new);
        Self { channels: channels.into_boxed_slice(), mask: (n - 1) as u64 }
    }

    /// Channel for the given identity. Collisions cause spurious
    /// wakeups, which every sleeper must tolerate anyway.
    #[inline]
    pub fn channel(&self, key: u64) -> &WaitChannel {
        // Fibonacci hash spreads sequential page ids across buckets.
        let h = key.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32;
        &self.channels[(h & self.mask) as usize]
    }
}
