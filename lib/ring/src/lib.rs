#![cfg_attr(not(test), no_std)]

//! Fixed-capacity byte queue shared between one interrupt-context producer
//! and one foreground consumer, plus the timeout-bounded token scanner the
//! modem protocol is parsed with.
//!
//! The queue holds at most `N - 1` bytes: `head == tail` is empty,
//! `head + 1 == tail (mod N)` is full. Each index has exactly one writer,
//! so plain atomic loads and stores are enough; no index is ever
//! read-modify-written across contexts. That also keeps the type usable on
//! cores without compare-and-swap.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use hal::Clock;

pub struct Ring<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<const N: usize> Sync for Ring<N> {}

impl<const N: usize> Ring<N> {
    pub const fn new() -> Self {
        Ring {
            buf: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn next(index: usize) -> usize {
        (index + 1) % N
    }

    /// Producer side. Never blocks: a full queue drops the byte and
    /// reports it, which is the accepted loss policy for the serial links
    /// this backs.
    pub fn push(&self, byte: u8) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = Self::next(head);
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        unsafe {
            (*self.buf.get())[head] = byte;
        }
        self.head.store(next, Ordering::Release);
        true
    }

    pub fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let byte = unsafe { (*self.buf.get())[tail] };
        self.tail.store(Self::next(tail), Ordering::Release);
        Some(byte)
    }

    pub fn peek(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { (*self.buf.get())[tail] })
    }

    pub fn available(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            N + head - tail
        }
    }

    pub fn is_full(&self) -> bool {
        Self::next(self.head.load(Ordering::Acquire)) == self.tail.load(Ordering::Acquire)
    }

    /// Discards everything buffered so far. Consumer-side only: it moves
    /// `tail` up to `head`, keeping the one-writer-per-index rule intact
    /// while the producer interrupt stays live.
    pub fn flush(&self) {
        self.tail
            .store(self.head.load(Ordering::Acquire), Ordering::Release);
    }

    /// Consumes bytes until the whole of `pattern` has been matched.
    ///
    /// While hunting for the first pattern byte everything else is
    /// discarded. Once matching, a mismatching byte is left in the queue
    /// and reconsidered as a candidate first byte, so overlapping starts
    /// are retried from the mismatch position rather than past it. An
    /// empty pattern matches immediately and consumes nothing. The whole
    /// call is bounded by the cumulative `timeout`.
    pub fn find_string(&self, pattern: &str, clock: &impl Clock, timeout: Duration) -> bool {
        let pattern = pattern.as_bytes();
        if pattern.is_empty() {
            return true;
        }

        let start = clock.now();
        let mut seeking = true;
        let mut matched = 0;

        while clock.now() - start < timeout {
            if seeking {
                let elapsed = clock.now() - start;
                let left = timeout.checked_sub(elapsed).unwrap_or_default();
                if !self.skip_until(pattern[0], clock, left) {
                    return false;
                }
                matched = 1;
                if matched == pattern.len() {
                    return true;
                }
                seeking = false;
            } else {
                while let Some(byte) = self.peek() {
                    if byte == pattern[matched] {
                        self.pop();
                        matched += 1;
                        if matched == pattern.len() {
                            return true;
                        }
                    } else {
                        seeking = true;
                        break;
                    }
                }
            }
        }
        false
    }

    /// Discards bytes up to and including `delim`. True if the delimiter
    /// was consumed before the timeout.
    pub fn skip_until(&self, delim: u8, clock: &impl Clock, timeout: Duration) -> bool {
        let start = clock.now();
        loop {
            while let Some(byte) = self.pop() {
                if byte == delim {
                    return true;
                }
            }
            if clock.now() - start >= timeout {
                return false;
            }
        }
    }

    /// Copies bytes into `buf` until `delim` arrives. The delimiter is
    /// consumed and not stored. Bytes beyond `buf.len()` are consumed and
    /// discarded, bounding the copy against an over-long field. Returns
    /// the stored count, or `None` on timeout.
    pub fn read_until(
        &self,
        buf: &mut [u8],
        delim: u8,
        clock: &impl Clock,
        timeout: Duration,
    ) -> Option<usize> {
        let start = clock.now();
        let mut stored = 0;
        loop {
            while let Some(byte) = self.pop() {
                if byte == delim {
                    return Some(stored);
                }
                if stored < buf.len() {
                    buf[stored] = byte;
                    stored += 1;
                }
            }
            if clock.now() - start >= timeout {
                return None;
            }
        }
    }

    /// Reads up to `buf.len()` bytes, giving up at the timeout. Returns
    /// the count actually read; callers must expect short reads.
    pub fn read(&self, buf: &mut [u8], clock: &impl Clock, timeout: Duration) -> usize {
        let start = clock.now();
        let mut read = 0;
        while read < buf.len() {
            if let Some(byte) = self.pop() {
                buf[read] = byte;
                read += 1;
                continue;
            }
            if clock.now() - start >= timeout {
                break;
            }
        }
        read
    }
}
