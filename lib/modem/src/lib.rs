#![cfg_attr(not(test), no_std)]

//! File reads out of the cellular module's internal storage, over the
//! AT-command link. The module buffers firmware images downloaded by the
//! application; during an update this crate pulls them back out chunk by
//! chunk:
//!
//! ```text
//! -> AT+URDBLOCK="<name>",<offset>,<size>\r
//! <- +URDBLOCK: "<name>",<n>,"<data>"\r\nOK\r\n
//! ```
//!
//! Receive traffic arrives through the interrupt-fed ring buffer; all
//! parsing runs on the foreground thread with bounded waits.

use core::fmt::Write;
use core::time::Duration;

use arrayvec::ArrayString;
use hal::{Clock, IoPin, PinDir, TxPort};
use ring::Ring;

/// `AT+URDBLOCK="<255-byte name>",<offset>,<size>\r` worst case.
type CmdBuf = ArrayString<300>;

/// XON; nudges a module that stopped its transmitter via flow control.
const PAUSE_BYTE: u8 = 0x11;

/// Probe failures tolerated before escalating to the reset line.
const SOFT_RETRIES: u32 = 3;

const LINE_TIMEOUT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness escalation ladder. Probing never stops: there is no fallback
/// image, so the boot path has nothing useful to do until the module
/// answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Probe { failures: u32 },
    Pause { failures: u32 },
    HardReset,
    Cooldown,
}

pub struct Modem<'a, U, C, P, const N: usize> {
    uart: U,
    reset: P,
    rx: &'a Ring<N>,
    clock: &'a C,
}

impl<'a, U, C, P, const N: usize> Modem<'a, U, C, P, N>
where
    U: TxPort,
    C: Clock,
    P: IoPin,
{
    pub fn new(uart: U, reset: P, rx: &'a Ring<N>, clock: &'a C) -> Self {
        Modem {
            uart,
            reset,
            rx,
            clock,
        }
    }

    /// The underlying port, for callers that speak to the module outside
    /// the transfer protocol.
    pub fn uart(&self) -> &U {
        &self.uart
    }

    /// Kills command echo. Success doubles as the liveness probe: a
    /// module that answers `OK` here is ready for URDBLOCK traffic.
    pub fn echo_off(&mut self) -> bool {
        self.rx.flush();
        self.uart.send(b"ATE0\r");
        self.rx.find_string("OK", self.clock, RESPONSE_TIMEOUT)
    }

    /// Blocks until the module responds to `echo_off`, walking the
    /// escalation ladder: three soft probes, then a hardware reset pulse
    /// and a cooldown, over and over.
    pub fn ensure_responsive(&mut self) {
        let mut step = Escalation::Probe { failures: 0 };
        loop {
            step = match step {
                Escalation::Probe { failures } => {
                    if self.echo_off() {
                        return;
                    }
                    let failures = failures + 1;
                    if failures >= SOFT_RETRIES {
                        Escalation::HardReset
                    } else {
                        Escalation::Pause { failures }
                    }
                }
                Escalation::Pause { failures } => {
                    self.uart.send(&[PAUSE_BYTE]);
                    self.clock.busy_wait(Duration::from_secs(1));
                    Escalation::Probe { failures }
                }
                Escalation::HardReset => {
                    log::warn!("modem unresponsive, pulsing reset");
                    self.pulse_reset();
                    Escalation::Cooldown
                }
                Escalation::Cooldown => {
                    self.clock.busy_wait(Duration::from_secs(3));
                    Escalation::Probe { failures: 0 }
                }
            };
        }
    }

    /// Active-low reset pulse. The line idles as an input with a board
    /// pull-up; releasing means reverting the direction, not driving
    /// high.
    fn pulse_reset(&mut self) {
        self.reset.clear();
        self.reset.set_dir(PinDir::Output);
        self.clock.busy_wait_micros(60);
        self.reset.set_dir(PinDir::Input);
    }

    /// Reads up to `buf.len()` bytes of `filename` starting at `offset`.
    /// Returns the byte count actually received, or 0 on any parse
    /// failure — including the module claiming more data than was asked
    /// for, which is treated as a malformed reply rather than trusted.
    pub fn read_chunk(&mut self, filename: &str, offset: u32, buf: &mut [u8]) -> usize {
        let mut cmd = CmdBuf::new();
        if write!(
            cmd,
            "AT+URDBLOCK=\"{}\",{},{}\r",
            filename,
            offset,
            buf.len()
        )
        .is_err()
        {
            return 0;
        }

        self.rx.flush();
        self.uart.send(cmd.as_bytes());

        if !self
            .rx
            .find_string("+URDBLOCK: \"", self.clock, RESPONSE_TIMEOUT)
        {
            return 0;
        }
        if !self.rx.find_string(filename, self.clock, LINE_TIMEOUT) {
            return 0;
        }
        if !self.rx.find_string("\",", self.clock, LINE_TIMEOUT) {
            return 0;
        }

        let mut digits = [0u8; 12];
        let len = match self.rx.read_until(&mut digits, b',', self.clock, LINE_TIMEOUT) {
            Some(len) => len,
            None => return 0,
        };
        let size_read = match parse_decimal(&digits[..len]) {
            Some(v) => v as usize,
            None => return 0,
        };
        if size_read > buf.len() {
            return 0;
        }

        if !self.rx.find_string("\"", self.clock, LINE_TIMEOUT) {
            return 0;
        }
        let actual = self
            .rx
            .read(&mut buf[..size_read], self.clock, LINE_TIMEOUT);
        if !self
            .rx
            .find_string("\r\nOK\r\n", self.clock, RESPONSE_TIMEOUT)
        {
            return 0;
        }

        actual
    }
}

fn parse_decimal(digits: &[u8]) -> Option<u32> {
    core::str::from_utf8(digits).ok()?.trim().parse().ok()
}
