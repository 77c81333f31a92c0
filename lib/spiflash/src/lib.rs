#![cfg_attr(not(test), no_std)]

//! SPI-NOR style programming protocol for the two serial-flash targets
//! hanging off the board: the companion MCU's EZ-port (which speaks the
//! same command set while strapped into programming mode) and the plain
//! serial NOR part. The two differ in erase opcode and in whether the
//! unlock/software-reset commands exist.

use hal::{IoPin, SpiMaster};

const CMD_READ: u8 = 0x03;
const CMD_PAGE_PROGRAM: u8 = 0x02;
const CMD_WRITE_ENABLE: u8 = 0x06;
const CMD_WRITE_DISABLE: u8 = 0x04;
const CMD_READ_STATUS: u8 = 0x05;
const CMD_UNLOCK: u8 = 0x98;
const CMD_RESET_ENABLE: u8 = 0x66;
const CMD_RESET: u8 = 0x99;

const STATUS_BUSY: u8 = 0x01;

pub const PAGE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Companion MCU flash behind its EZ-port.
    EzPort,
    /// On-board serial NOR.
    SerialNor,
}

impl Kind {
    fn erase_opcode(self) -> u8 {
        match self {
            Kind::EzPort => 0xD8,
            Kind::SerialNor => 0x20,
        }
    }

    fn has_unlock(self) -> bool {
        self == Kind::SerialNor
    }

    fn has_reset(self) -> bool {
        self == Kind::SerialNor
    }
}

pub struct ExtFlash<S, P> {
    spi: S,
    cs: P,
    kind: Kind,
}

fn addressed(op: u8, address: u32) -> [u8; 4] {
    [
        op,
        (address >> 16) as u8,
        (address >> 8) as u8,
        address as u8,
    ]
}

impl<S: SpiMaster, P: IoPin> ExtFlash<S, P> {
    pub fn new(spi: S, cs: P, kind: Kind) -> Self {
        ExtFlash { spi, cs, kind }
    }

    fn select(&mut self) {
        self.cs.clear();
    }

    fn deselect(&mut self) {
        self.cs.set();
    }

    /// One-byte command in its own chip-select window.
    fn bare_command(&mut self, op: u8) {
        self.select();
        self.spi.write(&[op]);
        self.deselect();
    }

    fn write_enable(&mut self, enable: bool) {
        self.bare_command(if enable {
            CMD_WRITE_ENABLE
        } else {
            CMD_WRITE_DISABLE
        });
    }

    /// Spins on the status register until the busy bit clears. A wedged
    /// part hangs this loop; there is no watchdog in this design to break
    /// it.
    fn poll_busy(&mut self) {
        let tx = [CMD_READ_STATUS, 0];
        let mut rx = [0u8; 2];
        loop {
            self.select();
            self.spi.transfer(&tx, &mut rx);
            self.deselect();
            if rx[1] & STATUS_BUSY == 0 {
                return;
            }
        }
    }

    pub fn read_block(&mut self, address: u32, buf: &mut [u8]) {
        self.select();
        self.spi.write(&addressed(CMD_READ, address));
        self.spi.read(buf);
        self.deselect();
    }

    /// Programs `buf` starting at `address`, slicing the payload into
    /// page-sized transfers counted from the start address. Never touches
    /// more than `buf.len()` bytes of the device.
    pub fn write_block(&mut self, mut address: u32, buf: &[u8]) {
        for chunk in buf.chunks(PAGE_SIZE) {
            self.write_enable(true);

            self.select();
            self.spi.write(&addressed(CMD_PAGE_PROGRAM, address));
            self.spi.write(chunk);
            self.deselect();

            self.poll_busy();
            self.write_enable(false);

            address += chunk.len() as u32;
        }
    }

    pub fn erase_sector(&mut self, address: u32) {
        log::trace!("ext erase {:#08x}", address);
        self.write_enable(true);

        self.select();
        self.spi.write(&addressed(self.kind.erase_opcode(), address));
        self.deselect();

        self.poll_busy();
        self.write_enable(false);
    }

    /// Clears the block-protection bits on parts that have the command;
    /// no-op on the EZ-port.
    pub fn unlock(&mut self) {
        if !self.kind.has_unlock() {
            return;
        }
        self.write_enable(true);
        self.bare_command(CMD_UNLOCK);
        self.poll_busy();
        self.write_enable(false);
    }

    /// Software reset (enable + reset pair) on parts that support it.
    pub fn reset(&mut self) {
        if !self.kind.has_reset() {
            return;
        }
        self.bare_command(CMD_RESET_ENABLE);
        self.bare_command(CMD_RESET);
    }
}
