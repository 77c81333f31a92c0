//! Mock collaborators for the unit tests: scripted flash, pins, clock,
//! system control, and a UART port that answers like the modem's ISR
//! feed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use core::time::Duration;

use hal::{Clock, Flash, FlashError, IoPin, IrqMask, PinDir, SpiMaster, SysCtl, TxPort};
use ring::Ring;

use crate::config::INT_SECTOR_SIZE;

/// Byte-addressable stand-in for the internal flash array.
pub struct MockFlash {
    pub mem: Vec<u8>,
    pub erases: Vec<u32>,
    pub writes: Vec<(u32, Vec<u8>)>,
    pub fail_erase: bool,
    pub fail_program: bool,
}

impl MockFlash {
    pub fn new() -> Self {
        MockFlash {
            mem: vec![0xFF; 0x0004_0000],
            erases: Vec::new(),
            writes: Vec::new(),
            fail_erase: false,
            fail_program: false,
        }
    }

    pub fn fill(&mut self, addr: u32, value: u8, len: usize) {
        let addr = addr as usize;
        for b in &mut self.mem[addr..addr + len] {
            *b = value;
        }
    }
}

impl Flash for MockFlash {
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if self.fail_erase {
            return Err(FlashError::Erase);
        }
        let base = (addr & !(INT_SECTOR_SIZE - 1)) as usize;
        if base + INT_SECTOR_SIZE as usize > self.mem.len() {
            return Err(FlashError::Erase);
        }
        self.erases.push(addr);
        for b in &mut self.mem[base..base + INT_SECTOR_SIZE as usize] {
            *b = 0xFF;
        }
        Ok(())
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.fail_program {
            return Err(FlashError::Program);
        }
        let base = addr as usize;
        if base + data.len() > self.mem.len() {
            return Err(FlashError::Program);
        }
        self.writes.push((addr, data.to_vec()));
        self.mem[base..base + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        let base = addr as usize;
        buf.copy_from_slice(&self.mem[base..base + buf.len()]);
    }
}

/// Advances one millisecond per observation so spin loops always finish.
pub struct StepClock {
    t: Cell<u64>,
}

impl StepClock {
    pub fn new() -> Self {
        StepClock { t: Cell::new(0) }
    }
}

impl Clock for StepClock {
    fn now(&self) -> Duration {
        let t = self.t.get();
        self.t.set(t + 1);
        Duration::from_millis(t)
    }

    fn busy_wait_micros(&self, _us: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOp {
    Dir(PinDir),
    Set,
    Clear,
}

pub struct MockPin {
    pub ops: Rc<RefCell<Vec<PinOp>>>,
    pub level: Cell<bool>,
}

impl MockPin {
    pub fn new() -> Self {
        MockPin {
            ops: Rc::new(RefCell::new(Vec::new())),
            level: Cell::new(true),
        }
    }
}

impl IoPin for MockPin {
    fn set_dir(&mut self, dir: PinDir) {
        self.ops.borrow_mut().push(PinOp::Dir(dir));
    }

    fn read(&self) -> bool {
        self.level.get()
    }

    fn set(&mut self) {
        self.level.set(true);
        self.ops.borrow_mut().push(PinOp::Set);
    }

    fn clear(&mut self) {
        self.level.set(false);
        self.ops.borrow_mut().push(PinOp::Clear);
    }
}

pub struct MockSys {
    pub inits: Cell<u32>,
    pub resets: Cell<u32>,
}

impl MockSys {
    pub fn new() -> Self {
        MockSys {
            inits: Cell::new(0),
            resets: Cell::new(0),
        }
    }
}

impl SysCtl for MockSys {
    fn low_level_init(&self) {
        self.inits.set(self.inits.get() + 1);
    }

    fn system_reset(&self) {
        self.resets.set(self.resets.get() + 1);
    }
}

pub struct MockIrq {
    depth: Cell<i32>,
    pub max_depth: Cell<i32>,
}

impl MockIrq {
    pub fn new() -> Self {
        MockIrq {
            depth: Cell::new(0),
            max_depth: Cell::new(0),
        }
    }
}

impl IrqMask for MockIrq {
    fn disable(&self) {
        let d = self.depth.get() + 1;
        self.depth.set(d);
        if d > self.max_depth.get() {
            self.max_depth.set(d);
        }
    }

    fn enable(&self) {
        self.depth.set(self.depth.get() - 1);
    }
}

/// Records SPI traffic; status polls always answer "ready".
pub struct MockSpi {
    pub writes: Vec<Vec<u8>>,
}

impl MockSpi {
    pub fn new() -> Self {
        MockSpi { writes: Vec::new() }
    }

    pub fn program_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| w.len() == 4 && w[0] == 0x02)
            .count()
    }

    pub fn erase_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|w| w.len() == 4 && (w[0] == 0xD8 || w[0] == 0x20))
            .count()
    }
}

impl SpiMaster for MockSpi {
    fn write(&mut self, tx: &[u8]) {
        self.writes.push(tx.to_vec());
    }

    fn read(&mut self, rx: &mut [u8]) {
        for b in rx.iter_mut() {
            *b = 0;
        }
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) {
        for b in rx.iter_mut() {
            *b = 0;
        }
        self.writes.push(tx.to_vec());
    }
}

/// TX port that records commands and answers AT traffic from a scripted
/// reply queue by pushing into the receive ring, standing in for the
/// UART interrupt.
pub struct ScriptPort<'a, const N: usize> {
    ring: &'a Ring<N>,
    pub sent: Vec<Vec<u8>>,
    replies: RefCell<Vec<Vec<u8>>>,
}

impl<'a, const N: usize> ScriptPort<'a, N> {
    pub fn new(ring: &'a Ring<N>) -> Self {
        ScriptPort {
            ring,
            sent: Vec::new(),
            replies: RefCell::new(Vec::new()),
        }
    }

    pub fn queue_reply(&self, reply: &[u8]) {
        self.replies.borrow_mut().push(reply.to_vec());
    }
}

impl<'a, const N: usize> TxPort for ScriptPort<'a, N> {
    fn send(&mut self, bytes: &[u8]) {
        self.sent.push(bytes.to_vec());
        if bytes.starts_with(b"AT") {
            let mut replies = self.replies.borrow_mut();
            if !replies.is_empty() {
                for b in replies.remove(0) {
                    assert!(self.ring.push(b), "test reply overflowed the ring");
                }
            }
        }
    }
}
