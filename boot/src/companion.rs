//! Command engine for the companion processor's I2C link. The slave
//! peripheral raises events from interrupt context; `on_event` runs the
//! protocol state machine and answers with a `Reply` descriptor that the
//! platform glue applies to the driver. Everything that touches flash or
//! pins is deferred to `service`, which the foreground loop polls.
//!
//! Protocol: the master writes a one-byte command, then either reads the
//! staged response or follows up with a 1 KiB firmware block. Block 0 of
//! an image holds the vector table; its payload is held back in RAM and
//! only committed when the master sends RESET, so a partial image never
//! looks bootable.

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use core::time::Duration;

use hal::{Clock, Flash, IoPin, IrqMask, PinDir, SlaveEvent, SysCtl};

use crate::config::{APP_IDENT_OFFSET, BLOCK_PAYLOAD, SYSTEM_APP_BASE};
use crate::ident;

const CMD_READ_STATUS: u8 = 0x01;
const CMD_WRITE_SYSTEM_BLOCK: u8 = 0x02;
const CMD_USER_NOTIFY: u8 = 0x22;
const CMD_BOOT_VERSION: u8 = 0x42;
const CMD_FIRMWARE_VERSION: u8 = 0x43;
const CMD_RESET: u8 = 0x55;

// status register bits, read by the companion
#[repr(u8)]
enum StatusBit {
    Busy = 1,
    Error = 1 << 1,
}

// deferred work raised in interrupt context, taken by the poll task
const FLAG_WRITE_SYSTEM: u32 = 1 << 0;
const FLAG_RESET: u32 = 1 << 2;
const FLAG_USER_NOTIFY: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Cmd,
    Rx,
    Tx,
}

/// One firmware block as it arrives on the wire: big-endian block index,
/// then the payload.
#[repr(C)]
pub struct Block {
    hi: u8,
    lo: u8,
    payload: [u8; BLOCK_PAYLOAD],
}

macro_rules! const_assert_size {
    ($expr:tt, $size:tt) => {
        const _: fn(a: $expr) -> [u8; $size] =
            |a| unsafe { core::mem::transmute::<$expr, [u8; $size]>(a) };
    };
}

const_assert_size!(Block, 1026);

impl Block {
    fn index(&self) -> u32 {
        ((self.hi as u32) << 8) | self.lo as u32
    }

    fn dest(&self) -> u32 {
        self.index() * BLOCK_PAYLOAD as u32 + SYSTEM_APP_BASE
    }
}

/// What the platform glue should do to the slave peripheral after an
/// event: arm a receive, stage a transmit, or adjust the transfer state.
pub enum Reply<'a> {
    /// Arm a receive into this buffer (and drop any staged transmit).
    RecvInto(&'a mut [u8]),
    /// Arm a zero-length receive: the rejection idiom on this bus.
    RecvNone,
    /// Stage these bytes for the master to read.
    Send(&'a [u8]),
    /// Nothing staged: zero-length transfers in both directions.
    SendNone,
    /// A staged transmit is being clocked out; mark it in progress.
    AcceptSend,
    /// The transmit drained; clear the in-progress mark.
    EndSend,
    None,
}

/// The one aggregate of state shared between the interrupt handler and
/// the poll task.
///
/// Context rules, which are what make the interior mutability sound on
/// this single-core part:
/// - `state`, `command`, `tx` are touched only from the slave-event
///   handler, which the hardware serializes.
/// - `flags` and `status` cross contexts; both sides use plain atomic
///   loads and stores, and the poll task brackets its read-modify-write
///   in the I2C interrupt mask.
/// - `block` is filled by the driver only while a receive is armed; the
///   handler refuses to arm while `busy` is set, and the poll task only
///   reads it while `busy` is set. The two never overlap.
/// - `held_first` and `write_on_reset` belong to the poll task alone.
pub struct CompanionLink {
    state: Cell<State>,
    command: UnsafeCell<u8>,
    tx: UnsafeCell<[u8; 8]>,
    block: UnsafeCell<Block>,
    status: AtomicU8,
    flags: AtomicU32,
    held_first: UnsafeCell<[u8; BLOCK_PAYLOAD]>,
    write_on_reset: Cell<bool>,
}

unsafe impl Sync for CompanionLink {}

impl CompanionLink {
    pub const fn new() -> Self {
        CompanionLink {
            state: Cell::new(State::Idle),
            command: UnsafeCell::new(0),
            tx: UnsafeCell::new([0; 8]),
            block: UnsafeCell::new(Block {
                hi: 0,
                lo: 0,
                payload: [0; BLOCK_PAYLOAD],
            }),
            status: AtomicU8::new(0),
            flags: AtomicU32::new(0),
            held_first: UnsafeCell::new([0; BLOCK_PAYLOAD]),
            write_on_reset: Cell::new(false),
        }
    }

    /// Slave-event entry point. Interrupt context; must not block.
    pub fn on_event<'s>(&'s self, event: SlaveEvent, flash: &impl Flash) -> Reply<'s> {
        match event {
            SlaveEvent::ReceiveRequest => {
                self.state.set(State::Cmd);
                Reply::RecvInto(unsafe { core::slice::from_mut(&mut *self.command.get()) })
            }
            SlaveEvent::ReceiveFull => match self.state.get() {
                State::Cmd => self.dispatch_command(flash),
                State::Rx => self.block_received(),
                _ => Reply::None,
            },
            SlaveEvent::TransmitRequest => {
                if self.state.get() == State::Tx {
                    Reply::AcceptSend
                } else {
                    // master reads without having requested anything
                    self.state.set(State::Idle);
                    Reply::SendNone
                }
            }
            SlaveEvent::TransmitEmpty => {
                self.state.set(State::Idle);
                Reply::EndSend
            }
        }
    }

    fn dispatch_command<'s>(&'s self, flash: &impl Flash) -> Reply<'s> {
        let command = unsafe { *self.command.get() };
        match command {
            CMD_READ_STATUS => {
                self.state.set(State::Tx);
                let tx = unsafe { &mut *self.tx.get() };
                let current = self.status.load(Ordering::Relaxed);
                tx[0] = current;
                // the error bit is consumed by the read
                self.status
                    .store(current & !(StatusBit::Error as u8), Ordering::Relaxed);
                Reply::Send(&tx[..1])
            }
            CMD_BOOT_VERSION => {
                self.state.set(State::Tx);
                Reply::Send(ident::IDENT.version_bytes())
            }
            CMD_FIRMWARE_VERSION => {
                self.state.set(State::Tx);
                let tx = unsafe { &mut *self.tx.get() };
                let mut head = [0u8; 16];
                flash.read(SYSTEM_APP_BASE + APP_IDENT_OFFSET, &mut head);
                let valid = u32::from_le_bytes([head[12], head[13], head[14], head[15]]);
                if valid == ident::IDENT_VALID {
                    tx[..3].copy_from_slice(&head[8..11]);
                } else {
                    // no (complete) application present
                    tx[..3].copy_from_slice(&[0, 0, 0]);
                }
                Reply::Send(&tx[..3])
            }
            CMD_WRITE_SYSTEM_BLOCK => {
                if self.status.load(Ordering::Relaxed) & StatusBit::Busy as u8 != 0 {
                    // previous block still pending; refuse the payload
                    self.state.set(State::Idle);
                    Reply::RecvNone
                } else {
                    self.state.set(State::Rx);
                    let block = self.block.get();
                    Reply::RecvInto(unsafe {
                        core::slice::from_raw_parts_mut(block as *mut u8, 2 + BLOCK_PAYLOAD)
                    })
                }
            }
            CMD_RESET => {
                self.state.set(State::Idle);
                self.flags.store(FLAG_RESET, Ordering::Release);
                Reply::None
            }
            CMD_USER_NOTIFY => {
                self.state.set(State::Idle);
                self.flags.store(FLAG_USER_NOTIFY, Ordering::Release);
                Reply::None
            }
            _ => {
                // not a command we know; reject it the same way as a
                // busy write so the bus never stalls on driver defaults
                self.state.set(State::Idle);
                Reply::RecvNone
            }
        }
    }

    fn block_received(&self) -> Reply<'_> {
        // no more writes until the poll task resolves this one
        let status = self.status.load(Ordering::Relaxed);
        self.status
            .store(status | StatusBit::Busy as u8, Ordering::Relaxed);
        self.state.set(State::Idle);
        self.flags.store(FLAG_WRITE_SYSTEM, Ordering::Release);
        Reply::None
    }

    #[cfg(test)]
    fn status_byte(&self) -> u8 {
        self.status.load(Ordering::Relaxed)
    }
}

pub struct Pins<R, W, B, E> {
    pub reset: R,
    pub wake: W,
    pub boot_req: B,
    pub ezport_cs: E,
}

/// Services one pass of deferred work raised by the interrupt handler.
pub fn service<F, I, C, S, E>(
    link: &CompanionLink,
    flash: &mut F,
    irq: &I,
    clock: &C,
    sys: &S,
    ezport_cs: &mut E,
) where
    F: Flash,
    I: IrqMask,
    C: Clock,
    S: SysCtl,
    E: IoPin,
{
    let flag = {
        let _mask = irq.masked();
        let flag = link.flags.load(Ordering::Acquire);
        link.flags.store(0, Ordering::Relaxed);
        flag
    };
    if flag == 0 {
        return;
    }

    let mut result: u8 = 0;

    if flag == FLAG_USER_NOTIFY {
        // extension point; nothing to do in the boot role yet
    }

    if flag == FLAG_WRITE_SYSTEM {
        result = StatusBit::Error as u8;
        // busy is set, so the handler cannot arm another receive into
        // this buffer while we read it
        let block = unsafe { &*link.block.get() };
        let dest = block.dest();
        if flash.erase_sector(dest).is_ok() {
            if block.index() == 0 {
                // hold the vector table back until the master commits
                let held = unsafe { &mut *link.held_first.get() };
                held.copy_from_slice(&block.payload);
                link.write_on_reset.set(true);
                result = 0;
            } else if flash.write_block(dest, &block.payload).is_ok() {
                result = 0;
            }
        }
        if result != 0 {
            log::warn!("block {} write failed", block.index());
        }
    }

    {
        let _mask = irq.masked();
        link.status.store(result, Ordering::Release);
    }

    ezport_cs.clear();
    clock.busy_wait(Duration::from_millis(1));

    if flag == FLAG_RESET {
        if link.write_on_reset.get() {
            let held = unsafe { &*link.held_first.get() };
            let _ = flash.write_block(SYSTEM_APP_BASE, held);
        }
        clock.busy_wait(Duration::from_millis(10));
        sys.system_reset();
    }

    ezport_cs.set();
}

/// The foreground task: brings the companion out of reset, then forever
/// alternates the wake-line pattern with deferred-flag service.
pub fn run<F, I, C, S, R, W, B, E>(
    link: &CompanionLink,
    flash: &mut F,
    irq: &I,
    clock: &C,
    sys: &S,
    pins: &mut Pins<R, W, B, E>,
) -> !
where
    F: Flash,
    I: IrqMask,
    C: Clock,
    S: SysCtl,
    R: IoPin,
    W: IoPin,
    B: IoPin,
    E: IoPin,
{
    pins.reset.set_dir(PinDir::Output);
    pins.reset.clear();
    pins.wake.set();
    pins.boot_req.set_dir(PinDir::Output);
    pins.boot_req.clear();
    clock.busy_wait(Duration::from_millis(10));
    pins.reset.set_dir(PinDir::Input);
    clock.busy_wait(Duration::from_millis(100));
    pins.boot_req.set_dir(PinDir::Input);

    let mut next_toggle = clock.now();
    let mut slot = 0;
    loop {
        // 100 ms soft-PWM keep-alive, unrelated to the protocol but
        // sharing the loop
        if next_toggle < clock.now() {
            next_toggle += Duration::from_millis(100);
            pins.wake.write(wake_level(slot));
            slot += 1;
            if slot >= 10 {
                slot = 0;
            }
        }

        service(link, flash, irq, clock, sys, &mut pins.ezport_cs);
    }
}

/// Ten 100 ms slots, high in slots 4 and 7.
fn wake_level(slot: u32) -> bool {
    slot == 4 || slot == 7
}
