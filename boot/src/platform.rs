//! Bindings to the vendor driver layer: every symbol in the `extern`
//! block below is provided by the generated pin-mux/clock/peripheral
//! glue that this crate is linked against. The types here adapt those
//! calls to the hal traits, and the `*_isr` functions are the interrupt
//! entry points the vendor vector table dispatches into.

use core::fmt;
use core::time::Duration;

use hal::{Clock, Flash, FlashError, IoPin, IrqMask, PinDir, SlaveEvent, SpiMaster, SysCtl, TxPort};
use ring::Ring;

use crate::companion::{CompanionLink, Reply};
use crate::config::MODEM_RING_SIZE;

/// SPI instance wired to the companion's EZ-port.
pub const SPI_COMPANION: u32 = 0;

pub const PIN_MODEM_RESET: u32 = 1;
pub const PIN_COMPANION_RESET: u32 = 2;
pub const PIN_COMPANION_WAKE: u32 = 3;
pub const PIN_BOOT_REQUEST: u32 = 4;
pub const PIN_EZPORT_CS: u32 = 5;

const IRQ_I2C_SLAVE: u32 = 24;

extern "C" {
    fn bsp_millis() -> u32;
    fn bsp_delay_us(us: u32);
    fn bsp_low_level_init();
    fn bsp_system_reset();
    /// Safe before `bsp_low_level_init`; output is dropped until the
    /// port is up.
    fn bsp_debug_send(data: *const u8, len: usize);
    fn bsp_modem_uart_send(data: *const u8, len: usize);
    fn bsp_spi_transfer(instance: u32, tx: *const u8, rx: *mut u8, len: usize);
    fn bsp_gpio_set_dir(pin: u32, output: bool);
    fn bsp_gpio_read(pin: u32) -> bool;
    fn bsp_gpio_set(pin: u32);
    fn bsp_gpio_clear(pin: u32);
    fn bsp_flash_erase_sector(addr: u32) -> i32;
    fn bsp_flash_program(addr: u32, data: *const u8, len: usize) -> i32;
    fn bsp_irq_set_enabled(irq: u32, enabled: bool);
    fn bsp_i2c_slave_set_rx(buf: *mut u8, len: usize);
    fn bsp_i2c_slave_set_tx(buf: *const u8, len: usize);
    fn bsp_i2c_slave_set_tx_busy(busy: bool);
}

/// Receive ring fed by the modem UART interrupt.
pub static MODEM_RING: Ring<MODEM_RING_SIZE> = Ring::new();

/// The companion-link state shared with the I2C slave interrupt.
pub static LINK: CompanionLink = CompanionLink::new();

pub struct Ticker;

impl Clock for Ticker {
    fn now(&self) -> Duration {
        Duration::from_millis(unsafe { bsp_millis() } as u64)
    }

    fn busy_wait_micros(&self, us: u32) {
        unsafe { bsp_delay_us(us) }
    }
}

pub struct DebugPort;

impl TxPort for DebugPort {
    fn send(&mut self, bytes: &[u8]) {
        unsafe { bsp_debug_send(bytes.as_ptr(), bytes.len()) }
    }
}

impl fmt::Write for DebugPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.as_bytes() {
            if *byte == b'\n' {
                self.send(b"\r");
            }
            self.send(core::slice::from_ref(byte));
        }
        Ok(())
    }
}

pub struct ModemPort;

impl TxPort for ModemPort {
    fn send(&mut self, bytes: &[u8]) {
        unsafe { bsp_modem_uart_send(bytes.as_ptr(), bytes.len()) }
    }
}

pub struct SpiBus {
    instance: u32,
}

impl SpiBus {
    pub const fn new(instance: u32) -> Self {
        SpiBus { instance }
    }
}

impl SpiMaster for SpiBus {
    fn write(&mut self, tx: &[u8]) {
        unsafe { bsp_spi_transfer(self.instance, tx.as_ptr(), core::ptr::null_mut(), tx.len()) }
    }

    fn read(&mut self, rx: &mut [u8]) {
        unsafe { bsp_spi_transfer(self.instance, core::ptr::null(), rx.as_mut_ptr(), rx.len()) }
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) {
        unsafe { bsp_spi_transfer(self.instance, tx.as_ptr(), rx.as_mut_ptr(), tx.len()) }
    }
}

pub struct Pin(u32);

impl Pin {
    pub const fn new(id: u32) -> Self {
        Pin(id)
    }
}

impl IoPin for Pin {
    fn set_dir(&mut self, dir: PinDir) {
        unsafe { bsp_gpio_set_dir(self.0, dir == PinDir::Output) }
    }

    fn read(&self) -> bool {
        unsafe { bsp_gpio_read(self.0) }
    }

    fn set(&mut self) {
        unsafe { bsp_gpio_set(self.0) }
    }

    fn clear(&mut self) {
        unsafe { bsp_gpio_clear(self.0) }
    }
}

pub struct IntFlash;

impl Flash for IntFlash {
    fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if unsafe { bsp_flash_erase_sector(addr) } == 0 {
            Ok(())
        } else {
            Err(FlashError::Erase)
        }
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if unsafe { bsp_flash_program(addr, data.as_ptr(), data.len()) } == 0 {
            Ok(())
        } else {
            Err(FlashError::Program)
        }
    }

    fn read(&self, addr: u32, buf: &mut [u8]) {
        // program flash is memory mapped
        unsafe {
            core::ptr::copy_nonoverlapping(addr as usize as *const u8, buf.as_mut_ptr(), buf.len())
        }
    }
}

pub struct Sys;

impl SysCtl for Sys {
    fn low_level_init(&self) {
        unsafe { bsp_low_level_init() }
    }

    fn system_reset(&self) {
        unsafe { bsp_system_reset() }
    }
}

pub struct I2cIrq;

impl IrqMask for I2cIrq {
    fn disable(&self) {
        unsafe { bsp_irq_set_enabled(IRQ_I2C_SLAVE, false) }
    }

    fn enable(&self) {
        unsafe { bsp_irq_set_enabled(IRQ_I2C_SLAVE, true) }
    }
}

/// Modem UART receive interrupt: one byte per event. Overflow drops the
/// byte; the transfer protocol recovers by re-requesting the chunk.
#[no_mangle]
pub extern "C" fn modem_uart_rx_isr(byte: u8) {
    let _ = MODEM_RING.push(byte);
}

/// I2C slave event interrupt. Runs the protocol engine and applies its
/// reply to the driver's transfer registers.
#[no_mangle]
pub extern "C" fn companion_i2c_event_isr(event: u32) {
    let event = match event {
        0 => SlaveEvent::ReceiveRequest,
        1 => SlaveEvent::ReceiveFull,
        2 => SlaveEvent::TransmitRequest,
        3 => SlaveEvent::TransmitEmpty,
        _ => return,
    };

    match LINK.on_event(event, &IntFlash) {
        Reply::RecvInto(buf) => unsafe {
            bsp_i2c_slave_set_tx(core::ptr::null(), 0);
            bsp_i2c_slave_set_rx(buf.as_mut_ptr(), buf.len());
        },
        Reply::RecvNone => unsafe {
            bsp_i2c_slave_set_rx(core::ptr::null_mut(), 0);
        },
        Reply::Send(buf) => unsafe {
            bsp_i2c_slave_set_tx(buf.as_ptr(), buf.len());
        },
        Reply::SendNone => unsafe {
            bsp_i2c_slave_set_tx(core::ptr::null(), 0);
            bsp_i2c_slave_set_rx(core::ptr::null_mut(), 0);
        },
        Reply::AcceptSend => unsafe {
            bsp_i2c_slave_set_tx_busy(true);
        },
        Reply::EndSend => unsafe {
            bsp_i2c_slave_set_tx_busy(false);
        },
        Reply::None => {}
    }
}
