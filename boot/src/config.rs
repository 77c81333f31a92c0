//! Board memory map and link parameters shared across the boot modules.

/// Where the resident system application lives in internal flash.
pub const SYSTEM_APP_BASE: u32 = 0x0000_6000;

/// First address past the internal flash array.
pub const APP_FLASH_END: u32 = 0x0004_0000;

/// RAM window a sane initial stack pointer must land in (exclusive floor,
/// inclusive ceiling).
pub const STACK_FLOOR: u32 = 0x1FFF_E000;
pub const STACK_CEILING: u32 = 0x2000_6000;

/// Internal program-flash erase granularity.
pub const INT_SECTOR_SIZE: u32 = 1024;

/// Erase granularity of the companion's external flash.
pub const EXT_SECTOR_SIZE: u32 = 4096;

/// The persistent flags record occupies the sector just below the
/// application image.
pub const FLAGS_ADDR: u32 = SYSTEM_APP_BASE - INT_SECTOR_SIZE;

/// Companion application offset within the companion's external flash;
/// its bootloader sits at 0.
pub const COMPANION_APP_BASE: u32 = 0x0000_8000;

/// Largest single URDBLOCK request.
pub const MODEM_CHUNK: usize = 32;

/// Modem receive ring; two sectors' worth absorbs a full response burst.
pub const MODEM_RING_SIZE: usize = 2 * INT_SECTOR_SIZE as usize;

/// Firmware block payload carried per I2C write command.
pub const BLOCK_PAYLOAD: usize = 1024;

/// Offset of an image's identity block from its base address.
pub const APP_IDENT_OFFSET: u32 = 0xC0;
