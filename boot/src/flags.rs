//! The persistent flags record: a fixed-layout control block in the sector
//! below the application image. The running application fills it in and
//! resets to request an update; the boot path consumes it exactly once and
//! erases it. The layout is shared with the application's writer, so the
//! byte offsets here are load-bearing.

use core::mem;
use core::str;

use hal::{Flash, FlashError};

use crate::config::FLAGS_ADDR;

macro_rules! const_assert_size {
    ($expr:tt, $size:tt) => {
        const _: fn(a: $expr) -> [u8; $size] =
            |a| unsafe { core::mem::transmute::<$expr, [u8; $size]>(a) };
    };
}

/// Full update request ("BOOT"); must appear at both ends of the record.
pub const MAGIC_UPDATE: u32 = 0x544F_4F42;

/// Erase-the-record-and-nothing-else request ("boot"). Exists to clear a
/// stuck record without running an update.
pub const MAGIC_ERASE_ONLY: u32 = 0x746F_6F62;

/// Erased-flash sentinel; a descriptor with this size is absent.
pub const ERASED: u32 = 0xFFFF_FFFF;

/// One named image held in the modem's file storage.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ImageDesc {
    size: u32,
    offset: u32,
    filename: [u8; 256],
}

const_assert_size!(ImageDesc, 264);

impl ImageDesc {
    pub fn is_present(&self) -> bool {
        self.size != ERASED
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// The stored name, up to the first NUL. `None` if it is not clean
    /// UTF-8; a record mangled that badly is not worth acting on.
    pub fn filename(&self) -> Option<&str> {
        let end = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.filename.len());
        str::from_utf8(&self.filename[..end]).ok()
    }
}

#[repr(C)]
pub struct FlagsRecord {
    special_code: u32,
    pub companion_boot: ImageDesc,
    pub companion_app: ImageDesc,
    pub system: ImageDesc,
    internal_system_src: u32,
    internal_system_size: u32,
    end_code: u32,
}

const_assert_size!(FlagsRecord, 0x328);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// No (or no valid) record; boot normally.
    Normal,
    /// Clear the record sector and carry on.
    EraseOnly,
    /// Run the full update sequence.
    Update,
}

impl FlagsRecord {
    pub fn load(flash: &impl Flash) -> FlagsRecord {
        let mut raw = [0u8; mem::size_of::<FlagsRecord>()];
        flash.read(FLAGS_ADDR, &mut raw);
        unsafe { mem::transmute(raw) }
    }

    /// Classifies the record. Anything but the exact magic pair (or the
    /// lone erase magic) boots normally, so random flash corruption fails
    /// closed.
    pub fn request(&self) -> Request {
        if self.special_code == MAGIC_ERASE_ONLY {
            return Request::EraseOnly;
        }
        if self.special_code != MAGIC_UPDATE || self.end_code != MAGIC_UPDATE {
            return Request::Normal;
        }
        Request::Update
    }

    /// Staged internal-to-internal copy, if one was left for us.
    pub fn internal_replay(&self) -> Option<(u32, u32)> {
        if self.internal_system_src != ERASED && self.internal_system_size != ERASED {
            Some((self.internal_system_src, self.internal_system_size))
        } else {
            None
        }
    }

    pub fn wants_modem(&self) -> bool {
        self.system.is_present()
            || self.companion_boot.is_present()
            || self.companion_app.is_present()
    }

    pub fn erase(flash: &mut impl Flash) -> Result<(), FlashError> {
        flash.erase_sector(FLAGS_ADDR)
    }
}
