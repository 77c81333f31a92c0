//! Identity block baked into every image on this board at a fixed offset
//! from its base. The companion processor reads versions out of these over
//! I2C, and the update tooling uses the validity marker to tell a complete
//! image from a half-programmed one.

pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 2;
pub const VERSION_REVISION: u8 = 0;

/// Present in the `valid` word of a fully programmed image.
pub const IDENT_VALID: u32 = 0x5650_5041; // "APPV"

const IDENT_MAGIC: u32 = 0x544F_4F42; // "BOOT"
const DEVICE_CODE: u32 = 0x324B_524C; // "LRK2"

#[repr(C)]
pub struct IdentBlock {
    magic: u32,
    device: u32,
    major: u8,
    minor: u8,
    revision: u8,
    pad: u8,
    valid: u32,
    manufacturer: [u8; 16],
    product: [u8; 16],
    role: [u8; 16],
    processor: [u8; 16],
    description: [u8; 32],
}

macro_rules! const_assert_size {
    ($expr:tt, $size:tt) => {
        const _: fn(a: $expr) -> [u8; $size] =
            |a| unsafe { core::mem::transmute::<$expr, [u8; $size]>(a) };
    };
}

const_assert_size!(IdentBlock, 112);

impl IdentBlock {
    /// Major/minor/revision, contiguous, as sent on the wire.
    pub fn version_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(&self.major as *const u8, 3) }
    }
}

#[link_section = ".ident"]
#[no_mangle]
pub static IDENT: IdentBlock = IdentBlock {
    magic: IDENT_MAGIC,
    device: DEVICE_CODE,
    major: VERSION_MAJOR,
    minor: VERSION_MINOR,
    revision: VERSION_REVISION,
    pad: 0,
    valid: IDENT_VALID,
    manufacturer: *b"lark systems\0\0\0\0",
    product: *b"lark\0\0\0\0\0\0\0\0\0\0\0\0",
    role: *b"boot\0\0\0\0\0\0\0\0\0\0\0\0",
    processor: *b"system\0\0\0\0\0\0\0\0\0\0",
    description: *b"system bootloader\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0",
};
