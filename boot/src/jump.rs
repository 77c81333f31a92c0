//! Hand-off to the resident application. The first two words of its image
//! are the initial stack pointer and the reset vector; both have to point
//! somewhere plausible before we bet the CPU on them.

use crate::config::{APP_FLASH_END, STACK_CEILING, STACK_FLOOR, SYSTEM_APP_BASE};

/// True if the candidate vector words could belong to a real image: the
/// stack pointer inside the RAM window, the entry point inside the
/// application's slice of flash. An erased image (all ones) and a blank
/// one (all zeroes) both fail.
pub fn is_valid(sp: u32, pc: u32) -> bool {
    sp > STACK_FLOOR && sp <= STACK_CEILING && pc > SYSTEM_APP_BASE && pc < APP_FLASH_END
}

#[cfg(not(test))]
pub fn read_vectors() -> (u32, u32) {
    unsafe {
        (
            (SYSTEM_APP_BASE as *const u32).read_volatile(),
            ((SYSTEM_APP_BASE + 4) as *const u32).read_volatile(),
        )
    }
}

/// Jumps into the application; returns only if its vector table fails
/// validation, leaving the caller resident.
#[cfg(not(test))]
pub fn to_app() {
    let (sp, pc) = read_vectors();
    if !is_valid(sp, pc) {
        return;
    }
    unsafe { enter(sp, pc) }
}

#[cfg(all(not(test), target_arch = "arm"))]
unsafe fn enter(sp: u32, pc: u32) -> ! {
    use core::arch::asm;

    const SCB_VTOR: *mut u32 = 0xE000_ED08 as *mut u32;

    asm!("cpsid i", "dmb");
    SCB_VTOR.write_volatile(SYSTEM_APP_BASE);
    asm!(
        "dsb",
        "msr MSP, {sp}",
        "bx {pc}",
        sp = in(reg) sp,
        pc = in(reg) pc,
        options(noreturn),
    );
}

#[cfg(all(not(test), not(target_arch = "arm")))]
unsafe fn enter(_sp: u32, _pc: u32) -> ! {
    // only reachable on the target
    loop {}
}
