//! Boot-time arbitration: read the flags record once, act on it, and end
//! every update in a fresh reset so the next boot re-evaluates from
//! scratch. The loaders pull images out of the modem's storage (or a
//! staged internal region) and stream them into internal or companion
//! flash.

use core::cmp::min;
use core::time::Duration;

use hal::{Clock, Flash, IoPin, PinDir, SpiMaster, SysCtl, TxPort};
use modem::Modem;
use spiflash::{ExtFlash, Kind};

use crate::config::{
    COMPANION_APP_BASE, EXT_SECTOR_SIZE, INT_SECTOR_SIZE, MODEM_CHUNK, SYSTEM_APP_BASE,
};
use crate::flags::{FlagsRecord, Request};

/// Runs once at the very start of boot, before anything else may touch
/// the hardware. Returns only on the normal-boot paths; a consumed update
/// record always ends in a system reset request.
pub fn check_flags<F, S, C, U, MP, SPI, CP, RP, const N: usize>(
    flash: &mut F,
    sys: &S,
    clock: &C,
    modem: &mut Modem<'_, U, C, MP, N>,
    mut companion_spi: SPI,
    companion_cs: &mut CP,
    companion_reset: &mut RP,
) where
    F: Flash,
    S: SysCtl,
    C: Clock,
    U: TxPort,
    MP: IoPin,
    SPI: SpiMaster,
    CP: IoPin,
    RP: IoPin,
{
    let record = FlagsRecord::load(flash);

    match record.request() {
        Request::EraseOnly => {
            sys.low_level_init();
            let _ = FlagsRecord::erase(flash);
            return;
        }
        Request::Normal => return,
        Request::Update => {}
    }

    sys.low_level_init();
    log::info!("update record accepted");

    if let Some((src, size)) = record.internal_replay() {
        log::info!("replaying staged image: {} bytes from {:#x}", size, src);
        load_system_from_internal(flash, src, size);
    }

    if record.wants_modem() {
        modem.ensure_responsive();

        if record.system.is_present() {
            if let Some(name) = record.system.filename() {
                log::info!("loading system image \"{}\"", name);
                load_system_from_modem(
                    flash,
                    modem,
                    name,
                    record.system.size(),
                    record.system.offset(),
                );
            } else {
                log::warn!("system descriptor has a bad filename, skipped");
            }
        }

        if record.companion_boot.is_present() || record.companion_app.is_present() {
            // strap the companion into its programming port: chip select
            // held low through a reset pulse
            companion_cs.clear();
            companion_reset.set_dir(PinDir::Output);
            companion_reset.clear();
            clock.busy_wait(Duration::from_millis(10));
            companion_reset.set();
            clock.busy_wait(Duration::from_millis(10));
            companion_cs.set();

            {
                let mut ext = ExtFlash::new(&mut companion_spi, &mut *companion_cs, Kind::EzPort);

                if record.companion_boot.is_present() {
                    if let Some(name) = record.companion_boot.filename() {
                        log::info!("loading companion bootloader \"{}\"", name);
                        load_companion_from_modem(
                            &mut ext,
                            modem,
                            0,
                            name,
                            record.companion_boot.size(),
                            record.companion_boot.offset(),
                        );
                    }
                }
                if record.companion_app.is_present() {
                    if let Some(name) = record.companion_app.filename() {
                        log::info!("loading companion application \"{}\"", name);
                        load_companion_from_modem(
                            &mut ext,
                            modem,
                            COMPANION_APP_BASE,
                            name,
                            record.companion_app.size(),
                            record.companion_app.offset(),
                        );
                    }
                }
            }

            // release the companion back into run mode
            companion_reset.clear();
            clock.busy_wait(Duration::from_millis(10));
            companion_reset.set_dir(PinDir::Input);
        }
    }

    let _ = FlagsRecord::erase(flash);

    clock.busy_wait(Duration::from_secs(3));
    sys.system_reset();
}

/// Streams a named image from the modem into the application region of
/// internal flash. A zero-length chunk read is retried indefinitely:
/// there is no fallback image once the first sector is gone, so giving up
/// would brick the board where persistence cannot.
pub fn load_system_from_modem<F, U, C, P, const N: usize>(
    flash: &mut F,
    modem: &mut Modem<'_, U, C, P, N>,
    filename: &str,
    image_size: u32,
    offset: u32,
) where
    F: Flash,
    U: TxPort,
    C: Clock,
    P: IoPin,
{
    let mut dst = SYSTEM_APP_BASE;
    let mut src = offset;
    let end = SYSTEM_APP_BASE + image_size;
    let mut buf = [0u8; MODEM_CHUNK];

    while dst < end {
        if dst & (INT_SECTOR_SIZE - 1) == 0 {
            let _ = flash.erase_sector(dst);
        }
        let want = min((end - dst) as usize, MODEM_CHUNK);
        let got = modem.read_chunk(filename, src, &mut buf[..want]);
        if got == 0 {
            continue;
        }

        let _ = flash.write_block(dst, &buf);
        dst += got as u32;
        src += got as u32;
    }
}

/// Same loop against the companion's external flash. Here a zero-length
/// read aborts instead of retrying; the companion still has its resident
/// image and a later update attempt can finish the job.
pub fn load_companion_from_modem<S, CS, U, C, P, const N: usize>(
    ext: &mut ExtFlash<S, CS>,
    modem: &mut Modem<'_, U, C, P, N>,
    dst: u32,
    filename: &str,
    image_size: u32,
    offset: u32,
) where
    S: SpiMaster,
    CS: IoPin,
    U: TxPort,
    C: Clock,
    P: IoPin,
{
    let mut dst = dst;
    let mut src = offset;
    let end = dst + image_size;
    let mut buf = [0u8; MODEM_CHUNK];

    while dst < end {
        if dst & (EXT_SECTOR_SIZE - 1) == 0 {
            ext.erase_sector(dst);
        }
        let want = min((end - dst) as usize, MODEM_CHUNK);
        let got = modem.read_chunk(filename, src, &mut buf[..want]);
        if got == 0 {
            log::warn!("companion transfer aborted at {:#x}", dst);
            return;
        }

        ext.write_block(dst, &buf);
        dst += got as u32;
        src += got as u32;
    }
}

/// Copies a staged image already sitting in internal flash down to the
/// application base, a sector at a time.
pub fn load_system_from_internal<F: Flash>(flash: &mut F, src: u32, size: u32) {
    let mut dst = SYSTEM_APP_BASE;
    let mut src = src;
    let end = SYSTEM_APP_BASE + size;
    let mut buf = [0u8; INT_SECTOR_SIZE as usize];

    while dst < end {
        let _ = flash.erase_sector(dst);
        flash.read(src, &mut buf);
        let _ = flash.write_block(dst, &buf);
        dst += INT_SECTOR_SIZE;
        src += INT_SECTOR_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FLAGS_ADDR;
    use crate::flags::MAGIC_UPDATE;
    use crate::testutil::{MockFlash, MockPin, MockSpi, MockSys, ScriptPort, StepClock};
    use ring::Ring;

    const RING: usize = crate::config::MODEM_RING_SIZE;

    fn urdblock_reply(name: &str, data: &[u8]) -> Vec<u8> {
        let mut reply = format!("+URDBLOCK: \"{}\",{},\"", name, data.len()).into_bytes();
        reply.extend_from_slice(data);
        reply.extend_from_slice(b"\"\r\nOK\r\n");
        reply
    }

    fn stamp_update_magic(flash: &mut MockFlash) {
        flash.write_block(FLAGS_ADDR, &MAGIC_UPDATE.to_le_bytes()).unwrap();
        flash
            .write_block(FLAGS_ADDR + 0x324, &MAGIC_UPDATE.to_le_bytes())
            .unwrap();
    }

    fn stamp_descriptor(flash: &mut MockFlash, desc_off: u32, name: &str, size: u32, offset: u32) {
        flash
            .write_block(FLAGS_ADDR + desc_off, &size.to_le_bytes())
            .unwrap();
        flash
            .write_block(FLAGS_ADDR + desc_off + 4, &offset.to_le_bytes())
            .unwrap();
        let mut padded = name.as_bytes().to_vec();
        padded.push(0);
        flash
            .write_block(FLAGS_ADDR + desc_off + 8, &padded)
            .unwrap();
    }

    #[test]
    fn empty_update_record_just_erases_and_resets() {
        let mut flash = MockFlash::new();
        stamp_update_magic(&mut flash);
        flash.erases.clear();
        flash.writes.clear();

        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);
        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        let sys = MockSys::new();
        let spi = MockSpi::new();
        let mut cs = MockPin::new();
        let mut reset = MockPin::new();

        check_flags(
            &mut flash, &sys, &clock, &mut modem, spi, &mut cs, &mut reset,
        );

        assert_eq!(sys.inits.get(), 1);
        assert_eq!(sys.resets.get(), 1);
        assert_eq!(flash.erases, vec![FLAGS_ADDR]);
        assert!(flash.writes.is_empty());
        assert!(modem.uart().sent.is_empty());
    }

    #[test]
    fn erase_only_record_clears_and_returns() {
        let mut flash = MockFlash::new();
        flash
            .write_block(FLAGS_ADDR, &crate::flags::MAGIC_ERASE_ONLY.to_le_bytes())
            .unwrap();
        flash.erases.clear();
        flash.writes.clear();

        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);
        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        let sys = MockSys::new();

        check_flags(
            &mut flash,
            &sys,
            &clock,
            &mut modem,
            MockSpi::new(),
            &mut MockPin::new(),
            &mut MockPin::new(),
        );

        assert_eq!(sys.inits.get(), 1);
        assert_eq!(sys.resets.get(), 0);
        assert_eq!(flash.erases, vec![FLAGS_ADDR]);
    }

    #[test]
    fn normal_boot_touches_nothing() {
        let mut flash = MockFlash::new();
        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);
        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        let sys = MockSys::new();

        check_flags(
            &mut flash,
            &sys,
            &clock,
            &mut modem,
            MockSpi::new(),
            &mut MockPin::new(),
            &mut MockPin::new(),
        );

        assert_eq!(sys.inits.get(), 0);
        assert!(flash.erases.is_empty());
        assert!(flash.writes.is_empty());
    }

    #[test]
    fn system_image_streams_into_internal_flash() {
        let mut flash = MockFlash::new();
        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);

        // 40-byte image: one full chunk, one 8-byte tail
        port.queue_reply(b"\r\nOK\r\n"); // echo-off probe
        port.queue_reply(&urdblock_reply("sys.bin", &[0x11; 32]));
        port.queue_reply(&urdblock_reply("sys.bin", &[0x22; 8]));

        stamp_update_magic(&mut flash);
        stamp_descriptor(&mut flash, 0x214, "sys.bin", 40, 512);
        flash.erases.clear();
        flash.writes.clear();

        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        let sys = MockSys::new();

        check_flags(
            &mut flash,
            &sys,
            &clock,
            &mut modem,
            MockSpi::new(),
            &mut MockPin::new(),
            &mut MockPin::new(),
        );

        // destination sector erased once, then the flags sector
        assert_eq!(flash.erases, vec![SYSTEM_APP_BASE, FLAGS_ADDR]);
        let mut probe = [0u8; 40];
        flash.read(SYSTEM_APP_BASE, &mut probe);
        assert!(probe[..32].iter().all(|&b| b == 0x11));
        assert!(probe[32..].iter().all(|&b| b == 0x22));
        assert_eq!(sys.resets.get(), 1);

        // both requests went to the right offsets in the stored file
        let sent = &modem.uart().sent;
        assert!(sent
            .iter()
            .any(|s| s.as_slice() == b"AT+URDBLOCK=\"sys.bin\",512,32\r" as &[u8]));
        assert!(sent
            .iter()
            .any(|s| s.as_slice() == b"AT+URDBLOCK=\"sys.bin\",544,8\r" as &[u8]));
    }

    #[test]
    fn internal_loader_retries_a_zero_length_chunk() {
        let mut flash = MockFlash::new();
        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);

        // a bad reply first; the loop must ask again for the same offset
        port.queue_reply(b"+URDBLOCK: \"sys.bin\",999,\"x\"\r\nOK\r\n");
        port.queue_reply(&urdblock_reply("sys.bin", &[0x5A; 16]));

        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        load_system_from_modem(&mut flash, &mut modem, "sys.bin", 16, 0);

        let requests: Vec<_> = modem
            .uart()
            .sent
            .iter()
            .filter(|s| s.starts_with(b"AT+URDBLOCK"))
            .cloned()
            .collect();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);

        let mut probe = [0u8; 16];
        flash.read(SYSTEM_APP_BASE, &mut probe);
        assert!(probe.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn companion_loader_aborts_on_a_zero_length_chunk() {
        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);

        port.queue_reply(&urdblock_reply("cb.bin", &[0xC3; 32]));
        // second chunk gets garbage; the external loader gives up
        port.queue_reply(b"garbage\r\n");

        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        let mut spi = MockSpi::new();
        let mut cs = MockPin::new();
        let mut ext = ExtFlash::new(&mut spi, &mut cs, Kind::EzPort);

        load_companion_from_modem(&mut ext, &mut modem, 0, "cb.bin", 64, 0);

        let requests = modem
            .uart()
            .sent
            .iter()
            .filter(|s| s.starts_with(b"AT+URDBLOCK"))
            .count();
        // no retry after the failure
        assert_eq!(requests, 2);

        // one erase (at zero), one 32-byte page program, nothing more
        let programs = spi.program_count();
        assert_eq!(programs, 1);
        assert_eq!(spi.erase_count(), 1);
    }

    #[test]
    fn staged_replay_copies_sector_by_sector() {
        let mut flash = MockFlash::new();
        let src = 0x0002_0000;
        flash.fill(src, 0xE7, 2048);
        flash.erases.clear();
        flash.writes.clear();

        load_system_from_internal(&mut flash, src, 2048);

        assert_eq!(flash.erases, vec![SYSTEM_APP_BASE, SYSTEM_APP_BASE + 1024]);
        let mut probe = [0u8; 2048];
        flash.read(SYSTEM_APP_BASE, &mut probe);
        assert!(probe.iter().all(|&b| b == 0xE7));
    }

    #[test]
    fn companion_images_pulse_the_programming_strap() {
        let mut flash = MockFlash::new();
        let ring: Ring<RING> = Ring::new();
        let clock = StepClock::new();
        let port = ScriptPort::new(&ring);

        port.queue_reply(b"\r\nOK\r\n"); // echo-off probe
        port.queue_reply(&urdblock_reply("cb.bin", &[0x77; 16]));

        stamp_update_magic(&mut flash);
        stamp_descriptor(&mut flash, 0x004, "cb.bin", 16, 0);
        flash.erases.clear();
        flash.writes.clear();

        let mut modem = Modem::new(port, MockPin::new(), &ring, &clock);
        let sys = MockSys::new();
        let mut cs = MockPin::new();
        let mut reset = MockPin::new();
        let cs_ops = cs.ops.clone();
        let reset_ops = reset.ops.clone();

        check_flags(
            &mut flash,
            &sys,
            &clock,
            &mut modem,
            MockSpi::new(),
            &mut cs,
            &mut reset,
        );

        use crate::testutil::PinOp;
        // entry strap: select low through the reset pulse
        let ops = cs_ops.borrow();
        assert_eq!(ops[0], PinOp::Clear);
        assert_eq!(ops[1], PinOp::Set);
        let ops = reset_ops.borrow();
        assert_eq!(
            &ops[..4],
            &[
                PinOp::Dir(PinDir::Output),
                PinOp::Clear,
                PinOp::Set,
                PinOp::Clear,
            ]
        );
        // released back to input at the end
        assert_eq!(*ops.last().unwrap(), PinOp::Dir(PinDir::Input));
        assert_eq!(sys.resets.get(), 1);
    }
}
