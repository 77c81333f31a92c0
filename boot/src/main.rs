#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

//! Reset entry for the system MCU. Decides, in order: act on a pending
//! update record, jump into the resident application, or stay put and
//! serve the companion processor's firmware link.

mod companion;
mod config;
mod flags;
mod ident;
mod jump;
mod update;

#[cfg(not(test))]
mod init;
#[cfg(not(test))]
mod logger;
#[cfg(not(test))]
mod platform;

#[cfg(test)]
mod testutil;

#[cfg(not(test))]
fn kmain() -> ! {
    use hal::{IoPin, PinDir, SysCtl};
    use modem::Modem;

    use platform::{
        I2cIrq, IntFlash, Pin, Sys, Ticker, LINK, MODEM_RING, PIN_BOOT_REQUEST,
        PIN_COMPANION_RESET, PIN_COMPANION_WAKE, PIN_EZPORT_CS, PIN_MODEM_RESET, SPI_COMPANION,
    };

    // companion boot request: pulled up, driven low to ask us to stay
    // resident
    let mut boot_req = Pin::new(PIN_BOOT_REQUEST);
    boot_req.set_dir(PinDir::Input);
    let boot_requested = !boot_req.read();

    logger::init();

    let clock = Ticker;
    let sys = Sys;
    let mut flash = IntFlash;
    let mut modem = Modem::new(
        platform::ModemPort,
        Pin::new(PIN_MODEM_RESET),
        &MODEM_RING,
        &clock,
    );
    let mut ezport_cs = Pin::new(PIN_EZPORT_CS);
    let mut companion_reset = Pin::new(PIN_COMPANION_RESET);

    // acts on a pending update record; ends in a reset when it does
    update::check_flags(
        &mut flash,
        &sys,
        &clock,
        &mut modem,
        platform::SpiBus::new(SPI_COMPANION),
        &mut ezport_cs,
        &mut companion_reset,
    );

    if !boot_requested {
        // returns only if the application image fails validation
        jump::to_app();
        log::warn!("application image failed validation");
    }

    sys.low_level_init();
    log::info!("staying resident, serving the companion link");

    let mut pins = companion::Pins {
        reset: companion_reset,
        wake: Pin::new(PIN_COMPANION_WAKE),
        boot_req,
        ezport_cs,
    };
    companion::run(&LINK, &mut flash, &I2cIrq, &clock, &sys, &mut pins)
}
