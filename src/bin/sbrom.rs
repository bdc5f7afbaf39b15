// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot ROM program.
//!
//! This contains the reset entry point, trap vector and console for the ROM.
//! The lib crate decides what to do; the code here sets up the hart, builds
//! the board context and carries out the decision.

#![cfg_attr(target_arch = "riscv64", no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]

#[cfg(target_arch = "riscv64")]
mod rom {
    use core::fmt::Write;
    use core::sync::atomic::{compiler_fence, Ordering};

    use log::{error, info, LevelFilter, Log, Metadata, Record};

    use sbrom::bsp::plic;
    use sbrom::bsp::uart::SifiveUart;
    use sbrom::ppm::{self, BootAction};
    use sbrom::sp::transport::DEFAULT_BAUD_RATE;
    use sbrom::trap::{Interrupt, Trap, TrapRecord};

    // Select the appropriate BSP module as `board`
    cfg_if::cfg_if! {
        if #[cfg(feature = "target-board-unmatched")] {
            use sbrom::bsp::unmatched as board;
        } else if #[cfg(feature = "target-board-vc707")] {
            use sbrom::bsp::vc707 as board;
        }
    }

    core::arch::global_asm!(include_str!("start.S"));
    core::arch::global_asm!(include_str!("trap.S"));

    /// Log sink on the board's console port, if it has one.
    struct Console;

    static CONSOLE: Console = Console;

    impl Console {
        fn port() -> Option<SifiveUart> {
            // Safety: only the logger creates console handles, and output is
            // polled, so handles never conflict.
            unsafe { board::console() }
        }
    }

    impl Write for Console {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            if let Some(port) = Self::port() {
                port.write_all(s.as_bytes());
            }
            Ok(())
        }
    }

    impl Log for Console {
        fn enabled(&self, _: &Metadata) -> bool {
            true
        }

        fn log(&self, record: &Record) {
            let _ = writeln!(Console, "[{}] {}", record.level(), record.args());
        }

        fn flush(&self) {}
    }

    fn init_console() {
        match Console::port() {
            Some(port) if port.configure_polled(DEFAULT_BAUD_RATE).is_ok() => {
                if log::set_logger(&CONSOLE).is_ok() {
                    log::set_max_level(LevelFilter::Info);
                }
            }
            _ => (),
        }
    }

    /// Stops the hart for good. Reset and shutdown both end here; the
    /// platform's supervisor notices the ROM going quiet.
    fn park() -> ! {
        plic::disable_interrupts();
        loop {
            // Safety: no operands.
            unsafe { core::arch::asm!("wfi", options(nomem, nostack)) };
            compiler_fence(Ordering::SeqCst);
        }
    }

    #[no_mangle]
    extern "C" fn sbrom_main() -> ! {
        init_console();
        info!("sbrom {:#010x}", sbrom::SBR_VERSION);

        // Safety: we're on hart 0, once, with the trap vector installed.
        let mut ctx = match unsafe { board::take(sbrom::ROOT_KEYS) } {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("board setup: {:?}", e);
                park()
            }
        };

        match ppm::manage(&mut ctx) {
            BootAction::Launch(image) => {
                plic::disable_interrupts();
                // Safety: `manage` wiped the context, and nothing else the
                // ROM holds matters to the loader.
                unsafe { image.launch() }
            }
            BootAction::Reset | BootAction::Shutdown => park(),
        }
    }

    #[no_mangle]
    extern "C" fn sbrom_trap(record: &TrapRecord) {
        match record.trap() {
            Trap::Asynchronous(Interrupt::MachineExternal) => board::on_external_interrupt(),
            trap => {
                error!(
                    "trap: {:?} mepc {:#x} mtval {:#x} ra {:#x}",
                    trap, record.mepc, record.mtval, record.ra
                );
                park()
            }
        }
    }

    #[panic_handler]
    fn panic_handler(info: &core::panic::PanicInfo) -> ! {
        error!("{}", info);
        park()
    }
}

// Host builds have nothing to run; the firmware only exists for the target.
#[cfg(not(target_arch = "riscv64"))]
fn main() {
    eprintln!("sbrom runs on riscv64 only; see `cargo xtask build`");
}
