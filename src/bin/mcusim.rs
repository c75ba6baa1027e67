//! mcusim command line front end
//!
//! Reads a configuration file, builds the simulation and runs it until
//! the firmware test finishes or the debugger kills it. On termination
//! signals the current flash contents are dumped to `.mcusim.flash` so
//! the next run can pick them up with `reset_flash no`.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;

use mcusim::avr::simcore::CycleOutcome;
use mcusim::avr::McuState;
use mcusim::{Config, Simulation};

/// Instruction-accurate simulator for 8-bit AVR microcontrollers.
#[derive(Parser)]
#[command(name = "mcusim", version, about)]
struct Args {
    /// Configuration file.
    #[arg(short = 'c', long = "conf", value_name = "FILE")]
    conf: String,
}

/// Set by the signal handler; the simulation loop stops at the next
/// instruction boundary.
static STOP: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        libc::signal(libc::SIGQUIT, handler as libc::sighandler_t);
        libc::signal(libc::SIGABRT, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let conf = Config::from_file(&args.conf)
        .with_context(|| format!("reading configuration '{}'", args.conf))?;

    let mut sim = Simulation::init(&conf).context("initializing the simulation")?;
    install_signal_handlers();

    let result = loop {
        if STOP.swap(false, Ordering::SeqCst) {
            log::info!("termination signal received, stopping");
            sim.mcu.state = McuState::SimStop;
        }
        match sim.step_cycle() {
            Ok(CycleOutcome::Continue) => {}
            Ok(CycleOutcome::Stopped) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    // Keep the flash around for the next run no matter how we exit.
    sim.shutdown();

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            log::error!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
