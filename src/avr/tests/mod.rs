//! Shared fixtures for the instruction and interrupt tests.

mod instructions;
mod irq;

use crate::avr::models;
use crate::avr::simcore::{handle_irq, pass_irqs};
use crate::avr::sreg;
use crate::avr::{Mcu, McuState};

/// An ATmega8A with `words` loaded at the start of flash, running.
pub fn mcu_with_program(words: &[u16]) -> Mcu {
    let (mut mcu, _) = models::init("m8a").unwrap();
    load_program(&mut mcu, words);
    mcu
}

/// Load `words` at the start of flash and start the MCU.
pub fn load_program(mcu: &mut Mcu, words: &[u16]) {
    for (i, w) in words.iter().enumerate() {
        mcu.pm[i] = *w;
    }
    mcu.state = McuState::Running;
}

/// Run the decoder for `n` clock cycles, no peripherals involved.
pub fn run_cycles(mcu: &mut Mcu, n: u32) {
    for _ in 0..n {
        mcu.step().unwrap();
    }
}

/// One full simulation cycle: timers, decode, pin sync, IRQ
/// promotion and dispatch, in the loop's order.
pub fn sim_tick(mcu: &mut Mcu) {
    if mcu.is_active() {
        mcu.update_timers();
    }
    if mcu.ic_left > 0 || mcu.is_active() {
        mcu.step().unwrap();
        mcu.io_sync_pinx();
    }
    pass_irqs(mcu);
    if mcu.sreg_flag(sreg::GLOBINT) == 1 && mcu.ic_left == 0 && !mcu.intr.exec_main && mcu.is_active()
    {
        handle_irq(mcu);
    }
    if mcu.ic_left == 0 {
        mcu.intr.exec_main = false;
    }
    mcu.tick += 1;
    if mcu.ic_left == 0 && mcu.state == McuState::Step {
        mcu.state = McuState::Stopped;
    }
}

/// SREG flags as a compact readable tuple: (C, Z, N, V, S, H).
pub fn flags(mcu: &Mcu) -> (u8, u8, u8, u8, u8, u8) {
    (
        mcu.sreg_flag(sreg::CARRY),
        mcu.sreg_flag(sreg::ZERO),
        mcu.sreg_flag(sreg::NEG),
        mcu.sreg_flag(sreg::TCOF),
        mcu.sreg_flag(sreg::SIGN),
        mcu.sreg_flag(sreg::HCARRY),
    )
}
