//! Interrupt pipeline scenarios: promotion from peripheral flags,
//! priority arbitration, the SREG.I interlock and the RETI
//! main-program guarantee.

use super::{load_program, mcu_with_program, run_cycles, sim_tick};
use crate::avr::models;
use crate::avr::sreg;
use crate::avr::McuState;

const TIFR: usize = 0x58;
const TIMSK: usize = 0x59;
const TIMER0_OVF_VECT: usize = 8;

#[test]
fn test_timer0_overflow_dispatches_next_tick() {
    // SEI, then spin. TCCR0 = 1 clocks timer 0 undivided; TOIE0
    // unmasks its overflow.
    let (mut mcu, _) = models::init("m8a").unwrap();
    load_program(&mut mcu, &[0x9478, 0xCFFF]); // SEI; RJMP .
    mcu.pm[1 + TIMER0_OVF_VECT] = 0x9518; // RETI in the vector slot
    mcu.write_ds(0x53, 0x01); // TCCR0
    mcu.write_ds(TIMSK as u32, 0x01);

    // 255 timer clocks: almost at the top, no overflow yet.
    for _ in 0..255 {
        sim_tick(&mut mcu);
    }
    assert_eq!(mcu.dm[0x52], 255);
    assert_eq!(mcu.dm[TIFR] & 1, 0);
    assert!(mcu.pc <= 1);

    // Clock 256 overflows and raises TOV0; the IRQ is promoted and
    // dispatched as soon as the spinning instruction completes.
    for _ in 0..3 {
        sim_tick(&mut mcu);
    }
    assert!(mcu.dm[0x52] < 4); // wrapped to zero and counting again
    assert_eq!(mcu.intr.irq[TIMER0_OVF_VECT], 0);
    assert_eq!(mcu.pc, 1 + TIMER0_OVF_VECT as u32);
    assert_eq!(mcu.sreg_flag(sreg::GLOBINT), 0);
    // The hardware flag was consumed on promotion.
    assert_eq!(mcu.dm[TIFR] & 1, 0);
}

#[test]
fn test_masked_interrupt_stays_latched_in_tifr() {
    let (mut mcu, _) = models::init("m8a").unwrap();
    load_program(&mut mcu, &[0x9478, 0xCFFF]);
    mcu.write_ds(0x53, 0x01); // clock timer 0, leave TOIE0 masked

    for _ in 0..300 {
        sim_tick(&mut mcu);
    }
    // The overflow happened and the flag is set, but no IRQ fired.
    assert_eq!(mcu.dm[TIFR] & 1, 1);
    assert_eq!(mcu.intr.irq[TIMER0_OVF_VECT], 0);
    assert!(mcu.pc <= 1);
}

#[test]
fn test_interlock_requires_global_interrupt_enable() {
    // Spin without SEI: a pending IRQ never dispatches.
    let mut mcu = mcu_with_program(&[0xCFFF]); // RJMP .
    mcu.intr.request(3);

    for _ in 0..10 {
        sim_tick(&mut mcu);
    }
    assert_eq!(mcu.intr.irq[3], 1);
    assert_eq!(mcu.pc, 0);
}

#[test]
fn test_priority_and_exec_main_fairness() {
    // Two IRQs pending at once: the lower vector wins, and after its
    // RETI exactly one main-program instruction runs before the
    // second is served.
    // Three NOPs, then spin in place so a stray PC can't fall into
    // the vector slots.
    let mut mcu = mcu_with_program(&[0x0000, 0x0000, 0x0000, 0xCFFF]);
    let vec_a = 3usize;
    let vec_b = 5usize;
    mcu.pm[1 + vec_a] = 0x9518; // RETI
    mcu.pm[1 + vec_b] = 0x9518;

    mcu.sreg_update(sreg::GLOBINT, 1);
    mcu.intr.request(vec_a as u8);
    mcu.intr.request(vec_b as u8);

    let mut trace = Vec::new();
    for _ in 0..20 {
        trace.push(mcu.pc);
        sim_tick(&mut mcu);
    }

    let isr_a = trace.iter().position(|&pc| pc == 1 + vec_a as u32);
    let isr_b = trace.iter().position(|&pc| pc == 1 + vec_b as u32);
    let (isr_a, isr_b) = (isr_a.expect("ISR A entered"), isr_b.expect("ISR B entered"));

    // Lowest index first.
    assert!(isr_a < isr_b);

    // At least one main-program PC (the NOP run) between the ISRs.
    assert!(
        trace[isr_a..isr_b].iter().any(|&pc| pc <= 3),
        "no main-program instruction between ISRs: {:?}",
        trace
    );
}

#[test]
fn test_reti_sets_i_and_exec_main() {
    // RETI alone: I comes back on and the next IRQ has to wait.
    let mut mcu = mcu_with_program(&[0x9518]);
    // Return address 0x0002, low byte pushed first.
    mcu.stack_push(0x02);
    mcu.stack_push(0x00);

    run_cycles(&mut mcu, 4);
    assert_eq!(mcu.sreg_flag(sreg::GLOBINT), 1);
    assert!(mcu.intr.exec_main);
    assert_eq!(mcu.pc, 0x02);
}

#[test]
fn test_trap_at_isr_steps_into_the_handler() {
    let (mut mcu, _) = models::init("m8a").unwrap();
    load_program(&mut mcu, &[0x9478, 0x0000, 0x0000]); // SEI; NOPs
    mcu.pm[1 + TIMER0_OVF_VECT] = 0x0000; // NOP in the handler
    mcu.intr.trap_at_isr = true;
    mcu.intr.request(TIMER0_OVF_VECT as u8);

    sim_tick(&mut mcu); // SEI, then the IRQ dispatches and traps
    assert_eq!(mcu.pc, 1 + TIMER0_OVF_VECT as u32);
    // The trap halts the MCU right at the handler's entry, before its
    // first instruction runs.
    assert_eq!(mcu.state, McuState::Stopped);

    // Nothing executes while stopped.
    sim_tick(&mut mcu);
    assert_eq!(mcu.pc, 1 + TIMER0_OVF_VECT as u32);
}

#[test]
fn test_irq_return_address_roundtrip() {
    // Dispatch from deep in the program and come back through RETI.
    let (mut mcu, _) = models::init("m8a").unwrap();
    load_program(&mut mcu, &[0x0000; 32]);
    mcu.pm[1 + TIMER0_OVF_VECT] = 0x9518;
    mcu.pc = 0x14;
    mcu.sreg_update(sreg::GLOBINT, 1);
    mcu.intr.request(TIMER0_OVF_VECT as u8);

    sim_tick(&mut mcu); // NOP at 0x14 + dispatch
    assert_eq!(mcu.pc, 1 + TIMER0_OVF_VECT as u32);

    // RETI (4 cycles) returns past the interrupted instruction.
    for _ in 0..4 {
        sim_tick(&mut mcu);
    }
    assert_eq!(mcu.pc, 0x15);
    assert_eq!(mcu.sreg_flag(sreg::GLOBINT), 1);
}
