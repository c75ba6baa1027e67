//! Part descriptors
//!
//! Each supported part contributes two things: a descriptor that wires
//! the generic engines (timers, watchdog, USART, interrupts) to its
//! register layout, and a `Model` implementation carrying the
//! behaviour that genuinely differs between parts: fuse decoding, the
//! per-tick peripheral hook and the SPM state machine.

mod m2560;
mod m328p;
mod m8a;

use super::io::IoReg;
use super::timer::ComAction;
use super::{Bootloader, ClkSource, Interrupts, Mcu, McuState, Usart, Wdt};

/// Per-part behaviour hooks, installed next to the MCU at init.
pub trait Model {
    /// Apply a fuse byte (`FUSE_LOW`/`FUSE_HIGH`/`FUSE_EXT`).
    fn set_fuse(&mut self, mcu: &mut Mcu, fuse: usize, val: u8);
    /// Apply the lock byte.
    fn set_lock(&mut self, mcu: &mut Mcu, val: u8);
    /// Model-specific per-tick hook (USART, SPM completion, ...).
    fn tick(&mut self, mcu: &mut Mcu);
    /// Finish a self-programming operation: clear SPMEN and raise
    /// SPM_RDY when enabled.
    fn reset_spm(&mut self, mcu: &mut Mcu);
}

/// Parts known to the simulator, as (config name, part name) pairs.
pub const PARTS: [(&str, &str); 5] = [
    ("m8", "ATmega8"),
    ("m8a", "ATmega8A"),
    ("m328", "ATmega328"),
    ("m328p", "ATmega328P"),
    ("m2560", "ATmega2560"),
];

/// Create an MCU and its behaviour hooks from a part name.
pub fn init(name: &str) -> Option<(Mcu, Box<dyn Model>)> {
    match name {
        "m8" | "m8a" => Some(m8a::init(name)),
        "m328" | "m328p" => Some(m328p::init(name)),
        "m2560" => Some(m2560::init()),
        _ => None,
    }
}

/// Geometry shared by the model constructors.
pub(super) struct Geometry {
    pub pc_bits: u8,
    pub freq: u64,
    pub freq_max: u64,
    pub flashend: u32,
    pub ramstart: u32,
    pub ramend: u32,
    pub e2end: u32,
    pub spm_pagesize: u32,
}

/// Allocate a blank MCU with its memories sized for `geo`. Registers,
/// peripherals and the interrupt layout are filled in by the caller.
pub(super) fn base_mcu(name: &'static str, signature: [u8; 3], geo: &Geometry) -> Mcu {
    let pm_words = ((geo.flashend + 1) / 2) as usize;
    let dm_len = (geo.ramend + 1) as usize;

    Mcu {
        name,
        signature,
        pc: 0,
        pc_bits: geo.pc_bits,
        freq: geo.freq,
        freq_max: geo.freq_max,
        clk_source: ClkSource::InternalRc,
        xmega: false,
        reduced_core: false,
        pm: vec![0xFFFF; pm_words],
        mpm: vec![0xFFFF; pm_words],
        pmp: vec![0xFFFF; pm_words],
        dm: vec![0; dm_len],
        regs_num: 32,
        ioregs_num: 64,
        ioregs: vec![IoReg::reserved(); dm_len],
        sfr_off: 0x20,
        flashstart: 0,
        flashend: geo.flashend,
        ramstart: geo.ramstart,
        ramend: geo.ramend,
        ramsize: geo.ramend - geo.ramstart + 1,
        e2start: 0,
        e2end: geo.e2end,
        e2size: geo.e2end + 1,
        spm_pagesize: geo.spm_pagesize,
        bls: Bootloader::default(),
        sreg: 0x5F,
        spl: 0x5D,
        sph: 0x5E,
        rampz: None,
        eind: None,
        spmcsr: None,
        fuse: [0xFF; 3],
        lockbits: 0x3F,
        writ_io: [0; 4],
        read_io: [0; 4],
        intr: Interrupts::new(0, 1, 1),
        timers: Vec::new(),
        wdt: Wdt::none(),
        usart: Usart::none(),
        ports: Vec::new(),
        state: McuState::Stopped,
        ic_left: 0,
        mci: false,
        read_from_mpm: false,
        tick: 0,
        tick_ovf: false,
    }
}

/// Install I/O register descriptors and their reset values.
pub(super) fn set_ioregs(mcu: &mut Mcu, regs: &[(u16, &'static str, u8, u8)]) {
    for &(addr, name, reset, mask) in regs {
        mcu.ioregs[addr as usize] = IoReg {
            name,
            present: true,
            reset,
            mask,
        };
        mcu.dm[addr as usize] = reset;
    }
}

use super::timer::ComAction::*;

/// Compare-output table of a 16-bit timer's A channel (the one whose
/// OCR can serve as TOP). Indexed `[WGM][COM]`.
pub(super) fn com_op_16bit_chan_a() -> [[ComAction; 4]; 16] {
    let mut t = [[Disc; 4]; 16];
    t[0] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[1] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[2] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[3] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[4] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[5] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t[6] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t[7] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t[8] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[9] = [Disc, TgOnCm, ClOnUpStOnDown, StOnUpClOnDown];
    t[10] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[11] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[12] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[14] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t[15] = [Disc, TgOnCm, ClOnCmStAtBot, StOnCmClAtBot];
    t
}

/// Compare-output table of a 16-bit timer's B (and C) channel: toggle
/// is reserved in the OCRA-topped modes.
pub(super) fn com_op_16bit_chan_b() -> [[ComAction; 4]; 16] {
    let mut t = com_op_16bit_chan_a();
    t[9] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[15] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t
}

/// Compare-output table of an 8-bit timer with the four-mode WGM set
/// (Normal, PCPWM, CTC, Fast PWM).
pub(super) fn com_op_8bit_4modes() -> [[ComAction; 4]; 16] {
    let mut t = [[Disc; 4]; 16];
    t[0] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[1] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[2] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[3] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t
}

/// Compare-output table of an 8-bit timer with the eight-mode WGM set
/// (ATmega328P-style timers 0 and 2), A channel.
pub(super) fn com_op_8bit_8modes_chan_a() -> [[ComAction; 4]; 16] {
    let mut t = [[Disc; 4]; 16];
    t[0] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[1] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[2] = [Disc, TgOnCm, ClOnCm, StOnCm];
    t[3] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t[5] = [Disc, TgOnCm, ClOnUpStOnDown, StOnUpClOnDown];
    t[7] = [Disc, TgOnCm, ClOnCmStAtBot, StOnCmClAtBot];
    t
}

/// Same, B channel: toggle is reserved.
pub(super) fn com_op_8bit_8modes_chan_b() -> [[ComAction; 4]; 16] {
    let mut t = com_op_8bit_8modes_chan_a();
    t[5] = [Disc, Disc, ClOnUpStOnDown, StOnUpClOnDown];
    t[7] = [Disc, Disc, ClOnCmStAtBot, StOnCmClAtBot];
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_parts() {
        for (partno, name) in PARTS {
            let (mcu, _) = init(partno).unwrap();
            assert_eq!(mcu.name, name);
        }
        assert!(init("m16").is_none());
    }

    #[test]
    fn test_reset_values_applied() {
        let (mcu, _) = init("m8a").unwrap();
        // UCSRA resets with UDRE set.
        assert_eq!(mcu.dm[0x2B], 0x20);
        // Stack pointer starts at RAMEND.
        assert_eq!(mcu.sp() as u32, mcu.ramend);
    }

    #[test]
    fn test_memory_geometry() {
        let (m8a, _) = init("m8a").unwrap();
        assert_eq!(m8a.pm.len(), 4096);
        assert_eq!(m8a.dm.len(), 0x460);
        assert_eq!(m8a.pc_bits, 12);

        let (m2560, _) = init("m2560").unwrap();
        assert_eq!(m2560.pm.len(), 128 * 1024);
        assert!(m2560.pc_bits > 16);
        assert!(m2560.rampz.is_some());
        assert!(m2560.eind.is_some());
    }
}
