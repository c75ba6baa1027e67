//! AVR microcontroller state and core machinery
//!
//! The `Mcu` struct is the single owner of everything the firmware can
//! observe: program memory, data memory (registers, I/O registers and
//! SRAM in one byte-addressed array), the shadow flash used by the
//! debugger, the peripheral state machines and the interrupt latches.
//! Subsystems never keep pointers into it; special registers such as
//! SREG or SPL are stored as data-memory offsets and dereferenced on
//! access.
//!
//! # Module organization
//!
//! - `sreg`: status register flag indices and accessors
//! - `io`: I/O bit descriptors, masked writes, port pin mirroring
//! - `interrupt`: pending-IRQ table and vector descriptors
//! - `decoder`: opcode recognition and dispatch
//! - `execute`: per-mnemonic executors
//! - `timer`, `wdt`, `usart`: peripheral engines
//! - `models`: per-part descriptors (ATmega8A, ATmega328/P, ATmega2560)
//! - `simcore`: the simulation loop

pub mod decoder;
mod execute;
pub mod interrupt;
pub mod io;
pub mod models;
pub mod simcore;
pub mod sreg;
pub mod timer;
pub mod usart;
pub mod wdt;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use interrupt::{IntVec, Interrupts};
pub use io::{IoBit, IoPort, IoReg};
pub use timer::Timer;
pub use usart::Usart;
pub use wdt::Wdt;

/// Low byte of the X index register (R26).
pub const REG_XL: usize = 26;
/// High byte of the X index register (R27).
pub const REG_XH: usize = 27;
/// Low byte of the Y index register (R28).
pub const REG_YL: usize = 28;
/// High byte of the Y index register (R29).
pub const REG_YH: usize = 29;
/// Low byte of the Z index register (R30).
pub const REG_ZL: usize = 30;
/// High byte of the Z index register (R31).
pub const REG_ZH: usize = 31;

/// Indices of the fuse bytes in `Mcu::fuse`.
pub const FUSE_LOW: usize = 0;
pub const FUSE_HIGH: usize = 1;
pub const FUSE_EXT: usize = 2;

/// Simulation-visible state of the MCU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuState {
    /// Executing instructions freely.
    Running,
    /// Halted, waiting for a debugger command.
    Stopped,
    /// Sleeping (clock gated by a SLEEP instruction).
    Sleeping,
    /// Executing exactly one instruction, then back to `Stopped`.
    Step,
    /// Simulation shutdown requested (debugger kill, clean exit).
    SimStop,
    /// A firmware test or an illegal instruction failed the run.
    TestFail,
}

/// Clock source selected by the fuse bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClkSource {
    External,
    InternalRc,
    ExternalRc,
    LowFreqCrystal,
    Crystal,
}

/// Bootloader section geometry, in flash byte addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bootloader {
    pub start: u32,
    pub end: u32,
    pub size: u32,
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("unknown instruction: 0x{opcode:04X}, pc=0x{pc:06X}")]
    UnknownInstruction { opcode: u16, pc: u32 },
    #[error("program counter is out of flash memory: pc=0x{pc:06X}, flashend=0x{flashend:06X}")]
    PcOutOfRange { pc: u32, flashend: u32 },
    #[error("MCU model is not supported: {0}")]
    UnknownModel(String),
    #[error("simulation terminated by a failed test")]
    TestFailure,
    #[error("firmware image error: {0}")]
    Firmware(#[from] crate::ihex::IhexError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },
}

/// One AVR microcontroller instance.
///
/// Created by `models::init` from a part name, mutated by every tick of
/// the simulation loop, torn down at shutdown.
pub struct Mcu {
    /// Human-readable part name ("ATmega8A", ...).
    pub name: &'static str,
    /// Device signature bytes.
    pub signature: [u8; 3],
    /// Program counter, in 16-bit word units.
    pub pc: u32,
    /// Width of the program counter (12, 14, 16 or 17 bits).
    pub pc_bits: u8,
    /// Clock frequency, in Hz.
    pub freq: u64,
    /// Maximum clock frequency of the part, in Hz.
    pub freq_max: u64,
    /// Clock source selected by the fuses.
    pub clk_source: ClkSource,
    /// AVR XMEGA core (shorter call/return timing, no I-flag clear on IRQ).
    pub xmega: bool,
    /// Reduced (AVRrc) core.
    pub reduced_core: bool,

    /// Program memory: 16-bit little-endian words.
    pub pm: Vec<u16>,
    /// Match-points memory: shadow of `pm` holding opcodes displaced by
    /// software breakpoints.
    pub mpm: Vec<u16>,
    /// SPM temporary page buffer.
    pub pmp: Vec<u16>,
    /// Data memory: GP registers, I/O registers, SRAM.
    pub dm: Vec<u8>,

    /// Number of general purpose registers (32).
    pub regs_num: u16,
    /// Number of I/O registers.
    pub ioregs_num: u16,
    /// I/O register descriptors, indexed by data-memory address.
    pub ioregs: Vec<IoReg>,
    /// Offset of the I/O region inside data memory (0x20).
    pub sfr_off: u16,

    /// First flash byte address.
    pub flashstart: u32,
    /// Last flash byte address.
    pub flashend: u32,
    /// First SRAM data address.
    pub ramstart: u32,
    /// Last SRAM data address.
    pub ramend: u32,
    /// SRAM size, in bytes.
    pub ramsize: u32,
    /// EEPROM geometry (stubbed, no storage behind it).
    pub e2start: u32,
    pub e2end: u32,
    pub e2size: u32,
    /// SPM page size, in bytes.
    pub spm_pagesize: u32,
    /// Bootloader section.
    pub bls: Bootloader,

    /// Data-memory offset of SREG.
    pub sreg: u16,
    /// Data-memory offset of SPL.
    pub spl: u16,
    /// Data-memory offset of SPH.
    pub sph: u16,
    /// Data-memory offset of RAMPZ, on parts that have it.
    pub rampz: Option<u16>,
    /// Data-memory offset of EIND, on parts that have it.
    pub eind: Option<u16>,
    /// Data-memory offset of SPMCSR/SPMCR, on parts that have it.
    pub spmcsr: Option<u16>,

    /// Fuse bytes: low, high, extended.
    pub fuse: [u8; 3],
    /// Lock bits.
    pub lockbits: u8,

    /// I/O addresses written by the current instruction.
    pub writ_io: [u32; 4],
    /// I/O addresses read by the current instruction.
    pub read_io: [u32; 4],

    /// Interrupt state.
    pub intr: Interrupts,
    /// Timer/counter units.
    pub timers: Vec<Timer>,
    /// Watchdog timer.
    pub wdt: Wdt,
    /// USART.
    pub usart: Usart,
    /// PORTx/DDRx/PINx triples.
    pub ports: Vec<IoPort>,

    /// Current simulation state.
    pub state: McuState,
    /// Cycles left in the currently executing multi-cycle instruction.
    pub ic_left: u32,
    /// Inside a multi-cycle instruction.
    pub mci: bool,
    /// Fetch the next opcode from the shadow flash (set by BREAK).
    pub read_from_mpm: bool,
    /// Cycle counter, in clock cycles.
    pub tick: u64,
    /// The cycle counter saturated.
    pub tick_ovf: bool,
}

impl Mcu {
    // ========== Program memory ==========

    /// Read a program-memory word. Reads beyond the end of flash return
    /// the erased-cell value.
    #[inline]
    pub fn pm_read(&self, word_addr: u32) -> u16 {
        self.pm.get(word_addr as usize).copied().unwrap_or(0xFFFF)
    }

    /// Write a program-memory word.
    #[inline]
    pub fn pm_write(&mut self, word_addr: u32, val: u16) {
        if let Some(w) = self.pm.get_mut(word_addr as usize) {
            *w = val;
        }
    }

    /// Read a shadow-flash word.
    #[inline]
    pub fn mpm_read(&self, word_addr: u32) -> u16 {
        self.mpm.get(word_addr as usize).copied().unwrap_or(0xFFFF)
    }

    /// Read a single flash byte. Words are little-endian.
    pub fn pm_read_byte(&self, byte_addr: u32) -> u8 {
        let w = self.pm_read(byte_addr >> 1);
        if byte_addr & 1 == 0 {
            w as u8
        } else {
            (w >> 8) as u8
        }
    }

    /// Write a single flash byte.
    pub fn pm_write_byte(&mut self, byte_addr: u32, val: u8) {
        let w = self.pm_read(byte_addr >> 1);
        let w = if byte_addr & 1 == 0 {
            (w & 0xFF00) | val as u16
        } else {
            (w & 0x00FF) | ((val as u16) << 8)
        };
        self.pm_write(byte_addr >> 1, w);
    }

    /// Read a single shadow-flash byte.
    pub fn mpm_read_byte(&self, byte_addr: u32) -> u8 {
        let w = self.mpm_read(byte_addr >> 1);
        if byte_addr & 1 == 0 {
            w as u8
        } else {
            (w >> 8) as u8
        }
    }

    /// Write a single shadow-flash byte.
    pub fn mpm_write_byte(&mut self, byte_addr: u32, val: u8) {
        let i = (byte_addr >> 1) as usize;
        if let Some(w) = self.mpm.get_mut(i) {
            *w = if byte_addr & 1 == 0 {
                (*w & 0xFF00) | val as u16
            } else {
                (*w & 0x00FF) | ((val as u16) << 8)
            };
        }
    }

    // ========== Data memory ==========

    /// True if `addr` falls inside the I/O register region.
    #[inline]
    pub fn is_io(&self, addr: u32) -> bool {
        addr >= self.regs_num as u32 && addr < (self.regs_num + self.ioregs_num) as u32
    }

    /// Read a data-memory byte and note the address in the read-I/O
    /// watch list. Reads are never filtered.
    pub fn dm_read(&mut self, addr: u32) -> u8 {
        self.note_read(addr);
        self.dm[addr as usize]
    }

    /// Write a data-memory byte. Writes into the I/O region are
    /// filtered through the register's access mask and noted in the
    /// written-I/O watch list; everything else is stored verbatim.
    pub fn write_ds(&mut self, addr: u32, val: u8) {
        if self.is_io(addr) {
            let reg = &self.ioregs[addr as usize];
            if !reg.present {
                log::debug!("write to reserved I/O address 0x{:02X}", addr);
            }
            let cur = self.dm[addr as usize];
            self.dm[addr as usize] = (cur & !reg.mask) | (val & reg.mask);
            self.note_write(addr);
        } else {
            self.dm[addr as usize] = val;
        }
    }

    pub(super) fn note_write(&mut self, addr: u32) {
        for slot in self.writ_io.iter_mut() {
            if *slot == 0 || *slot == addr {
                *slot = addr;
                return;
            }
        }
    }

    pub(super) fn note_read(&mut self, addr: u32) {
        for slot in self.read_io.iter_mut() {
            if *slot == 0 || *slot == addr {
                *slot = addr;
                return;
            }
        }
    }

    /// Was this I/O address written by the current instruction?
    pub fn io_written(&self, addr: u32) -> bool {
        self.writ_io.contains(&addr)
    }

    /// Was this I/O address read by the current instruction?
    pub fn io_read(&self, addr: u32) -> bool {
        self.read_io.contains(&addr)
    }

    // ========== Stack ==========

    /// Push a byte onto the stack: store at SP, then decrement.
    pub fn stack_push(&mut self, val: u8) {
        let sp = (self.dm[self.spl as usize] as u32) | ((self.dm[self.sph as usize] as u32) << 8);
        self.dm[sp as usize] = val;
        let sp = sp.wrapping_sub(1);
        self.dm[self.spl as usize] = sp as u8;
        self.dm[self.sph as usize] = (sp >> 8) as u8;
    }

    /// Pop a byte from the stack: increment SP, then load.
    pub fn stack_pop(&mut self) -> u8 {
        let sp = (self.dm[self.spl as usize] as u32) | ((self.dm[self.sph as usize] as u32) << 8);
        let sp = sp.wrapping_add(1);
        let val = self.dm[sp as usize];
        self.dm[self.spl as usize] = sp as u8;
        self.dm[self.sph as usize] = (sp >> 8) as u8;
        val
    }

    /// Current stack pointer value.
    pub fn sp(&self) -> u16 {
        (self.dm[self.spl as usize] as u16) | ((self.dm[self.sph as usize] as u16) << 8)
    }

    // ========== Multi-cycle accounting ==========

    /// Cycle bookkeeping shared by every multi-cycle executor.
    ///
    /// Returns `true` while the instruction is still burning cycles; the
    /// executor must return immediately without touching any state.
    /// `cycles` is the cycle count of the instruction minus one. On the
    /// final call the flag is cleared and the executor performs its
    /// effect.
    pub fn skip_cycles(&mut self, cond: bool, cycles: u32) -> bool {
        if !self.mci && cond {
            self.mci = true;
            self.ic_left = cycles;
            return true;
        }
        if self.mci && self.ic_left > 0 {
            self.ic_left -= 1;
            if self.ic_left > 0 {
                return true;
            }
        }
        self.mci = false;
        false
    }

    /// MCU is executing instructions ("active" in the loop's sense).
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self.state, McuState::Running | McuState::Step)
    }
}
