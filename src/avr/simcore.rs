//! Simulation loop
//!
//! `Simulation` owns the MCU, its model behaviour hooks, the optional
//! VCD dump and the optional GDB server, and advances everything one
//! clock cycle at a time. The per-cycle phase order is fixed:
//! peripherals first, then the instruction step, pin mirroring, IRQ
//! promotion and IRQ dispatch. Reordering any of it changes observable
//! behaviour.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::models::{self, Model};
use super::sreg;
use super::{Mcu, McuState, SimError, FUSE_EXT, FUSE_HIGH, FUSE_LOW};
use crate::config::Config;
use crate::gdb::RspServer;
use crate::ihex::{self, IhexRecord, RECORD_DATA, RECORD_EOF};
use crate::vcd::{self, VcdDump};

/// Flash dump left behind for the next run.
pub const FLASH_FILE: &str = ".mcusim.flash";

/// How often the GDB socket is polled for a break byte while the MCU
/// is running.
const RSP_POLL_PERIOD: u64 = 1024;

/// Outcome of a single simulated cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Keep going.
    Continue,
    /// Clean shutdown was requested.
    Stopped,
}

/// One running simulation instance.
pub struct Simulation {
    pub mcu: Mcu,
    model: Box<dyn Model>,
    rsp: Option<RspServer>,
    vcd: Option<VcdDump>,
    firmware_test: bool,
}

impl Simulation {
    /// Build a simulation from a configuration: select the part, load
    /// the firmware, apply fuses and locks, set up tracing and the
    /// debugger.
    pub fn init(conf: &Config) -> Result<Self, SimError> {
        let (mut mcu, mut model) =
            models::init(&conf.mcu).ok_or_else(|| SimError::UnknownModel(conf.mcu.clone()))?;

        mcu.intr.trap_at_isr = conf.trap_at_isr;

        // The firmware image: a dump left by a previous run wins when
        // the flash is not reset.
        let firmware = if conf.reset_flash {
            conf.firmware_file.clone()
        } else if Path::new(FLASH_FILE).exists() {
            log::info!("using firmware: {}", FLASH_FILE);
            Some(FLASH_FILE.to_string())
        } else {
            log::warn!("failed to read: {}", FLASH_FILE);
            conf.firmware_file.clone()
        };
        let Some(firmware) = firmware else {
            log::error!("missing firmware in config");
            return Err(SimError::Io {
                context: "no firmware file configured".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        };
        load_flash(&mut mcu, &firmware)?;
        log::info!("firmware: {}", firmware);

        // Memory modifications before anything runs.
        if let Some(lock) = conf.mcu_lockbits {
            model.set_lock(&mut mcu, lock);
        }
        if let Some(efuse) = conf.mcu_efuse {
            model.set_fuse(&mut mcu, FUSE_EXT, efuse);
        }
        if let Some(hfuse) = conf.mcu_hfuse {
            model.set_fuse(&mut mcu, FUSE_HIGH, hfuse);
        }
        if let Some(lfuse) = conf.mcu_lfuse {
            model.set_fuse(&mut mcu, FUSE_LOW, lfuse);
        }

        if conf.mcu_freq > mcu.freq_max {
            log::warn!(
                "clock frequency {}.{:03} kHz is above maximum {}.{:03} kHz",
                conf.mcu_freq / 1000,
                conf.mcu_freq % 1000,
                mcu.freq_max / 1000,
                mcu.freq_max % 1000
            );
        } else if conf.mcu_freq > 0 {
            mcu.freq = conf.mcu_freq;
        } else {
            log::warn!("clock frequency 0 kHz cannot be selected as clock source");
        }

        // Scripted peripheral models are an external collaborator; the
        // seam exists but no runtime is linked.
        for m in &conf.tick_models {
            log::warn!("tick model is not supported in this build: {}", m);
        }

        print_config(&mcu);

        let vcd = if !conf.dump_regs.is_empty() {
            let regs = vcd::resolve_regs(&mcu, &conf.dump_regs);
            if regs.is_empty() {
                None
            } else {
                let path = conf.vcd_file.clone().unwrap_or_else(|| "dump.vcd".to_string());
                let dump = VcdDump::open(&path, &mcu, regs).map_err(|e| {
                    log::error!("can't open VCD file: '{}'", path);
                    SimError::Io {
                        context: format!("opening VCD file '{}'", path),
                        source: e,
                    }
                })?;
                Some(dump)
            }
        } else {
            None
        };

        // A firmware test runs free; anything else waits for GDB.
        let rsp = if conf.firmware_test {
            log::debug!("running in \"firmware test\" mode");
            mcu.state = McuState::Running;
            None
        } else {
            let server = RspServer::start(conf.rsp_port).map_err(|e| SimError::Io {
                context: format!("starting RSP server on port {}", conf.rsp_port),
                source: e,
            })?;
            Some(server)
        };

        Ok(Self {
            mcu,
            model,
            rsp,
            vcd,
            firmware_test: conf.firmware_test,
        })
    }

    /// Run until the simulation stops. Returns an error for failed
    /// tests, decode faults and PC escapes.
    pub fn run(&mut self) -> Result<(), SimError> {
        loop {
            match self.step_cycle()? {
                CycleOutcome::Continue => {}
                CycleOutcome::Stopped => return Ok(()),
            }
        }
    }

    /// Advance the whole simulation by one clock cycle.
    pub fn step_cycle(&mut self) -> Result<CycleOutcome, SimError> {
        let mcu = &mut self.mcu;

        // Termination points. A multi-cycle instruction always
        // finishes first.
        if mcu.ic_left == 0 && mcu.state == McuState::SimStop {
            log::debug!("simulation terminated (stopped mcu), pc=0x{:06X}", mcu.pc);
            return Ok(CycleOutcome::Stopped);
        }
        if mcu.ic_left == 0 && mcu.state == McuState::TestFail {
            log::warn!("simulation terminated (failed test)");
            return Err(SimError::TestFailure);
        }

        // A firmware test has no debugger to resume a stopped MCU: a
        // BREAK ends the run cleanly.
        if self.firmware_test && mcu.ic_left == 0 && mcu.state == McuState::Stopped {
            log::info!("firmware test stopped, pc=0x{:06X}", mcu.pc);
            return Ok(CycleOutcome::Stopped);
        }

        // Wait for debugger commands while stopped.
        if !self.firmware_test && mcu.ic_left == 0 && mcu.state == McuState::Stopped {
            if let Some(rsp) = self.rsp.as_mut() {
                if let Err(e) = rsp.handle(mcu) {
                    log::error!(
                        "handling message from GDB RSP client failed: pc=0x{:06X}",
                        mcu.pc
                    );
                    return Err(SimError::Io {
                        context: "GDB RSP client".to_string(),
                        source: e,
                    });
                }
            }
            return Ok(CycleOutcome::Continue);
        }

        let active = mcu.is_active();

        // Peripherals first: the register values they see are the ones
        // the previous instruction left behind.
        if active {
            mcu.update_timers();
            self.model.tick(mcu);
            mcu.update_wdt();
        }

        // Sample the trace before the instruction changes anything.
        if active && !mcu.tick_ovf {
            if let Some(vcd) = self.vcd.as_mut() {
                if let Err(e) = vcd.dump_frame(mcu, mcu.tick) {
                    log::warn!("VCD write failed: {}", e);
                }
            }
        }

        // The PC must point into flash before a fetch.
        if mcu.pc * 2 > mcu.flashend {
            log::error!(
                "program counter is out of flash memory: pc=0x{:06X}, flashend=0x{:06X}",
                mcu.pc,
                mcu.flashend >> 1
            );
            return Err(SimError::PcOutOfRange {
                pc: mcu.pc,
                flashend: mcu.flashend,
            });
        }

        // Decode. Cycles of a multi-cycle instruction complete even if
        // the MCU was stopped mid-instruction.
        if mcu.ic_left > 0 || active {
            mcu.step()?;
            mcu.io_sync_pinx();
        }

        // Promote peripheral flags into IRQ latches, then serve the
        // highest-priority one under the usual interlocks.
        pass_irqs(mcu);
        if mcu.sreg_flag(sreg::GLOBINT) == 1
            && mcu.ic_left == 0
            && !mcu.intr.exec_main
            && mcu.is_active()
        {
            handle_irq(mcu);
        }

        // The RETI main-program guarantee holds for one instruction.
        if mcu.ic_left == 0 {
            mcu.intr.exec_main = false;
        }

        if active {
            if mcu.tick < u64::MAX {
                mcu.tick += 1;
            } else if !mcu.tick_ovf {
                mcu.tick_ovf = true;
                log::warn!("maximum cycles logged!");
            }
        }

        // A single step ends back in the stopped state.
        if mcu.ic_left == 0 && mcu.state == McuState::Step {
            mcu.state = McuState::Stopped;
        }

        // A running MCU still honors ^C from GDB within bounded time.
        if mcu.state == McuState::Running && mcu.tick % RSP_POLL_PERIOD == 0 {
            if let Some(rsp) = self.rsp.as_mut() {
                rsp.poll_running(mcu);
            }
        }

        Ok(CycleOutcome::Continue)
    }

    /// Flush the trace and dump the flash for the next run.
    pub fn shutdown(&mut self) {
        if let Some(vcd) = self.vcd.as_mut() {
            let _ = vcd.flush();
        }
        if let Err(e) = save_flash(&self.mcu, FLASH_FILE) {
            log::error!("failed to dump flash memory: {}", e);
        }
    }
}

/// Promote raised-and-enabled peripheral flags into the pending IRQ
/// latches, clearing the hardware flags on the way.
pub fn pass_irqs(mcu: &mut Mcu) {
    let mut timers = std::mem::take(&mut mcu.timers);
    for tmr in timers.iter_mut() {
        if tmr.tcnt[0].is_none() {
            break;
        }

        let vectors = [tmr.iv_ovf, tmr.iv_ic];
        for iv in vectors.iter() {
            if iv.is_none() {
                continue;
            }
            if mcu.iobit_rd(&iv.enable) == 1 && mcu.iobit_rd(&iv.raised) == 1 {
                mcu.intr.request(iv.vector);
                mcu.iobit_wr(&iv.raised, 0);
            }
        }

        for comp in tmr.comp.iter() {
            if comp.iv.is_none() {
                continue;
            }
            if mcu.iobit_rd(&comp.iv.enable) == 1 && mcu.iobit_rd(&comp.iv.raised) == 1 {
                mcu.intr.request(comp.iv.vector);
                mcu.iobit_wr(&comp.iv.raised, 0);
            }
        }
    }
    mcu.timers = timers;

    // Watchdog timeout interrupt, on parts that wire one.
    let iv = mcu.wdt.iv_tout;
    if !iv.is_none() && mcu.iobit_rd(&iv.enable) == 1 && mcu.iobit_rd(&iv.raised) == 1 {
        mcu.intr.request(iv.vector);
        mcu.iobit_wr(&iv.raised, 0);
    }
}

/// Serve the highest-priority pending IRQ: push the PC, jump through
/// the vector table, mask further interrupts.
pub fn handle_irq(mcu: &mut Mcu) {
    let Some(i) = mcu.intr.winner() else {
        return;
    };
    mcu.intr.irq[i] = 0;

    // The XMEGA cores keep the I flag and arbitrate by level instead.
    if !mcu.xmega {
        mcu.sreg_update(sreg::GLOBINT, 0);
    }

    let pc = mcu.pc;
    mcu.stack_push(pc as u8);
    mcu.stack_push((pc >> 8) as u8);
    if mcu.pc_bits > 16 {
        mcu.stack_push((pc >> 16) as u8);
    }

    mcu.pc = mcu.intr.ivt + i as u32 * mcu.intr.ivt_stride;

    if mcu.intr.trap_at_isr && mcu.state == McuState::Running {
        mcu.state = McuState::Step;
    }
}

/// Populate flash from an Intel HEX image, then verify every record's
/// checksum against what landed in memory.
pub fn load_flash<P: AsRef<Path>>(mcu: &mut Mcu, path: P) -> Result<(), SimError> {
    let file = File::open(path.as_ref()).map_err(|e| SimError::Io {
        context: format!("can't load progmem from: '{}'", path.as_ref().display()),
        source: e,
    })?;
    let records = ihex::read_records(BufReader::new(file))?;

    for rec in &records {
        if rec.rtype != RECORD_DATA {
            continue;
        }
        let base = (rec.address >> 1) as u32;
        for (j, pair) in rec.data.chunks(2).enumerate() {
            let lo = pair[0] as u16;
            let hi = pair.get(1).copied().unwrap_or(0) as u16;
            mcu.pm_write(base + j as u32, (hi << 8) | lo);
        }
    }

    // Read the image back out of flash and re-checksum each record.
    for rec in &records {
        if rec.rtype != RECORD_DATA {
            continue;
        }
        let mut data = Vec::with_capacity(rec.data.len());
        for i in 0..rec.data.len() as u32 {
            data.push(mcu.pm_read_byte(rec.address as u32 + i));
        }
        let mem_rec = IhexRecord::new(rec.rtype, rec.address, &data);
        if mem_rec.checksum != rec.checksum {
            log::error!(
                "incorrect IHEX checksum: 0x{:X} (mem) != 0x{:X} (file)",
                mem_rec.checksum,
                rec.checksum
            );
            log::error!("file record: {}", rec);
            log::error!("memory record: {}", mem_rec);
            return Err(SimError::Firmware(crate::ihex::IhexError::Checksum {
                line: 0,
                computed: mem_rec.checksum,
                found: rec.checksum,
            }));
        }
    }

    Ok(())
}

/// Dump the flash contents as an Intel HEX image that `load_flash` can
/// read back on the next run.
pub fn save_flash<P: AsRef<Path>>(mcu: &Mcu, path: P) -> Result<(), SimError> {
    let file = File::create(path.as_ref()).map_err(|e| SimError::Io {
        context: format!(
            "failed to open {} to dump flash memory to",
            path.as_ref().display()
        ),
        source: e,
    })?;
    let mut out = BufWriter::new(file);

    let mut records = Vec::new();
    let mut chunk = [0u8; 16];
    let mut off: u16 = 0;
    for words in mcu.pm.chunks(8) {
        for (j, w) in words.iter().enumerate() {
            chunk[j * 2] = *w as u8;
            chunk[j * 2 + 1] = (*w >> 8) as u8;
        }
        records.push(IhexRecord::new(RECORD_DATA, off, &chunk[..words.len() * 2]));
        off = off.wrapping_add(16);
    }
    records.push(IhexRecord::new(RECORD_EOF, 0, &[]));

    ihex::write_records(&mut out, &records).map_err(|e| SimError::Io {
        context: "writing flash dump".to_string(),
        source: e,
    })
}

fn print_config(mcu: &Mcu) {
    // Program memory addresses are reported in words: AVR opcodes are
    // 16 or 32 bits wide and that is how vectors are counted.
    log::info!(
        "model: {} ({:02X}{:02X}{:02X})",
        mcu.name,
        mcu.signature[0],
        mcu.signature[1],
        mcu.signature[2]
    );
    log::info!("clock: {}.{:03} kHz", mcu.freq / 1000, mcu.freq % 1000);
    log::info!(
        "fuses: EXT=0x{:02X}, HIGH=0x{:02X}, LOW=0x{:02X}",
        mcu.fuse[2],
        mcu.fuse[1],
        mcu.fuse[0]
    );
    log::info!("lock: 0x{:02X}", mcu.lockbits);
    log::info!("reset vector: 0x{:06X}", mcu.intr.reset_pc);
    log::info!("interrupt vectors: 0x{:06X}", mcu.intr.ivt);
    log::info!(
        "flash: 0x{:06X}-0x{:06X}",
        mcu.flashstart >> 1,
        mcu.flashend >> 1
    );
    log::info!(
        "bootloader: 0x{:06X}-0x{:06X}",
        mcu.bls.start >> 1,
        mcu.bls.end >> 1
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avr::models;
    use std::io::Write;

    #[test]
    fn test_load_flash_roundtrip() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.hex");

        // LDI R26, 0xA0; RJMP .
        let mut f = File::create(&path).unwrap();
        writeln!(f, ":04000000A0EAFFCFA4").unwrap();
        writeln!(f, ":00000001FF").unwrap();
        drop(f);

        load_flash(&mut mcu, &path).unwrap();
        assert_eq!(mcu.pm[0], 0xEAA0);
        assert_eq!(mcu.pm[1], 0xCFFF);
    }

    #[test]
    fn test_save_flash_roundtrip() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        mcu.pm[0] = 0x1234;
        mcu.pm[1] = 0xABCD;
        mcu.pm[100] = 0x5555;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.hex");
        save_flash(&mcu, &path).unwrap();

        let (mut back, _) = models::init("m8a").unwrap();
        load_flash(&mut back, &path).unwrap();
        assert_eq!(back.pm, mcu.pm);
    }

    #[test]
    fn test_pass_irqs_promotes_and_clears() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        const TIFR: usize = 0x58;
        const TIMSK: usize = 0x59;

        // TOV0 raised but masked: nothing happens.
        mcu.dm[TIFR] = 0x01;
        pass_irqs(&mut mcu);
        assert_eq!(mcu.intr.irq[8], 0);
        assert_eq!(mcu.dm[TIFR] & 1, 1);

        // Unmask: the flag moves into the latch.
        mcu.dm[TIMSK] = 0x01;
        pass_irqs(&mut mcu);
        assert_eq!(mcu.intr.irq[8], 1);
        assert_eq!(mcu.dm[TIFR] & 1, 0);
    }

    #[test]
    fn test_handle_irq_dispatch() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        mcu.state = McuState::Running;
        mcu.pc = 0x0123;
        mcu.sreg_update(crate::avr::sreg::GLOBINT, 1);
        mcu.intr.request(8); // TIMER0_OVF

        let sp_before = mcu.sp();
        handle_irq(&mut mcu);

        // Vector 8 on a single-word table sits at word 9.
        assert_eq!(mcu.pc, 9);
        assert_eq!(mcu.sreg_flag(crate::avr::sreg::GLOBINT), 0);
        assert_eq!(mcu.sp(), sp_before - 2);
        // Return address on the stack: high byte pushed last.
        assert_eq!(mcu.dm[mcu.sp() as usize + 1], 0x01);
        assert_eq!(mcu.dm[mcu.sp() as usize + 2], 0x23);
    }

    #[test]
    fn test_trap_at_isr() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        mcu.state = McuState::Running;
        mcu.intr.trap_at_isr = true;
        mcu.intr.request(0);

        handle_irq(&mut mcu);
        assert_eq!(mcu.state, McuState::Step);
    }
}
