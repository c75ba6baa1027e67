//! Watchdog timer
//!
//! The watchdog runs from its own oscillator; the engine scales its
//! prescaler table into system clock ticks. `WDR` (and a stopped MCU)
//! resets the sub-counter. On expiry the timeout interrupt is raised
//! when the part wires one, otherwise the MCU is reset through the
//! regular reset vector.

use super::interrupt::IntVec;
use super::io::IoBit;
use super::Mcu;

/// Watchdog state of one MCU.
#[derive(Debug, Clone)]
pub struct Wdt {
    /// WDTON fuse bit: (fuse byte index, bit). A programmed (zero) bit
    /// forces the watchdog on.
    pub wdton: Option<(usize, u8)>,
    /// System reset enable bit (WDTCR.WDE).
    pub wde: IoBit,
    /// Timeout interrupt enable bit, on parts that have one.
    pub wdie: IoBit,
    /// Change enable bit (WDTCR.WDCE).
    pub ce: IoBit,

    /// Watchdog oscillator frequency, in Hz.
    pub oscf: u32,
    /// System clock sub-counter.
    pub scnt: u64,

    /// Prescaler select bits.
    pub wdp: [IoBit; 4],
    /// Prescaler select to timeout map, in thousands of watchdog
    /// oscillator cycles.
    pub wdp_op: [u32; 16],

    /// Timeout interrupt.
    pub iv_tout: IntVec,
    /// System reset "vector".
    pub iv_sysr: IntVec,
}

impl Wdt {
    /// A part without a configured watchdog.
    pub fn none() -> Self {
        Self {
            wdton: None,
            wde: IoBit::none(),
            wdie: IoBit::none(),
            ce: IoBit::none(),
            oscf: 1_000_000,
            scnt: 0,
            wdp: [IoBit::none(); 4],
            wdp_op: [0; 16],
            iv_tout: IntVec::none(),
            iv_sysr: IntVec::none(),
        }
    }
}

impl Mcu {
    /// Advance the watchdog by one system clock.
    pub fn update_wdt(&mut self) {
        let mut wdt = std::mem::replace(&mut self.wdt, Wdt::none());
        wdt.update(self);
        self.wdt = wdt;
    }
}

impl Wdt {
    fn enabled(&self, mcu: &Mcu) -> bool {
        if self.wde.is_none() {
            return false;
        }
        if let Some((byte, bit)) = self.wdton {
            // Programmed fuse bits read as zero.
            if (mcu.fuse[byte] >> bit) & 1 == 0 {
                return true;
            }
        }
        mcu.iobit_rd(&self.wde) != 0
    }

    fn update(&mut self, mcu: &mut Mcu) {
        if !self.enabled(mcu) {
            self.scnt = 0;
            return;
        }

        let wdp = mcu.iobit_rda(&self.wdp) as usize;
        let kcycles = self.wdp_op[wdp];
        if kcycles == 0 {
            self.scnt = 0;
            return;
        }

        // Timeout in system clocks: watchdog cycles scaled by the
        // clock ratio.
        let timeout = (kcycles as u64 * 1024).saturating_mul(mcu.freq) / self.oscf as u64;
        self.scnt += 1;
        if self.scnt < timeout {
            return;
        }
        self.scnt = 0;

        if !self.iv_tout.is_none() && mcu.iobit_rd(&self.iv_tout.enable) != 0 {
            let raised = self.iv_tout.raised;
            mcu.iobit_wr(&raised, 1);
        } else {
            log::warn!("watchdog timeout, resetting: pc=0x{:06X}", mcu.pc);
            mcu.pc = mcu.intr.reset_pc;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::avr::models;

    const WDTCR: u32 = 0x41;
    const WDE: u8 = 3;

    #[test]
    fn test_disarmed_watchdog_is_silent() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        for _ in 0..100_000 {
            mcu.update_wdt();
        }
        assert_eq!(mcu.pc, 0);
        assert_eq!(mcu.wdt.scnt, 0);
    }

    #[test]
    fn test_timeout_resets() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        mcu.pc = 0x100;
        // WDE set, shortest prescale (16K cycles at 1 MHz each).
        mcu.write_ds(WDTCR, 1 << WDE);

        let timeout = 16 * 1024 * (mcu.freq as u64) / 1_000_000;
        for _ in 0..timeout {
            mcu.update_wdt();
        }
        assert_eq!(mcu.pc, mcu.intr.reset_pc);
    }

    #[test]
    fn test_wdr_restarts_the_count() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        mcu.write_ds(WDTCR, 1 << WDE);

        for _ in 0..1000 {
            mcu.update_wdt();
        }
        assert!(mcu.wdt.scnt > 0);

        // WDR
        mcu.pm[0] = 0x95A8;
        mcu.state = crate::avr::McuState::Running;
        mcu.step().unwrap();
        assert_eq!(mcu.wdt.scnt, 0);
    }
}
