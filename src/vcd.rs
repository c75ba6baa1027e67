//! Value-change-dump register tracer
//!
//! Writes an IEEE 1364 VCD file with one variable per traced register
//! (or register bit). The timescale is half the MCU clock period, so
//! one simulated cycle spans two VCD time units and the companion
//! CLK_IO wave can show both edges.
//!
//! Traced names come straight from the configuration: a plain register
//! name (`PORTB`), a register bit (`PORTB3`), or the name of a 16-bit
//! pair without its `H`/`L` suffix (`OCR1A`).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::avr::Mcu;

/// Clock pulses printed after the last register change.
const MAX_CLK_PRINTS: u32 = 50;

/// One traced variable.
#[derive(Debug, Clone)]
pub struct VcdReg {
    /// Data-memory address (the high byte for 16-bit pairs).
    pub addr: u16,
    /// Low-byte address of a 16-bit pair.
    pub low_addr: Option<u16>,
    /// Traced bit, `None` for the whole register.
    pub bit: Option<u8>,
    /// Variable name in the VCD file.
    pub name: String,
    /// Last sampled value.
    old: u16,
}

/// Resolve configured `dump_reg` names against the MCU's register
/// table. Unknown names are reported and skipped.
pub fn resolve_regs(mcu: &Mcu, names: &[String]) -> Vec<VcdReg> {
    let mut out = Vec::new();

    'names: for want in names {
        let mut high: Option<(u16, &str)> = None;
        let mut low: Option<u16> = None;

        for (addr, reg) in mcu.ioregs.iter().enumerate() {
            if reg.name.is_empty() {
                continue;
            }

            if reg.name == want.as_str() {
                out.push(VcdReg {
                    addr: addr as u16,
                    low_addr: None,
                    bit: None,
                    name: want.clone(),
                    old: 0,
                });
                continue 'names;
            }

            // A trailing decimal digit selects one bit.
            if let Some(rest) = want.strip_prefix(reg.name) {
                if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                    if let Ok(bit) = rest.parse::<u8>() {
                        if bit < 8 {
                            out.push(VcdReg {
                                addr: addr as u16,
                                low_addr: None,
                                bit: Some(bit),
                                name: format!("{}{}", reg.name, bit),
                                old: 0,
                            });
                            continue 'names;
                        }
                    }
                }
            }

            // A 16-bit register is configured by its bare name and
            // matches the H/L byte pair.
            if reg.name.len() == want.len() + 1 && reg.name.starts_with(want.as_str()) {
                match reg.name.as_bytes()[want.len()] {
                    b'H' => high = Some((addr as u16, reg.name)),
                    b'L' => low = Some(addr as u16),
                    _ => {}
                }
                if let (Some((h, _)), Some(l)) = (high, low) {
                    out.push(VcdReg {
                        addr: h,
                        low_addr: Some(l),
                        bit: None,
                        name: want.clone(),
                        old: 0,
                    });
                    continue 'names;
                }
            }
        }

        log::warn!("unknown register to dump: {}", want);
    }

    out
}

/// An open VCD dump.
pub struct VcdDump {
    out: BufWriter<File>,
    regs: Vec<VcdReg>,
    clk_prints_left: u32,
}

impl VcdDump {
    /// Create the dump file and write the header, declarations and
    /// initial values.
    pub fn open<P: AsRef<Path>>(path: P, mcu: &Mcu, regs: Vec<VcdReg>) -> io::Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        let date = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%z");
        // Half the clock period, in picoseconds.
        let timescale = (1.0 / mcu.freq as f64 * 1e12 / 2.0).round() as u64;

        writeln!(out, "$date {} $end", date)?;
        writeln!(out, "$version mcusim {} $end", env!("CARGO_PKG_VERSION"))?;
        writeln!(out, "$comment It is a dump of simulated {} $end", mcu.name)?;
        writeln!(out, "$timescale {} ps $end", timescale)?;
        writeln!(out, "$scope module {} $end", mcu.name)?;

        writeln!(out, "$var reg 1 CLK_IO CLK_IO $end")?;
        for reg in &regs {
            let width = match (reg.low_addr, reg.bit) {
                (Some(_), _) => 16,
                (None, Some(_)) => 1,
                (None, None) => 8,
            };
            writeln!(out, "$var reg {} {} {} $end", width, reg.name, reg.name)?;
        }
        writeln!(out, "$upscope $end")?;
        writeln!(out, "$enddefinitions $end")?;

        // Initial values.
        writeln!(out, "$dumpvars")?;
        writeln!(out, "b0 CLK_IO")?;
        let mut dump = Self {
            out,
            regs,
            clk_prints_left: 0,
        };
        for i in 0..dump.regs.len() {
            let v = dump.sample(mcu, i);
            dump.regs[i].old = v;
            dump.write_value(i, v)?;
        }
        writeln!(dump.out, "$end")?;

        Ok(dump)
    }

    fn sample(&self, mcu: &Mcu, i: usize) -> u16 {
        let reg = &self.regs[i];
        let mut v = mcu.dm[reg.addr as usize] as u16;
        if let Some(low) = reg.low_addr {
            v = (v << 8) | mcu.dm[low as usize] as u16;
        }
        if let Some(bit) = reg.bit {
            v = (v >> bit) & 1;
        }
        v
    }

    fn write_value(&mut self, i: usize, v: u16) -> io::Result<()> {
        let reg = &self.regs[i];
        match (reg.low_addr, reg.bit) {
            (Some(_), _) => writeln!(self.out, "b{:016b} {}", v, reg.name),
            (None, Some(_)) => writeln!(self.out, "b{} {}", v & 1, reg.name),
            (None, None) => writeln!(self.out, "b{:08b} {}", v as u8, reg.name),
        }
    }

    /// Sample every traced register at cycle `tick` and write the
    /// changes. The clock wave keeps toggling for a while after the
    /// last change so pulse trains stay readable.
    pub fn dump_frame(&mut self, mcu: &Mcu, tick: u64) -> io::Result<()> {
        let mut changed = Vec::new();
        for i in 0..self.regs.len() {
            let v = self.sample(mcu, i);
            if v != self.regs[i].old {
                changed.push((i, v));
            }
        }

        if changed.is_empty() {
            if self.clk_prints_left == 0 {
                return Ok(());
            }
            self.clk_prints_left -= 1;
            writeln!(self.out, "#{}", tick * 2)?;
            writeln!(self.out, "b1 CLK_IO")?;
            writeln!(self.out, "#{}", tick * 2 + 1)?;
            writeln!(self.out, "b0 CLK_IO")?;
            return Ok(());
        }

        self.clk_prints_left = MAX_CLK_PRINTS;
        writeln!(self.out, "#{}", tick * 2)?;
        writeln!(self.out, "b1 CLK_IO")?;
        for (i, v) in changed {
            self.regs[i].old = v;
            self.write_value(i, v)?;
        }
        writeln!(self.out, "#{}", tick * 2 + 1)?;
        writeln!(self.out, "b0 CLK_IO")?;
        Ok(())
    }

    /// Flush buffered output.
    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avr::models;
    use std::fs;

    const PORTB: usize = 0x38;

    #[test]
    fn test_resolve_plain_bit_and_pair() {
        let (mcu, _) = models::init("m8a").unwrap();
        let names = vec![
            "PORTB".to_string(),
            "PORTD3".to_string(),
            "OCR1A".to_string(),
            "NOSUCH".to_string(),
        ];
        let regs = resolve_regs(&mcu, &names);
        assert_eq!(regs.len(), 3);

        assert_eq!(regs[0].addr, 0x38);
        assert_eq!(regs[0].bit, None);
        assert_eq!(regs[0].low_addr, None);

        assert_eq!(regs[1].addr, 0x32);
        assert_eq!(regs[1].bit, Some(3));

        assert_eq!(regs[2].addr, 0x4B); // OCR1AH
        assert_eq!(regs[2].low_addr, Some(0x4A)); // OCR1AL
        assert_eq!(regs[2].name, "OCR1A");
    }

    #[test]
    fn test_header_and_changes() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.vcd");

        let regs = resolve_regs(&mcu, &["PORTB".to_string()]);
        let mut dump = VcdDump::open(&path, &mcu, regs).unwrap();

        // No change on the first frame.
        dump.dump_frame(&mcu, 0).unwrap();
        // PORTB changes on the second.
        mcu.dm[PORTB] = 0x0F;
        dump.dump_frame(&mcu, 1).unwrap();
        dump.flush().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("$timescale 500000 ps $end")); // 1 MHz clock
        assert!(text.contains("$scope module ATmega8A $end"));
        assert!(text.contains("$var reg 1 CLK_IO CLK_IO $end"));
        assert!(text.contains("$var reg 8 PORTB PORTB $end"));
        assert!(text.contains("$dumpvars"));
        // Initial value: pull-ups leave PORTB at 0xFF.
        assert!(text.contains("b11111111 PORTB"));
        // The change is stamped at tick 1, i.e. time 2.
        assert!(text.contains("#2\nb1 CLK_IO\nb00001111 PORTB"));
    }

    #[test]
    fn test_bit_variable() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bit.vcd");

        let regs = resolve_regs(&mcu, &["PORTB0".to_string()]);
        let mut dump = VcdDump::open(&path, &mcu, regs).unwrap();

        mcu.dm[PORTB] = 0xFE; // bit 0 falls
        dump.dump_frame(&mcu, 5).unwrap();
        dump.flush().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("$var reg 1 PORTB0 PORTB0 $end"));
        assert!(text.contains("#10\nb1 CLK_IO\nb0 PORTB0"));
    }
}
