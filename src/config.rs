//! Simulator configuration file
//!
//! The configuration is a line-oriented `key value` file. Blank lines
//! and lines starting with `#` are ignored. Keys which may appear more
//! than once (`lua_model`, `dump_reg`) accumulate.
//!
//! ```text
//! # Simulated microcontroller and its clock, in Hz
//! mcu m8a
//! mcu_freq 16000000
//!
//! firmware_file firmware.hex
//! rsp_port 12750
//! vcd_file trace.vcd
//! dump_reg PORTB
//! dump_reg TCNT0
//! ```

use std::fs;
use std::path::Path;

use thiserror::Error;

/// Default port for the GDB RSP server.
pub const DEFAULT_RSP_PORT: u16 = 12750;

/// Upper bound on the number of registers traced into a VCD file.
pub const MAX_DUMP_REGS: usize = 512;

/// Upper bound on the number of scripted peripheral models.
pub const MAX_TICK_MODELS: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read configuration file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("line {line}: missing value for '{key}'")]
    MissingValue { line: usize, key: String },
    #[error("line {line}: invalid value '{value}' for '{key}'")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("line {line}: unknown option '{key}'")]
    UnknownKey { line: usize, key: String },
    #[error("missing 'mcu' option")]
    MissingMcu,
}

/// Parsed simulator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// MCU model name (`m8`, `m8a`, `m328`, `m328p`, `m2560`).
    pub mcu: String,
    /// Requested clock frequency, in Hz. 0 keeps the model default.
    pub mcu_freq: u64,
    /// Lock bits byte, if present in the file.
    pub mcu_lockbits: Option<u8>,
    /// Extended fuse byte.
    pub mcu_efuse: Option<u8>,
    /// High fuse byte.
    pub mcu_hfuse: Option<u8>,
    /// Low fuse byte.
    pub mcu_lfuse: Option<u8>,
    /// Intel HEX firmware image.
    pub firmware_file: Option<String>,
    /// Run without a debugger attached, straight from reset.
    pub firmware_test: bool,
    /// If false, a flash dump left by a previous run is preferred
    /// over `firmware_file`.
    pub reset_flash: bool,
    /// TCP port of the GDB RSP server.
    pub rsp_port: u16,
    /// Scripted peripheral models (accepted, reported unsupported).
    pub tick_models: Vec<String>,
    /// Output VCD path.
    pub vcd_file: Option<String>,
    /// Register (or register bit) names to trace.
    pub dump_regs: Vec<String>,
    /// Switch the MCU to single-step mode on every IRQ entry.
    pub trap_at_isr: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mcu: String::new(),
            mcu_freq: 0,
            mcu_lockbits: None,
            mcu_efuse: None,
            mcu_hfuse: None,
            mcu_lfuse: None,
            firmware_file: None,
            firmware_test: false,
            reset_flash: true,
            rsp_port: DEFAULT_RSP_PORT,
            tick_models: Vec::new(),
            vcd_file: None,
            dump_regs: Vec::new(),
            trap_at_isr: false,
        }
    }
}

impl Config {
    /// Read a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_str_checked(&text)
    }

    /// Parse configuration text.
    pub fn from_str_checked(text: &str) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut parts = trimmed.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().map(str::trim).unwrap_or_default();
            if value.is_empty() {
                return Err(ConfigError::MissingValue {
                    line,
                    key: key.to_string(),
                });
            }

            match key {
                "mcu" => cfg.mcu = value.to_string(),
                "mcu_freq" => cfg.mcu_freq = parse_u64(line, key, value)?,
                "mcu_lockbits" => cfg.mcu_lockbits = Some(parse_u8(line, key, value)?),
                "mcu_efuse" => cfg.mcu_efuse = Some(parse_u8(line, key, value)?),
                "mcu_hfuse" => cfg.mcu_hfuse = Some(parse_u8(line, key, value)?),
                "mcu_lfuse" => cfg.mcu_lfuse = Some(parse_u8(line, key, value)?),
                "firmware_file" => cfg.firmware_file = Some(value.to_string()),
                "firmware_test" => cfg.firmware_test = parse_bool(line, key, value)?,
                "reset_flash" => cfg.reset_flash = parse_bool(line, key, value)?,
                "rsp_port" => {
                    let port = parse_u64(line, key, value)?;
                    // GDB must not be pointed at a reserved port.
                    if !(1025..=65535).contains(&port) {
                        return Err(ConfigError::InvalidValue {
                            line,
                            key: key.to_string(),
                            value: value.to_string(),
                        });
                    }
                    cfg.rsp_port = port as u16;
                }
                "lua_model" => {
                    if cfg.tick_models.len() < MAX_TICK_MODELS {
                        cfg.tick_models.push(value.to_string());
                    } else {
                        log::warn!("too many tick models, ignoring '{}'", value);
                    }
                }
                "vcd_file" => cfg.vcd_file = Some(value.to_string()),
                "dump_reg" => {
                    if cfg.dump_regs.len() < MAX_DUMP_REGS {
                        cfg.dump_regs.push(value.to_string());
                    } else {
                        log::warn!("too many dump registers, ignoring '{}'", value);
                    }
                }
                "trap_at_isr" => cfg.trap_at_isr = parse_bool(line, key, value)?,
                _ => {
                    return Err(ConfigError::UnknownKey {
                        line,
                        key: key.to_string(),
                    })
                }
            }
        }

        if cfg.mcu.is_empty() {
            return Err(ConfigError::MissingMcu);
        }
        Ok(cfg)
    }
}

fn parse_u64(line: usize, key: &str, value: &str) -> Result<u64, ConfigError> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse::<u64>()
    };
    parsed.map_err(|_| ConfigError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u8(line: usize, key: &str, value: &str) -> Result<u8, ConfigError> {
    let v = parse_u64(line, key, value)?;
    if v > 0xFF {
        return Err(ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(v as u8)
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal() {
        let cfg = Config::from_str_checked("mcu m8a\n").unwrap();
        assert_eq!(cfg.mcu, "m8a");
        assert_eq!(cfg.rsp_port, DEFAULT_RSP_PORT);
        assert!(cfg.reset_flash);
        assert!(!cfg.firmware_test);
    }

    #[test]
    fn test_comments_and_blanks() {
        let text = "# a comment\n\nmcu m328p\n   # indented comment\n";
        let cfg = Config::from_str_checked(text).unwrap();
        assert_eq!(cfg.mcu, "m328p");
    }

    #[test]
    fn test_full_file() {
        let text = "\
mcu m8a
mcu_freq 16000000
mcu_lockbits 0x3F
mcu_hfuse 0xD9
mcu_lfuse 0xE1
firmware_file blink.hex
firmware_test yes
reset_flash no
rsp_port 12750
vcd_file trace.vcd
dump_reg PORTB
dump_reg TCNT0
dump_reg PORTD1
trap_at_isr yes
";
        let cfg = Config::from_str_checked(text).unwrap();
        assert_eq!(cfg.mcu_freq, 16_000_000);
        assert_eq!(cfg.mcu_lockbits, Some(0x3F));
        assert_eq!(cfg.mcu_hfuse, Some(0xD9));
        assert_eq!(cfg.mcu_lfuse, Some(0xE1));
        assert_eq!(cfg.mcu_efuse, None);
        assert_eq!(cfg.firmware_file.as_deref(), Some("blink.hex"));
        assert!(cfg.firmware_test);
        assert!(!cfg.reset_flash);
        assert_eq!(cfg.vcd_file.as_deref(), Some("trace.vcd"));
        assert_eq!(cfg.dump_regs, vec!["PORTB", "TCNT0", "PORTD1"]);
        assert!(cfg.trap_at_isr);
    }

    #[test]
    fn test_missing_mcu() {
        assert!(matches!(
            Config::from_str_checked("rsp_port 2000\n"),
            Err(ConfigError::MissingMcu)
        ));
    }

    #[test]
    fn test_reserved_rsp_port() {
        let err = Config::from_str_checked("mcu m8a\nrsp_port 1024\n");
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_unknown_key() {
        let err = Config::from_str_checked("mcu m8a\nbogus 1\n");
        assert!(matches!(err, Err(ConfigError::UnknownKey { .. })));
    }

    #[test]
    fn test_bad_bool() {
        let err = Config::from_str_checked("mcu m8a\nfirmware_test maybe\n");
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }
}
