//! Instruction-accurate simulator for 8-bit AVR microcontrollers
//!
//! Supported parts: ATmega8A, ATmega328, ATmega328P and ATmega2560. The
//! simulator executes unmodified firmware images produced by avr-gcc and
//! friends, models the peripheral set the firmware can observe (I/O
//! ports, timers/counters with waveform generation, watchdog, USART) and
//! exposes a GDB remote-serial-protocol server for source-level
//! debugging. Selected registers can be traced into a value-change-dump
//! (VCD) file at cycle granularity.
//!
//! # Architecture
//!
//! - `avr`: MCU state, decoder/executors, peripherals, simulation loop
//! - `config`: simulator configuration file parser
//! - `ihex`: Intel HEX firmware reader/writer
//! - `gdb`: GDB remote serial protocol server (TCP)
//! - `vcd`: value-change-dump register tracer
//! - `endpoint`: byte-stream endpoint bridging the USART to the host
//!
//! # Data memory layout
//!
//! AVR data memory is a single byte-addressed space:
//!
//! | Offset                 | Region                    |
//! |------------------------|---------------------------|
//! | 0x00 - 0x1F            | General purpose registers |
//! | 0x20 - 0x20 + io_count | I/O registers             |
//! | above                  | Internal SRAM             |
//!
//! `IN`/`OUT`/`SBI`/`CBI` address I/O registers relative to the start of
//! the I/O region; everything else uses absolute data-space addresses.
//! Program memory is a separate word-addressed space of 16-bit
//! little-endian words.

pub mod avr;
pub mod config;
pub mod endpoint;
pub mod gdb;
pub mod ihex;
pub mod vcd;

pub use avr::simcore::Simulation;
pub use avr::{Mcu, McuState};
pub use config::Config;
