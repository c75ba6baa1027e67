//! USART engine
//!
//! A programmable baud-rate generator running at the system clock. It
//! is reloaded with the 12-bit UBRR value whenever UBRRL is written or
//! the transmit counter runs out; each expiry of the Rx/Tx counters
//! shifts one character between the data register and the byte-stream
//! endpoint.
//!
//! On the ATmega8A the UBRRH and UCSRC registers share one I/O
//! location; the URSEL bit of the written value selects the
//! destination. The engine keeps one-tick-latched copies of the
//! affected registers so a write can be told apart from the stale
//! shared value, following the access sequence in the datasheet.

use super::Mcu;
use crate::endpoint::Endpoint;

// UCSRA bits
pub const RXC: u8 = 7;
pub const TXC: u8 = 6;
pub const UDRE: u8 = 5;
pub const U2X: u8 = 1;

// UCSRB bits
pub const RXEN: u8 = 4;
pub const TXEN: u8 = 3;
pub const UCSZ2: u8 = 2;
pub const RXB8: u8 = 1;
pub const TXB8: u8 = 0;

// UCSRC bits
pub const URSEL: u8 = 7;
pub const UMSEL: u8 = 6;
pub const UCSZ1: u8 = 2;
pub const UCSZ0: u8 = 1;

/// Data-memory addresses of the USART registers, provided by the model
/// descriptor.
#[derive(Debug, Clone, Copy)]
pub struct UsartRegs {
    pub udr: u16,
    pub ubrrl: u16,
    pub ubrrh: u16,
    pub ucsra: u16,
    pub ucsrb: u16,
    pub ucsrc: u16,
    /// UBRRH and UCSRC share one I/O location.
    pub shared_ubrrh_ucsrc: bool,
}

/// Registers latched on the previous tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsartShadow {
    pub ubrrh: u8,
    pub ubrrl: u8,
    pub ucsra: u8,
    pub ucsrc: u8,
    pub udr: u8,
}

/// USART state of one MCU.
#[derive(Debug, Clone)]
pub struct Usart {
    /// Register map, `None` when the part has no USART wired.
    pub regs: Option<UsartRegs>,
    /// Latched register copies for shared-slot disambiguation.
    pub shadow: UsartShadow,

    /// Current 12-bit baud divisor.
    pub baud: u32,
    /// Rx clock prescaler and countdown.
    pub rx_presc: u32,
    pub rx_ticks: u32,
    /// Tx clock prescaler and countdown.
    pub tx_presc: u32,
    pub tx_ticks: u32,
    /// Transmit data buffer (TXB).
    pub txb: u8,

    /// Byte-stream endpoint towards the host.
    pub endpoint: Option<Endpoint>,
}

impl Usart {
    pub fn none() -> Self {
        Self {
            regs: None,
            shadow: UsartShadow::default(),
            baud: 0,
            rx_presc: 0,
            rx_ticks: 0,
            tx_presc: 0,
            tx_ticks: 0,
            txb: 0,
            endpoint: None,
        }
    }
}

/// Character size from the UCSZ2..0 bits, as (data mask, nine-bit
/// flag). Reserved combinations return `None`.
fn char_size(ucsz: u8) -> Option<(u8, bool)> {
    match ucsz {
        0 => Some((0x1F, false)),
        1 => Some((0x3F, false)),
        2 => Some((0x7F, false)),
        3 => Some((0xFF, false)),
        7 => Some((0xFF, true)),
        _ => None,
    }
}

impl Mcu {
    /// One system-clock tick of the USART.
    pub fn update_usart(&mut self) {
        let Some(regs) = self.usart.regs else {
            return;
        };

        // Effective UCSRC: on a shared slot the data-memory value is
        // only valid when the last write selected UCSRC.
        let ucsrc = self.usart_effective_ucsrc(&regs);

        // Reload the baud generator on an UBRRL write or when the
        // transmitter ran dry.
        if self.usart.shadow.ubrrl != self.dm[regs.ubrrl as usize] || self.usart.tx_ticks == 0 {
            let ubrrh = if regs.shared_ubrrh_ucsrc {
                let dmv = self.dm[regs.ubrrh as usize];
                if (dmv >> URSEL) & 1 == 0 {
                    // Fresh UBRRH value in data memory.
                    dmv
                } else {
                    self.usart.shadow.ubrrh
                }
            } else {
                self.dm[regs.ubrrh as usize]
            };
            self.usart.baud = (((ubrrh & 0x0F) as u32) << 8) | self.dm[regs.ubrrl as usize] as u32;

            self.usart.rx_presc = self.usart.baud + 1;
            self.usart.rx_ticks = self.usart.rx_presc;

            let mult = if (ucsrc >> UMSEL) & 1 == 0 {
                if (self.dm[regs.ucsra as usize] >> U2X) & 1 == 0 {
                    16 // Asynchronous normal mode
                } else {
                    8 // Asynchronous double speed mode
                }
            } else {
                log::warn!("USART synchronous mode is not supported yet, Txclk=Fosc/(UBRR+1)");
                1
            };
            self.usart.tx_presc = mult * (self.usart.baud + 1);
            self.usart.tx_ticks = self.usart.tx_presc;
        }

        // A UDR write with UDRE set loads the transmit buffer.
        if self.io_written(regs.udr as u32) && (self.dm[regs.ucsra as usize] >> UDRE) & 1 == 1 {
            self.usart.txb = self.dm[regs.udr as usize];
            self.dm[regs.ucsra as usize] &= !(1 << UDRE);
        }

        // Reading UDR clears RXC.
        if self.io_read(regs.udr as u32) {
            self.dm[regs.ucsra as usize] &= !(1 << RXC);
        }

        if self.usart.rx_ticks > 0 {
            self.usart.rx_ticks -= 1;
        }
        if self.usart.rx_ticks == 0 && (self.dm[regs.ucsrb as usize] >> RXEN) & 1 == 1 {
            self.usart_receive(&regs, ucsrc);
            self.usart.rx_ticks = self.usart.rx_presc;
        }

        if self.usart.tx_ticks > 0 {
            self.usart.tx_ticks -= 1;
        }
        if self.usart.tx_ticks == 0 && (self.dm[regs.ucsrb as usize] >> TXEN) & 1 == 1 {
            self.usart_transmit(&regs, ucsrc);
        }
    }

    /// Refresh the latched register copies. Runs after the engine so a
    /// value written by the current instruction is visible for exactly
    /// one tick.
    pub fn update_usart_shadow(&mut self) {
        let Some(regs) = self.usart.regs else {
            return;
        };
        if regs.shared_ubrrh_ucsrc {
            let v = self.dm[regs.ubrrh as usize];
            if (v >> URSEL) & 1 == 0 {
                self.usart.shadow.ubrrh = v;
            } else {
                self.usart.shadow.ucsrc = v;
            }
        } else {
            self.usart.shadow.ubrrh = self.dm[regs.ubrrh as usize];
            self.usart.shadow.ucsrc = self.dm[regs.ucsrc as usize];
        }
        self.usart.shadow.ubrrl = self.dm[regs.ubrrl as usize];
        self.usart.shadow.ucsra = self.dm[regs.ucsra as usize];
        self.usart.shadow.udr = self.dm[regs.udr as usize];
    }

    fn usart_effective_ucsrc(&self, regs: &UsartRegs) -> u8 {
        if regs.shared_ubrrh_ucsrc {
            let dmv = self.dm[regs.ucsrc as usize];
            if (dmv >> URSEL) & 1 == 1 {
                dmv
            } else {
                self.usart.shadow.ucsrc
            }
        } else {
            self.dm[regs.ucsrc as usize]
        }
    }

    fn usart_ucsz(&self, regs: &UsartRegs, ucsrc: u8) -> u8 {
        (((self.dm[regs.ucsrb as usize] >> UCSZ2) & 1) << 2)
            | (((ucsrc >> UCSZ1) & 1) << 1)
            | ((ucsrc >> UCSZ0) & 1)
    }

    fn usart_transmit(&mut self, regs: &UsartRegs, ucsrc: u8) {
        let ucsz = self.usart_ucsz(regs, ucsrc);
        let Some((mask, nine_bit)) = char_size(ucsz) else {
            log::error!(
                "these bits to select USART character size are reserved: UCSZ=0x{:X}",
                ucsz
            );
            return;
        };

        // Transmit only when the data buffer holds a fresh character.
        if (self.dm[regs.ucsra as usize] >> UDRE) & 1 != 0 {
            return;
        }
        let Some(endpoint) = self.usart.endpoint.clone() else {
            return;
        };

        endpoint.send(self.usart.txb & mask);
        if nine_bit {
            endpoint.send((self.dm[regs.ucsrb as usize] >> TXB8) & 1);
        }
        log::trace!("USART -> 0x{:02X}, pc=0x{:06X}", self.usart.txb & mask, self.pc);

        self.dm[regs.ucsra as usize] |= 1 << UDRE;
        self.dm[regs.ucsra as usize] |= 1 << TXC;
    }

    fn usart_receive(&mut self, regs: &UsartRegs, ucsrc: u8) {
        let ucsz = self.usart_ucsz(regs, ucsrc);
        let Some((mask, nine_bit)) = char_size(ucsz) else {
            log::error!(
                "these bits to select USART character size are reserved: UCSZ=0x{:X}",
                ucsz
            );
            return;
        };

        // Receive only once the previous character was consumed.
        if (self.dm[regs.ucsra as usize] >> RXC) & 1 != 0 {
            return;
        }
        let Some(endpoint) = self.usart.endpoint.clone() else {
            return;
        };

        let Some(byte) = endpoint.try_recv() else {
            return;
        };
        self.dm[regs.udr as usize] = byte & mask;
        self.dm[regs.ucsrb as usize] &= !(1 << RXB8);
        if nine_bit {
            if let Some(ninth) = endpoint.try_recv() {
                if ninth & 1 == 1 {
                    self.dm[regs.ucsrb as usize] |= 1 << RXB8;
                }
            }
        }
        self.dm[regs.ucsra as usize] |= 1 << RXC;
        log::trace!("USART <- 0x{:02X}, mask 0x{:02X}", byte, mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avr::models;
    use crate::endpoint;

    const UDR: u32 = 0x2C;
    const UCSRA: u32 = 0x2B;
    const UCSRB: u32 = 0x2A;
    const UBRRL: u32 = 0x29;

    fn usart_mcu() -> (crate::avr::Mcu, endpoint::HostEndpoint) {
        let (mut mcu, _) = models::init("m8a").unwrap();
        let (sim, host) = endpoint::pair();
        mcu.usart.endpoint = Some(sim);
        (mcu, host)
    }

    fn run_usart(mcu: &mut crate::avr::Mcu, ticks: u32) {
        for _ in 0..ticks {
            mcu.update_usart();
            mcu.update_usart_shadow();
            mcu.writ_io = [0; 4];
            mcu.read_io = [0; 4];
        }
    }

    #[test]
    fn test_transmit_byte() {
        let (mut mcu, host) = usart_mcu();

        // UBRR = 0, 8-bit frames (UCSRC reset value), transmitter on.
        mcu.write_ds(UBRRL, 0);
        mcu.write_ds(UCSRB, 1 << TXEN);

        // Firmware writes UDR; UDRE is set after reset.
        mcu.write_ds(UDR, b'A');
        mcu.update_usart();
        assert_eq!(mcu.dm[UCSRA as usize] >> UDRE & 1, 0);
        mcu.update_usart_shadow();
        mcu.writ_io = [0; 4];

        // One frame takes 16 * (UBRR + 1) clocks in normal mode.
        run_usart(&mut mcu, 20);
        assert_eq!(host.drain(), vec![b'A']);
        assert_eq!(mcu.dm[UCSRA as usize] >> UDRE & 1, 1);
        assert_eq!(mcu.dm[UCSRA as usize] >> TXC & 1, 1);
    }

    #[test]
    fn test_receive_byte() {
        let (mut mcu, host) = usart_mcu();

        mcu.write_ds(UBRRL, 0);
        mcu.write_ds(UCSRB, 1 << RXEN);
        host.send(0x5A);

        run_usart(&mut mcu, 4);
        assert_eq!(mcu.dm[UCSRA as usize] >> RXC & 1, 1);
        assert_eq!(mcu.dm[UDR as usize], 0x5A);
    }

    #[test]
    fn test_rxc_clears_on_udr_read() {
        let (mut mcu, host) = usart_mcu();

        mcu.write_ds(UBRRL, 0);
        mcu.write_ds(UCSRB, 1 << RXEN);
        host.send(0x11);
        run_usart(&mut mcu, 4);
        assert_eq!(mcu.dm[UCSRA as usize] >> RXC & 1, 1);

        // Firmware reads UDR.
        let v = mcu.dm_read(UDR);
        assert_eq!(v, 0x11);
        mcu.update_usart();
        assert_eq!(mcu.dm[UCSRA as usize] >> RXC & 1, 0);
    }

    #[test]
    fn test_five_bit_frames_are_masked() {
        let (mut mcu, host) = usart_mcu();

        // UCSZ = 0 (5-bit): clear UCSZ1/UCSZ0 via a UCSRC write with
        // URSEL set.
        let ucsrc = 0x40; // UBRRH/UCSRC slot
        mcu.write_ds(ucsrc, 1 << URSEL);
        mcu.update_usart_shadow();
        mcu.write_ds(UBRRL, 0);
        mcu.write_ds(UCSRB, 1 << TXEN);

        mcu.write_ds(UDR, 0xFF);
        mcu.update_usart();
        mcu.update_usart_shadow();
        mcu.writ_io = [0; 4];

        run_usart(&mut mcu, 20);
        assert_eq!(host.drain(), vec![0x1F]);
    }
}
