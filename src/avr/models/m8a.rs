//! ATmega8/8A descriptor
//!
//! 8 KiB flash, 1 KiB SRAM, three timers, one USART with the shared
//! UBRRH/UCSRC location, a 19-slot vector table with single-word
//! vectors.

use crate::avr::interrupt::{IntVec, Interrupts};
use crate::avr::io::{IoBit, IoPort};
use crate::avr::timer::{CompChan, CountDir, Timer, UpdateAt, WgmKind, WgmMode};
use crate::avr::usart::{Usart, UsartRegs, UsartShadow};
use crate::avr::wdt::Wdt;
use crate::avr::{Bootloader, ClkSource, Mcu, FUSE_HIGH, FUSE_LOW};

use super::{
    base_mcu, com_op_16bit_chan_a, com_op_16bit_chan_b, com_op_8bit_4modes, set_ioregs, Geometry,
    Model,
};

// I/O registers, as data-memory addresses.
const TWBR: u16 = 0x20;
const TWSR: u16 = 0x21;
const TWAR: u16 = 0x22;
const TWDR: u16 = 0x23;
const ADCL: u16 = 0x24;
const ADCH: u16 = 0x25;
const ADCSRA: u16 = 0x26;
const ADMUX: u16 = 0x27;
const ACSR: u16 = 0x28;
const UBRRL: u16 = 0x29;
const UCSRB: u16 = 0x2A;
const UCSRA: u16 = 0x2B;
const UDR: u16 = 0x2C;
const SPCR: u16 = 0x2D;
const SPSR: u16 = 0x2E;
const SPDR: u16 = 0x2F;
const PIND: u16 = 0x30;
const DDRD: u16 = 0x31;
const PORTD: u16 = 0x32;
const PINC: u16 = 0x33;
const DDRC: u16 = 0x34;
const PORTC: u16 = 0x35;
const PINB: u16 = 0x36;
const DDRB: u16 = 0x37;
const PORTB: u16 = 0x38;
const EECR: u16 = 0x3C;
const EEDR: u16 = 0x3D;
const EEARL: u16 = 0x3E;
const EEARH: u16 = 0x3F;
const UBRRH_UCSRC: u16 = 0x40;
const WDTCR: u16 = 0x41;
const ASSR: u16 = 0x42;
const OCR2: u16 = 0x43;
const TCNT2: u16 = 0x44;
const TCCR2: u16 = 0x45;
const ICR1L: u16 = 0x46;
const ICR1H: u16 = 0x47;
const OCR1BL: u16 = 0x48;
const OCR1BH: u16 = 0x49;
const OCR1AL: u16 = 0x4A;
const OCR1AH: u16 = 0x4B;
const TCNT1L: u16 = 0x4C;
const TCNT1H: u16 = 0x4D;
const TCCR1B: u16 = 0x4E;
const TCCR1A: u16 = 0x4F;
const SFIOR: u16 = 0x50;
const OSCCAL: u16 = 0x51;
const TCNT0: u16 = 0x52;
const TCCR0: u16 = 0x53;
const MCUCSR: u16 = 0x54;
const MCUCR: u16 = 0x55;
const TWCR: u16 = 0x56;
const SPMCR: u16 = 0x57;
const TIFR: u16 = 0x58;
const TIMSK: u16 = 0x59;
const GIFR: u16 = 0x5A;
const GICR: u16 = 0x5B;
const SPL: u16 = 0x5D;
const SPH: u16 = 0x5E;
const SREG: u16 = 0x5F;

// TIMSK/TIFR bits.
const TOIE0: u8 = 0;
const TOIE1: u8 = 2;
const OCIE1B: u8 = 3;
const OCIE1A: u8 = 4;
const TICIE1: u8 = 5;
const TOIE2: u8 = 6;
const OCIE2: u8 = 7;
const TOV0: u8 = 0;
const TOV1: u8 = 2;
const OCF1B: u8 = 3;
const OCF1A: u8 = 4;
const ICF1: u8 = 5;
const TOV2: u8 = 6;
const OCF2: u8 = 7;

// SPMCR bits.
const SPMIE: u8 = 7;
const SPMEN: u8 = 0;

// Vector indices (0 = the first vector after reset).
const TIMER2_COMP_VECT: u8 = 2;
const TIMER2_OVF_VECT: u8 = 3;
const TIMER1_CAPT_VECT: u8 = 4;
const TIMER1_COMPA_VECT: u8 = 5;
const TIMER1_COMPB_VECT: u8 = 6;
const TIMER1_OVF_VECT: u8 = 7;
const TIMER0_OVF_VECT: u8 = 8;
const SPM_RDY_VECT: u8 = 17;

/// ATmega8/8A behaviour: USART tick, SPMEN completion latch, fuses.
pub struct M8a {
    spmcr_buf: u8,
    spmen_cycles: u8,
    spmen_clear: bool,
}

pub fn init(partno: &str) -> (Mcu, Box<dyn Model>) {
    let geo = Geometry {
        pc_bits: 12,
        freq: 1_000_000,
        freq_max: 16_000_000,
        flashend: 0x1FFF,
        ramstart: 0x60,
        ramend: 0x45F,
        e2end: 0x1FF,
        spm_pagesize: 64,
    };
    let name = if partno == "m8" { "ATmega8" } else { "ATmega8A" };
    let mut mcu = base_mcu(name, [0x1E, 0x93, 0x07], &geo);

    mcu.spmcsr = Some(SPMCR);
    mcu.fuse = [0xE1, 0xD9, 0xFF];
    mcu.bls = Bootloader {
        start: 0x1800,
        end: 0x1FFF,
        size: 2048,
    };
    // Single-word vectors: the table is rjmp-sized.
    mcu.intr = Interrupts::new(0x0000, 0x0001, 1);

    set_ioregs(
        &mut mcu,
        &[
            (TWBR, "TWBR", 0x00, 0xFF),
            (TWSR, "TWSR", 0xF8, 0xFF),
            (TWAR, "TWAR", 0xFE, 0xFF),
            (TWDR, "TWDR", 0xFF, 0xFF),
            (ADCL, "ADCL", 0x00, 0xFF),
            (ADCH, "ADCH", 0x00, 0xFF),
            (ADCSRA, "ADCSRA", 0x00, 0xFF),
            (ADMUX, "ADMUX", 0x00, 0xFF),
            (ACSR, "ACSR", 0x00, 0xFF),
            (UBRRL, "UBRRL", 0x00, 0xFF),
            (UCSRB, "UCSRB", 0x00, 0xFF),
            (UCSRA, "UCSRA", 0x20, 0xFF),
            (UDR, "UDR", 0x00, 0xFF),
            (SPCR, "SPCR", 0x00, 0xFF),
            (SPSR, "SPSR", 0x00, 0xFF),
            (SPDR, "SPDR", 0x00, 0xFF),
            (PIND, "PIND", 0x00, 0xFF),
            (DDRD, "DDRD", 0x00, 0xFF),
            (PORTD, "PORTD", 0xFF, 0xFF),
            (PINC, "PINC", 0x00, 0x7F),
            (DDRC, "DDRC", 0x00, 0x7F),
            (PORTC, "PORTC", 0xFF, 0x7F),
            (PINB, "PINB", 0x00, 0xFF),
            (DDRB, "DDRB", 0x00, 0xFF),
            (PORTB, "PORTB", 0xFF, 0xFF),
            (EECR, "EECR", 0x00, 0x0F),
            (EEDR, "EEDR", 0x00, 0xFF),
            (EEARL, "EEARL", 0x00, 0xFF),
            (EEARH, "EEARH", 0x00, 0x01),
            (UBRRH_UCSRC, "UCSRC", 0x86, 0xFF),
            (WDTCR, "WDTCR", 0x00, 0x1F),
            (ASSR, "ASSR", 0x00, 0x0F),
            (OCR2, "OCR2", 0x00, 0xFF),
            (TCNT2, "TCNT2", 0x00, 0xFF),
            (TCCR2, "TCCR2", 0x00, 0xFF),
            (ICR1L, "ICR1L", 0x00, 0xFF),
            (ICR1H, "ICR1H", 0x00, 0xFF),
            (OCR1BL, "OCR1BL", 0x00, 0xFF),
            (OCR1BH, "OCR1BH", 0x00, 0xFF),
            (OCR1AL, "OCR1AL", 0x00, 0xFF),
            (OCR1AH, "OCR1AH", 0x00, 0xFF),
            (TCNT1L, "TCNT1L", 0x00, 0xFF),
            (TCNT1H, "TCNT1H", 0x00, 0xFF),
            (TCCR1B, "TCCR1B", 0x00, 0xDF),
            (TCCR1A, "TCCR1A", 0x00, 0xFF),
            (SFIOR, "SFIOR", 0x00, 0x0F),
            (OSCCAL, "OSCCAL", 0x00, 0xFF),
            (TCNT0, "TCNT0", 0x00, 0xFF),
            (TCCR0, "TCCR0", 0x00, 0x07),
            (MCUCSR, "MCUCSR", 0x00, 0xFF),
            (MCUCR, "MCUCR", 0x00, 0xFF),
            (TWCR, "TWCR", 0x00, 0xF5),
            (SPMCR, "SPMCR", 0x00, 0xFF),
            (TIFR, "TIFR", 0x00, 0xFF),
            (TIMSK, "TIMSK", 0x00, 0xFF),
            (GIFR, "GIFR", 0x00, 0xE0),
            (GICR, "GICR", 0x00, 0xC3),
            (SPL, "SPL", 0x00, 0xFF),
            (SPH, "SPH", 0x00, 0x07),
            (SREG, "SREG", 0x00, 0xFF),
        ],
    );

    // Firmware usually loads SP itself, but a sane default keeps bare
    // test programs honest.
    mcu.dm[SPL as usize] = (geo.ramend & 0xFF) as u8;
    mcu.dm[SPH as usize] = (geo.ramend >> 8) as u8;

    mcu.ports = vec![
        IoPort {
            port: IoBit::byte(PORTB),
            ddr: IoBit::byte(DDRB),
            pin: IoBit::byte(PINB),
        },
        IoPort {
            port: IoBit::byte(PORTC),
            ddr: IoBit::byte(DDRC),
            pin: IoBit::byte(PINC),
        },
        IoPort {
            port: IoBit::byte(PORTD),
            ddr: IoBit::byte(DDRD),
            pin: IoBit::byte(PIND),
        },
    ];

    mcu.timers = vec![timer0(), timer1(), timer2()];
    mcu.wdt = wdt();
    mcu.usart = usart();

    let model = M8a {
        spmcr_buf: mcu.dm[SPMCR as usize],
        spmen_cycles: 0,
        spmen_clear: false,
    };

    (mcu, Box::new(model))
}

fn timer0() -> Timer {
    Timer {
        tcnt: [IoBit::byte(TCNT0), IoBit::none()],
        disabled: IoBit::none(),
        size: 8,
        scnt: 0,
        cnt_dir: CountDir::Up,
        cs: [
            IoBit::bit(TCCR0, 0),
            IoBit::bit(TCCR0, 1),
            IoBit::bit(TCCR0, 2),
            IoBit::none(),
        ],
        cs_div: [0, 0, 3, 6, 8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        presc: 1,
        // Timer 0 has no waveform generator on this part.
        wgm: [IoBit::none(); 4],
        wgm_op: [WgmMode::unused(); 16],
        wgmi: None,
        icr: [IoBit::none(); 2],
        icp: IoBit::none(),
        ices: IoBit::none(),
        icpval: 0,
        iv_ovf: IntVec::new(
            IoBit::bit(TIMSK, TOIE0),
            IoBit::bit(TIFR, TOV0),
            TIMER0_OVF_VECT,
        ),
        iv_ic: IntVec::none(),
        comp: Vec::new(),
    }
}

fn timer1() -> Timer {
    let mut wgm_op = [WgmMode::unused(); 16];
    let ocr1a = [IoBit::byte(OCR1AL), IoBit::byte(OCR1AH)];
    let icr1 = [IoBit::byte(ICR1L), IoBit::byte(ICR1H)];

    wgm_op[0] = WgmMode::fixed(
        WgmKind::Normal,
        16,
        0xFFFF,
        UpdateAt::Immediate,
        UpdateAt::Max,
    );
    wgm_op[1] = WgmMode::fixed(WgmKind::PcPwm, 8, 0x00FF, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[2] = WgmMode::fixed(WgmKind::PcPwm, 9, 0x01FF, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[3] = WgmMode::fixed(WgmKind::PcPwm, 10, 0x03FF, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[4] = WgmMode::reg_top(WgmKind::Ctc, ocr1a, UpdateAt::Immediate, UpdateAt::Max);
    wgm_op[5] = WgmMode::fixed(WgmKind::FastPwm, 8, 0x00FF, UpdateAt::Bottom, UpdateAt::Top);
    wgm_op[6] = WgmMode::fixed(WgmKind::FastPwm, 9, 0x01FF, UpdateAt::Bottom, UpdateAt::Top);
    wgm_op[7] = WgmMode::fixed(WgmKind::FastPwm, 10, 0x03FF, UpdateAt::Bottom, UpdateAt::Top);
    wgm_op[8] = WgmMode::reg_top(WgmKind::PfcPwm, icr1, UpdateAt::Bottom, UpdateAt::Bottom);
    wgm_op[9] = WgmMode::reg_top(WgmKind::PfcPwm, ocr1a, UpdateAt::Bottom, UpdateAt::Bottom);
    wgm_op[10] = WgmMode::reg_top(WgmKind::PcPwm, icr1, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[11] = WgmMode::reg_top(WgmKind::PcPwm, ocr1a, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[12] = WgmMode::reg_top(WgmKind::Ctc, icr1, UpdateAt::Immediate, UpdateAt::Max);
    wgm_op[14] = WgmMode::reg_top(WgmKind::FastPwm, icr1, UpdateAt::Bottom, UpdateAt::Top);
    wgm_op[15] = WgmMode::reg_top(WgmKind::FastPwm, ocr1a, UpdateAt::Bottom, UpdateAt::Top);

    Timer {
        tcnt: [IoBit::byte(TCNT1L), IoBit::byte(TCNT1H)],
        disabled: IoBit::none(),
        size: 16,
        scnt: 0,
        cnt_dir: CountDir::Up,
        cs: [
            IoBit::bit(TCCR1B, 0),
            IoBit::bit(TCCR1B, 1),
            IoBit::bit(TCCR1B, 2),
            IoBit::none(),
        ],
        cs_div: [0, 0, 3, 6, 8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        presc: 1,
        wgm: [
            IoBit::bit(TCCR1A, 0),
            IoBit::bit(TCCR1A, 1),
            IoBit::bit(TCCR1B, 3),
            IoBit::bit(TCCR1B, 4),
        ],
        wgm_op,
        wgmi: None,
        icr: icr1,
        icp: IoBit::bit(PORTB, 0),
        ices: IoBit::bit(TCCR1B, 6),
        icpval: 0,
        iv_ovf: IntVec::new(
            IoBit::bit(TIMSK, TOIE1),
            IoBit::bit(TIFR, TOV1),
            TIMER1_OVF_VECT,
        ),
        iv_ic: IntVec::new(
            IoBit::bit(TIMSK, TICIE1),
            IoBit::bit(TIFR, ICF1),
            TIMER1_CAPT_VECT,
        ),
        comp: vec![
            CompChan {
                ocr: ocr1a,
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 1),
                ddp: IoBit::bit(DDRB, 1),
                com: IoBit::bits(TCCR1A, 6, 0x3, 2),
                com_op: com_op_16bit_chan_a(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK, OCIE1A),
                    IoBit::bit(TIFR, OCF1A),
                    TIMER1_COMPA_VECT,
                ),
            },
            CompChan {
                ocr: [IoBit::byte(OCR1BL), IoBit::byte(OCR1BH)],
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 2),
                ddp: IoBit::bit(DDRB, 2),
                com: IoBit::bits(TCCR1A, 4, 0x3, 2),
                com_op: com_op_16bit_chan_b(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK, OCIE1B),
                    IoBit::bit(TIFR, OCF1B),
                    TIMER1_COMPB_VECT,
                ),
            },
        ],
    }
}

fn timer2() -> Timer {
    let mut wgm_op = [WgmMode::unused(); 16];
    wgm_op[0] = WgmMode::fixed(WgmKind::Normal, 8, 0xFF, UpdateAt::Immediate, UpdateAt::Max);
    wgm_op[1] = WgmMode::fixed(WgmKind::PcPwm, 8, 0xFF, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[2] = WgmMode::reg_top(
        WgmKind::Ctc,
        [IoBit::byte(OCR2), IoBit::none()],
        UpdateAt::Immediate,
        UpdateAt::Max,
    );
    wgm_op[3] = WgmMode::fixed(WgmKind::FastPwm, 8, 0xFF, UpdateAt::Bottom, UpdateAt::Max);

    Timer {
        tcnt: [IoBit::byte(TCNT2), IoBit::none()],
        disabled: IoBit::none(),
        size: 8,
        scnt: 0,
        cnt_dir: CountDir::Up,
        cs: [
            IoBit::bit(TCCR2, 0),
            IoBit::bit(TCCR2, 1),
            IoBit::bit(TCCR2, 2),
            IoBit::none(),
        ],
        cs_div: [0, 0, 3, 5, 6, 7, 8, 10, 0, 0, 0, 0, 0, 0, 0, 0],
        presc: 1,
        wgm: [
            IoBit::bit(TCCR2, 6),
            IoBit::bit(TCCR2, 3),
            IoBit::none(),
            IoBit::none(),
        ],
        wgm_op,
        wgmi: None,
        icr: [IoBit::none(); 2],
        icp: IoBit::none(),
        ices: IoBit::none(),
        icpval: 0,
        iv_ovf: IntVec::new(
            IoBit::bit(TIMSK, TOIE2),
            IoBit::bit(TIFR, TOV2),
            TIMER2_OVF_VECT,
        ),
        iv_ic: IntVec::none(),
        comp: vec![CompChan {
            ocr: [IoBit::byte(OCR2), IoBit::none()],
            ocr_buf: 0,
            pin: IoBit::bit(PORTB, 3),
            ddp: IoBit::bit(DDRB, 3),
            com: IoBit::bits(TCCR2, 4, 0x3, 2),
            com_op: com_op_8bit_4modes(),
            iv: IntVec::new(
                IoBit::bit(TIMSK, OCIE2),
                IoBit::bit(TIFR, OCF2),
                TIMER2_COMP_VECT,
            ),
        }],
    }
}

fn wdt() -> Wdt {
    let mut w = Wdt::none();
    w.wdton = Some((FUSE_HIGH, 6));
    w.wde = IoBit::bit(WDTCR, 3);
    w.ce = IoBit::bit(WDTCR, 4);
    w.oscf = 1_000_000;
    w.wdp = [
        IoBit::bit(WDTCR, 0),
        IoBit::bit(WDTCR, 1),
        IoBit::bit(WDTCR, 2),
        IoBit::none(),
    ];
    w.wdp_op[..8].copy_from_slice(&[16, 32, 64, 128, 256, 512, 1024, 2048]);
    w
}

fn usart() -> Usart {
    let mut u = Usart::none();
    u.regs = Some(UsartRegs {
        udr: UDR,
        ubrrl: UBRRL,
        ubrrh: UBRRH_UCSRC,
        ucsra: UCSRA,
        ucsrb: UCSRB,
        ucsrc: UBRRH_UCSRC,
        shared_ubrrh_ucsrc: true,
    });
    u.shadow = UsartShadow {
        ubrrh: 0,
        ubrrl: 0,
        ucsra: 0x20,
        ucsrc: 0x86,
        udr: 0,
    };
    u
}

impl Model for M8a {
    fn set_fuse(&mut self, mcu: &mut Mcu, fuse: usize, val: u8) {
        if fuse > FUSE_HIGH {
            log::error!("fuse #{} is not supported by {}", fuse, mcu.name);
            return;
        }
        mcu.fuse[fuse] = val;
        let cksel = mcu.fuse[FUSE_LOW] & 0x0F;
        let ckopt = (mcu.fuse[FUSE_HIGH] >> 4) & 0x1;

        match fuse {
            FUSE_LOW => match cksel {
                0 => mcu.clk_source = ClkSource::External,
                1..=4 => {
                    mcu.clk_source = ClkSource::InternalRc;
                    mcu.freq = match cksel {
                        1 => 1_000_000,
                        2 => 2_000_000,
                        3 => 4_000_000,
                        _ => 8_000_000,
                    };
                }
                5..=8 => {
                    mcu.clk_source = ClkSource::ExternalRc;
                    mcu.freq = match cksel {
                        5 => 900_000,
                        6 => 3_000_000,
                        7 => 8_000_000,
                        _ => 12_000_000,
                    };
                }
                9 => {
                    mcu.clk_source = ClkSource::LowFreqCrystal;
                    mcu.freq = 32_768;
                }
                _ => {
                    mcu.clk_source = ClkSource::Crystal;
                    mcu.freq = match (cksel >> 1) & 0x7 {
                        5 => 900_000,
                        6 => 3_000_000,
                        _ => 8_000_000,
                    };
                    if ckopt == 0 {
                        mcu.freq = 16_000_000;
                    }
                }
            },
            FUSE_HIGH => {
                let bootsz = (val >> 1) & 0x3;
                let (start, size) = match bootsz {
                    3 => (0x1F00, 256),
                    2 => (0x1E00, 512),
                    1 => (0x1C00, 1024),
                    _ => (0x1800, 2048),
                };
                mcu.bls = Bootloader {
                    start,
                    end: 0x1FFF,
                    size,
                };

                // BOOTRST programmed moves the reset vector into the
                // bootloader section.
                if val & 1 == 1 {
                    mcu.intr.reset_pc = 0x0000;
                    mcu.pc = 0x0000;
                } else {
                    mcu.intr.reset_pc = mcu.bls.start >> 1;
                    mcu.pc = mcu.bls.start >> 1;
                }

                if ckopt == 0 {
                    mcu.freq = 16_000_000;
                }
            }
            _ => {}
        }
    }

    fn set_lock(&mut self, mcu: &mut Mcu, val: u8) {
        mcu.lockbits = val;
    }

    fn tick(&mut self, mcu: &mut Mcu) {
        mcu.update_usart();

        // SPMEN auto-clears four cycles after it was set; firmware
        // gets an SPM_RDY interrupt when SPMIE is on.
        if let Some(spmcr) = mcu.spmcsr {
            if self.spmen_clear {
                if self.spmen_cycles == 0 {
                    self.spmen_clear = false;
                    self.reset_spm(mcu);
                } else {
                    self.spmen_cycles -= 1;
                }
            }
            let cur = mcu.dm[spmcr as usize];
            if (self.spmcr_buf >> SPMEN) & 1 == 0 && (cur >> SPMEN) & 1 == 1 {
                self.spmen_cycles = 4;
                self.spmen_clear = true;
            }
            self.spmcr_buf = mcu.dm[spmcr as usize];
        }

        mcu.update_usart_shadow();
    }

    fn reset_spm(&mut self, mcu: &mut Mcu) {
        if let Some(spmcr) = mcu.spmcsr {
            mcu.dm[spmcr as usize] &= !(1 << SPMEN);
            if (mcu.dm[spmcr as usize] >> SPMIE) & 1 == 1 {
                mcu.intr.request(SPM_RDY_VECT);
            }
        }
    }
}
