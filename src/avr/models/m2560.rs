//! ATmega2560 descriptor
//!
//! 256 KiB flash behind a 17-bit word program counter, RAMPZ and EIND
//! paging registers, three-byte return addresses, eleven ports and six
//! timers. The descriptor wires ports A..L and timers 0..2; timers
//! 3..5 share the engine and can be added the same way.

use crate::avr::interrupt::{IntVec, Interrupts};
use crate::avr::io::{IoBit, IoPort};
use crate::avr::timer::{CompChan, CountDir, Timer, UpdateAt, WgmKind, WgmMode};
use crate::avr::usart::{Usart, UsartRegs, UsartShadow};
use crate::avr::wdt::Wdt;
use crate::avr::{Bootloader, ClkSource, Mcu, FUSE_EXT, FUSE_HIGH, FUSE_LOW};

use super::{
    base_mcu, com_op_16bit_chan_a, com_op_16bit_chan_b, com_op_8bit_8modes_chan_a,
    com_op_8bit_8modes_chan_b, set_ioregs, Geometry, Model,
};

// I/O registers, as data-memory addresses.
const PINA: u16 = 0x20;
const DDRA: u16 = 0x21;
const PORTA: u16 = 0x22;
const PINB: u16 = 0x23;
const DDRB: u16 = 0x24;
const PORTB: u16 = 0x25;
const PINC: u16 = 0x26;
const DDRC: u16 = 0x27;
const PORTC: u16 = 0x28;
const PIND: u16 = 0x29;
const DDRD: u16 = 0x2A;
const PORTD: u16 = 0x2B;
const PINE: u16 = 0x2C;
const DDRE: u16 = 0x2D;
const PORTE: u16 = 0x2E;
const PINF: u16 = 0x2F;
const DDRF: u16 = 0x30;
const PORTF: u16 = 0x31;
const PING: u16 = 0x32;
const DDRG: u16 = 0x33;
const PORTG: u16 = 0x34;
const TIFR0: u16 = 0x35;
const TIFR1: u16 = 0x36;
const TIFR2: u16 = 0x37;
const EECR: u16 = 0x3F;
const EEDR: u16 = 0x40;
const EEARL: u16 = 0x41;
const EEARH: u16 = 0x42;
const GTCCR: u16 = 0x43;
const TCCR0A: u16 = 0x44;
const TCCR0B: u16 = 0x45;
const TCNT0: u16 = 0x46;
const OCR0A: u16 = 0x47;
const OCR0B: u16 = 0x48;
const SPCR: u16 = 0x4C;
const SPSR: u16 = 0x4D;
const SPDR: u16 = 0x4E;
const ACSR: u16 = 0x50;
const MCUSR: u16 = 0x54;
const MCUCR: u16 = 0x55;
const SPMCSR: u16 = 0x57;
const RAMPZ: u16 = 0x5B;
const EIND: u16 = 0x5C;
const SPL: u16 = 0x5D;
const SPH: u16 = 0x5E;
const SREG: u16 = 0x5F;
const WDTCSR: u16 = 0x60;
const CLKPR: u16 = 0x61;
const PRR0: u16 = 0x64;
const PRR1: u16 = 0x65;
const TIMSK0: u16 = 0x6E;
const TIMSK1: u16 = 0x6F;
const TIMSK2: u16 = 0x70;
const TCCR1A: u16 = 0x80;
const TCCR1B: u16 = 0x81;
const TCCR1C: u16 = 0x82;
const TCNT1L: u16 = 0x84;
const TCNT1H: u16 = 0x85;
const ICR1L: u16 = 0x86;
const ICR1H: u16 = 0x87;
const OCR1AL: u16 = 0x88;
const OCR1AH: u16 = 0x89;
const OCR1BL: u16 = 0x8A;
const OCR1BH: u16 = 0x8B;
const OCR1CL: u16 = 0x8C;
const OCR1CH: u16 = 0x8D;
const TCCR2A: u16 = 0xB0;
const TCCR2B: u16 = 0xB1;
const TCNT2: u16 = 0xB2;
const OCR2A: u16 = 0xB3;
const OCR2B: u16 = 0xB4;
const ASSR: u16 = 0xB6;
const UCSR0A: u16 = 0xC0;
const UCSR0B: u16 = 0xC1;
const UCSR0C: u16 = 0xC2;
const UBRR0L: u16 = 0xC4;
const UBRR0H: u16 = 0xC5;
const UDR0: u16 = 0xC6;
const PINH: u16 = 0x100;
const DDRH: u16 = 0x101;
const PORTH: u16 = 0x102;
const PINJ: u16 = 0x103;
const DDRJ: u16 = 0x104;
const PORTJ: u16 = 0x105;
const PINK: u16 = 0x106;
const DDRK: u16 = 0x107;
const PORTK: u16 = 0x108;
const PINL: u16 = 0x109;
const DDRL: u16 = 0x10A;
const PORTL: u16 = 0x10B;

// PRR0 bits gating the timers.
const PRTIM0: u8 = 5;
const PRTIM1: u8 = 3;
const PRTIM2: u8 = 6;

// SPMCSR bits.
const SPMIE: u8 = 7;
const SPMEN: u8 = 0;

// Vector indices (0 = the first vector after reset).
const WDT_VECT: u8 = 11;
const TIMER2_COMPA_VECT: u8 = 12;
const TIMER2_COMPB_VECT: u8 = 13;
const TIMER2_OVF_VECT: u8 = 14;
const TIMER1_CAPT_VECT: u8 = 15;
const TIMER1_COMPA_VECT: u8 = 16;
const TIMER1_COMPB_VECT: u8 = 17;
const TIMER1_COMPC_VECT: u8 = 18;
const TIMER1_OVF_VECT: u8 = 19;
const TIMER0_COMPA_VECT: u8 = 20;
const TIMER0_COMPB_VECT: u8 = 21;
const TIMER0_OVF_VECT: u8 = 22;
const SPM_READY_VECT: u8 = 56;

/// ATmega2560 behaviour.
pub struct M2560 {
    spmcsr_buf: u8,
    spmen_cycles: u8,
    spmen_clear: bool,
}

pub fn init() -> (Mcu, Box<dyn Model>) {
    let geo = Geometry {
        pc_bits: 17,
        freq: 1_000_000,
        freq_max: 16_000_000,
        flashend: 0x3FFFF,
        ramstart: 0x200,
        ramend: 0x21FF,
        e2end: 0xFFF,
        spm_pagesize: 256,
    };
    let mut mcu = base_mcu("ATmega2560", [0x1E, 0x98, 0x01], &geo);
    mcu.ioregs_num = 480;

    mcu.spmcsr = Some(SPMCSR);
    mcu.rampz = Some(RAMPZ);
    mcu.eind = Some(EIND);
    mcu.fuse = [0x62, 0x99, 0xFF];
    mcu.bls = Bootloader {
        start: 0x3E000,
        end: 0x3FFFF,
        size: 8192,
    };
    mcu.intr = Interrupts::new(0x0000, 0x0002, 2);

    set_ioregs(
        &mut mcu,
        &[
            (PINA, "PINA", 0x00, 0xFF),
            (DDRA, "DDRA", 0x00, 0xFF),
            (PORTA, "PORTA", 0x00, 0xFF),
            (PINB, "PINB", 0x00, 0xFF),
            (DDRB, "DDRB", 0x00, 0xFF),
            (PORTB, "PORTB", 0x00, 0xFF),
            (PINC, "PINC", 0x00, 0xFF),
            (DDRC, "DDRC", 0x00, 0xFF),
            (PORTC, "PORTC", 0x00, 0xFF),
            (PIND, "PIND", 0x00, 0xFF),
            (DDRD, "DDRD", 0x00, 0xFF),
            (PORTD, "PORTD", 0x00, 0xFF),
            (PINE, "PINE", 0x00, 0xFF),
            (DDRE, "DDRE", 0x00, 0xFF),
            (PORTE, "PORTE", 0x00, 0xFF),
            (PINF, "PINF", 0x00, 0xFF),
            (DDRF, "DDRF", 0x00, 0xFF),
            (PORTF, "PORTF", 0x00, 0xFF),
            (PING, "PING", 0x00, 0x3F),
            (DDRG, "DDRG", 0x00, 0x3F),
            (PORTG, "PORTG", 0x00, 0x3F),
            (TIFR0, "TIFR0", 0x00, 0x07),
            (TIFR1, "TIFR1", 0x00, 0x2F),
            (TIFR2, "TIFR2", 0x00, 0x07),
            (EECR, "EECR", 0x00, 0x3F),
            (EEDR, "EEDR", 0x00, 0xFF),
            (EEARL, "EEARL", 0x00, 0xFF),
            (EEARH, "EEARH", 0x00, 0x0F),
            (GTCCR, "GTCCR", 0x00, 0x83),
            (TCCR0A, "TCCR0A", 0x00, 0xF3),
            (TCCR0B, "TCCR0B", 0x00, 0xCF),
            (TCNT0, "TCNT0", 0x00, 0xFF),
            (OCR0A, "OCR0A", 0x00, 0xFF),
            (OCR0B, "OCR0B", 0x00, 0xFF),
            (SPCR, "SPCR", 0x00, 0xFF),
            (SPSR, "SPSR", 0x00, 0xFF),
            (SPDR, "SPDR", 0x00, 0xFF),
            (ACSR, "ACSR", 0x00, 0xFF),
            (MCUSR, "MCUSR", 0x00, 0x1F),
            (MCUCR, "MCUCR", 0x00, 0x93),
            (SPMCSR, "SPMCSR", 0x00, 0xFF),
            (RAMPZ, "RAMPZ", 0x00, 0x03),
            (EIND, "EIND", 0x00, 0x01),
            (SPL, "SPL", 0x00, 0xFF),
            (SPH, "SPH", 0x00, 0x3F),
            (SREG, "SREG", 0x00, 0xFF),
            (WDTCSR, "WDTCSR", 0x00, 0xFF),
            (CLKPR, "CLKPR", 0x00, 0x8F),
            (PRR0, "PRR0", 0x00, 0xEF),
            (PRR1, "PRR1", 0x00, 0x3F),
            (TIMSK0, "TIMSK0", 0x00, 0x07),
            (TIMSK1, "TIMSK1", 0x00, 0x2F),
            (TIMSK2, "TIMSK2", 0x00, 0x07),
            (TCCR1A, "TCCR1A", 0x00, 0xFF),
            (TCCR1B, "TCCR1B", 0x00, 0xDF),
            (TCCR1C, "TCCR1C", 0x00, 0xE0),
            (TCNT1L, "TCNT1L", 0x00, 0xFF),
            (TCNT1H, "TCNT1H", 0x00, 0xFF),
            (ICR1L, "ICR1L", 0x00, 0xFF),
            (ICR1H, "ICR1H", 0x00, 0xFF),
            (OCR1AL, "OCR1AL", 0x00, 0xFF),
            (OCR1AH, "OCR1AH", 0x00, 0xFF),
            (OCR1BL, "OCR1BL", 0x00, 0xFF),
            (OCR1BH, "OCR1BH", 0x00, 0xFF),
            (OCR1CL, "OCR1CL", 0x00, 0xFF),
            (OCR1CH, "OCR1CH", 0x00, 0xFF),
            (TCCR2A, "TCCR2A", 0x00, 0xF3),
            (TCCR2B, "TCCR2B", 0x00, 0xCF),
            (TCNT2, "TCNT2", 0x00, 0xFF),
            (OCR2A, "OCR2A", 0x00, 0xFF),
            (OCR2B, "OCR2B", 0x00, 0xFF),
            (ASSR, "ASSR", 0x00, 0x7F),
            (UCSR0A, "UCSR0A", 0x20, 0xFF),
            (UCSR0B, "UCSR0B", 0x00, 0xFF),
            (UCSR0C, "UCSR0C", 0x06, 0xFF),
            (UBRR0L, "UBRR0L", 0x00, 0xFF),
            (UBRR0H, "UBRR0H", 0x00, 0x0F),
            (UDR0, "UDR0", 0x00, 0xFF),
            (PINH, "PINH", 0x00, 0xFF),
            (DDRH, "DDRH", 0x00, 0xFF),
            (PORTH, "PORTH", 0x00, 0xFF),
            (PINJ, "PINJ", 0x00, 0xFF),
            (DDRJ, "DDRJ", 0x00, 0xFF),
            (PORTJ, "PORTJ", 0x00, 0xFF),
            (PINK, "PINK", 0x00, 0xFF),
            (DDRK, "DDRK", 0x00, 0xFF),
            (PORTK, "PORTK", 0x00, 0xFF),
            (PINL, "PINL", 0x00, 0xFF),
            (DDRL, "DDRL", 0x00, 0xFF),
            (PORTL, "PORTL", 0x00, 0xFF),
        ],
    );

    mcu.dm[SPL as usize] = (geo.ramend & 0xFF) as u8;
    mcu.dm[SPH as usize] = (geo.ramend >> 8) as u8;

    let port = |port, ddr, pin| IoPort {
        port: IoBit::byte(port),
        ddr: IoBit::byte(ddr),
        pin: IoBit::byte(pin),
    };
    mcu.ports = vec![
        port(PORTA, DDRA, PINA),
        port(PORTB, DDRB, PINB),
        port(PORTC, DDRC, PINC),
        port(PORTD, DDRD, PIND),
        port(PORTE, DDRE, PINE),
        port(PORTF, DDRF, PINF),
        port(PORTG, DDRG, PING),
        port(PORTH, DDRH, PINH),
        port(PORTJ, DDRJ, PINJ),
        port(PORTK, DDRK, PINK),
        port(PORTL, DDRL, PINL),
    ];

    mcu.timers = vec![timer0(), timer1(), timer2()];
    mcu.wdt = wdt();
    mcu.usart = usart();

    let model = M2560 {
        spmcsr_buf: 0,
        spmen_cycles: 0,
        spmen_clear: false,
    };

    (mcu, Box::new(model))
}

fn wgm_8bit(ocra: u16) -> [WgmMode; 16] {
    let rtop = [IoBit::byte(ocra), IoBit::none()];
    let mut wgm_op = [WgmMode::unused(); 16];
    wgm_op[0] = WgmMode::fixed(WgmKind::Normal, 8, 0xFF, UpdateAt::Immediate, UpdateAt::Max);
    wgm_op[1] = WgmMode::fixed(WgmKind::PcPwm, 8, 0xFF, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[2] = WgmMode::reg_top(WgmKind::Ctc, rtop, UpdateAt::Immediate, UpdateAt::Max);
    wgm_op[3] = WgmMode::fixed(WgmKind::FastPwm, 8, 0xFF, UpdateAt::Bottom, UpdateAt::Max);
    wgm_op[5] = WgmMode::reg_top(WgmKind::PcPwm, rtop, UpdateAt::Top, UpdateAt::Bottom);
    wgm_op[7] = WgmMode::reg_top(WgmKind::FastPwm, rtop, UpdateAt::Bottom, UpdateAt::Top);
    wgm_op
}

fn timer0() -> Timer {
    Timer {
        tcnt: [IoBit::byte(TCNT0), IoBit::none()],
        disabled: IoBit::bit(PRR0, PRTIM0),
        size: 8,
        scnt: 0,
        cnt_dir: CountDir::Up,
        cs: [
            IoBit::bit(TCCR0B, 0),
            IoBit::bit(TCCR0B, 1),
            IoBit::bit(TCCR0B, 2),
            IoBit::none(),
        ],
        cs_div: [0, 0, 3, 6, 8, 10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        presc: 1,
        wgm: [
            IoBit::bit(TCCR0A, 0),
            IoBit::bit(TCCR0A, 1),
            IoBit::bit(TCCR0B, 3),
            IoBit::none(),
        ],
        wgm_op: wgm_8bit(OCR0A),
        wgmi: None,
        icr: [IoBit::none(); 2],
        icp: IoBit::none(),
        ices: IoBit::none(),
        icpval: 0,
        iv_ovf: IntVec::new(
            IoBit::bit(TIMSK0, 0),
            IoBit::bit(TIFR0, 0),
            TIMER0_OVF_VECT,
        ),
        iv_ic: IntVec::none(),
        comp: vec![
            CompChan {
                ocr: [IoBit::byte(OCR0A), IoBit::none()],
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 7),
                ddp: IoBit::bit(DDRB, 7),
                com: IoBit::bits(TCCR0A, 6, 0x3, 2),
                com_op: com_op_8bit_8modes_chan_a(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK0, 1),
                    IoBit::bit(TIFR0, 1),
                    TIMER0_COMPA_VECT,
                ),
            },
            CompChan {
                ocr: [IoBit::byte(OCR0B), IoBit::none()],
                ocr_buf: 0,
                pin: IoBit::bit(PORTG, 5),
                ddp: IoBit::bit(DDRG, 5),
                com: IoBit::bits(TCCR0A, 4, 0x3, 2),
                com_op: com_op_8bit_8modes_chan_b(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK0, 2),
                    IoBit::bit(TIFR0, 2),
                    TIMER0_COMPB_VECT,
                ),
            },
        ],
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
        disabled: IoBit::bit(PRR0, PRTIM1),
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
        icp: IoBit::bit(PORTD, 4),
        ices: IoBit::bit(TCCR1B, 6),
        icpval: 0,
        iv_ovf: IntVec::new(
            IoBit::bit(TIMSK1, 0),
            IoBit::bit(TIFR1, 0),
            TIMER1_OVF_VECT,
        ),
        iv_ic: IntVec::new(
            IoBit::bit(TIMSK1, 5),
            IoBit::bit(TIFR1, 5),
            TIMER1_CAPT_VECT,
        ),
        comp: vec![
            CompChan {
                ocr: ocr1a,
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 5),
                ddp: IoBit::bit(DDRB, 5),
                com: IoBit::bits(TCCR1A, 6, 0x3, 2),
                com_op: com_op_16bit_chan_a(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK1, 1),
                    IoBit::bit(TIFR1, 1),
                    TIMER1_COMPA_VECT,
                ),
            },
            CompChan {
                ocr: [IoBit::byte(OCR1BL), IoBit::byte(OCR1BH)],
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 6),
                ddp: IoBit::bit(DDRB, 6),
                com: IoBit::bits(TCCR1A, 4, 0x3, 2),
                com_op: com_op_16bit_chan_b(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK1, 2),
                    IoBit::bit(TIFR1, 2),
                    TIMER1_COMPB_VECT,
                ),
            },
            CompChan {
                ocr: [IoBit::byte(OCR1CL), IoBit::byte(OCR1CH)],
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 7),
                ddp: IoBit::bit(DDRB, 7),
                com: IoBit::bits(TCCR1A, 2, 0x3, 2),
                com_op: com_op_16bit_chan_b(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK1, 3),
                    IoBit::bit(TIFR1, 3),
                    TIMER1_COMPC_VECT,
                ),
            },
        ],
    }
}

fn timer2() -> Timer {
    Timer {
        tcnt: [IoBit::byte(TCNT2), IoBit::none()],
        disabled: IoBit::bit(PRR0, PRTIM2),
        size: 8,
        scnt: 0,
        cnt_dir: CountDir::Up,
        cs: [
            IoBit::bit(TCCR2B, 0),
            IoBit::bit(TCCR2B, 1),
            IoBit::bit(TCCR2B, 2),
            IoBit::none(),
        ],
        cs_div: [0, 0, 3, 5, 6, 7, 8, 10, 0, 0, 0, 0, 0, 0, 0, 0],
        presc: 1,
        wgm: [
            IoBit::bit(TCCR2A, 0),
            IoBit::bit(TCCR2A, 1),
            IoBit::bit(TCCR2B, 3),
            IoBit::none(),
        ],
        wgm_op: wgm_8bit(OCR2A),
        wgmi: None,
        icr: [IoBit::none(); 2],
        icp: IoBit::none(),
        ices: IoBit::none(),
        icpval: 0,
        iv_ovf: IntVec::new(
            IoBit::bit(TIMSK2, 0),
            IoBit::bit(TIFR2, 0),
            TIMER2_OVF_VECT,
        ),
        iv_ic: IntVec::none(),
        comp: vec![
            CompChan {
                ocr: [IoBit::byte(OCR2A), IoBit::none()],
                ocr_buf: 0,
                pin: IoBit::bit(PORTB, 4),
                ddp: IoBit::bit(DDRB, 4),
                com: IoBit::bits(TCCR2A, 6, 0x3, 2),
                com_op: com_op_8bit_8modes_chan_a(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK2, 1),
                    IoBit::bit(TIFR2, 1),
                    TIMER2_COMPA_VECT,
                ),
            },
            CompChan {
                ocr: [IoBit::byte(OCR2B), IoBit::none()],
                ocr_buf: 0,
                pin: IoBit::bit(PORTH, 6),
                ddp: IoBit::bit(DDRH, 6),
                com: IoBit::bits(TCCR2A, 4, 0x3, 2),
                com_op: com_op_8bit_8modes_chan_b(),
                iv: IntVec::new(
                    IoBit::bit(TIMSK2, 2),
                    IoBit::bit(TIFR2, 2),
                    TIMER2_COMPB_VECT,
                ),
            },
        ],
    }
}

fn wdt() -> Wdt {
    let mut w = Wdt::none();
    w.wdton = Some((FUSE_HIGH, 4));
    w.wde = IoBit::bit(WDTCSR, 3);
    w.wdie = IoBit::bit(WDTCSR, 6);
    w.ce = IoBit::bit(WDTCSR, 4);
    w.oscf = 128_000;
    w.wdp = [
        IoBit::bit(WDTCSR, 0),
        IoBit::bit(WDTCSR, 1),
        IoBit::bit(WDTCSR, 2),
        IoBit::bit(WDTCSR, 5),
    ];
    w.wdp_op[..10].copy_from_slice(&[2, 4, 8, 16, 32, 64, 128, 256, 512, 1024]);
    w.iv_tout = IntVec::new(IoBit::bit(WDTCSR, 6), IoBit::bit(WDTCSR, 7), WDT_VECT);
    w
}

fn usart() -> Usart {
    let mut u = Usart::none();
    u.regs = Some(UsartRegs {
        udr: UDR0,
        ubrrl: UBRR0L,
        ubrrh: UBRR0H,
        ucsra: UCSR0A,
        ucsrb: UCSR0B,
        ucsrc: UCSR0C,
        shared_ubrrh_ucsrc: false,
    });
    u.shadow = UsartShadow {
        ubrrh: 0,
        ubrrl: 0,
        ucsra: 0x20,
        ucsrc: 0x06,
        udr: 0,
    };
    u
}

impl Model for M2560 {
    fn set_fuse(&mut self, mcu: &mut Mcu, fuse: usize, val: u8) {
        if fuse > FUSE_EXT {
            log::error!("fuse #{} is not supported by {}", fuse, mcu.name);
            return;
        }
        mcu.fuse[fuse] = val;

        match fuse {
            FUSE_LOW => {
                let cksel = val & 0x0F;
                match cksel {
                    0 => mcu.clk_source = ClkSource::External,
                    2 => {
                        mcu.clk_source = ClkSource::InternalRc;
                        mcu.freq = 8_000_000;
                    }
                    3 => {
                        mcu.clk_source = ClkSource::InternalRc;
                        mcu.freq = 128_000;
                    }
                    4 | 5 => {
                        mcu.clk_source = ClkSource::LowFreqCrystal;
                        mcu.freq = 32_768;
                    }
                    _ => {
                        mcu.clk_source = ClkSource::Crystal;
                        mcu.freq = 16_000_000;
                    }
                }
                if (val >> 7) & 1 == 0 {
                    mcu.freq /= 8;
                }
            }
            FUSE_HIGH => {
                let bootsz = (val >> 1) & 0x3;
                let (start, size) = match bootsz {
                    3 => (0x3FC00, 1024),
                    2 => (0x3F800, 2048),
                    1 => (0x3F000, 4096),
                    _ => (0x3E000, 8192),
                };
                mcu.bls = Bootloader {
                    start,
                    end: 0x3FFFF,
                    size,
                };

                if val & 1 == 1 {
                    mcu.intr.reset_pc = 0x0000;
                    mcu.pc = 0x0000;
                } else {
                    mcu.intr.reset_pc = mcu.bls.start >> 1;
                    mcu.pc = mcu.bls.start >> 1;
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

        if let Some(spmcsr) = mcu.spmcsr {
            if self.spmen_clear {
                if self.spmen_cycles == 0 {
                    self.spmen_clear = false;
                    self.reset_spm(mcu);
                } else {
                    self.spmen_cycles -= 1;
                }
            }
            let cur = mcu.dm[spmcsr as usize];
            if (self.spmcsr_buf >> SPMEN) & 1 == 0 && (cur >> SPMEN) & 1 == 1 {
                self.spmen_cycles = 4;
                self.spmen_clear = true;
            }
            self.spmcsr_buf = cur;
        }

        mcu.update_usart_shadow();
    }

    fn reset_spm(&mut self, mcu: &mut Mcu) {
        if let Some(spmcsr) = mcu.spmcsr {
            mcu.dm[spmcsr as usize] &= !(1 << SPMEN);
            if (mcu.dm[spmcsr as usize] >> SPMIE) & 1 == 1 {
                mcu.intr.request(SPM_READY_VECT);
            }
        }
    }
}
