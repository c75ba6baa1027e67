//! GDB remote serial protocol server
//!
//! A TCP listener serving one GDB client at a time. Packets are
//! `$<payload>#<checksum>` with the usual `}`-escape for reserved
//! bytes; a lone 0x03 is an out-of-band break request.
//!
//! GDB's flat address space is split the avr-gdb way: addresses below
//! 0x800000 are flash (byte-addressed, words little-endian), the
//! 0x800000 window is data memory and the 0x810000 window is EEPROM
//! (stubbed, answers `E01`).
//!
//! While the MCU is stopped the server blocks on the socket between
//! packets; while it is running only the break byte is honored, polled
//! non-blockingly from the simulation loop.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use crate::avr::decoder::is_32bit;
use crate::avr::{Mcu, McuState};

/// The BREAK opcode, as little-endian bytes in flash.
const BREAK_LOW: u8 = 0x98;
const BREAK_HIGH: u8 = 0x95;
const BREAK_OPCODE: u16 = ((BREAK_HIGH as u16) << 8) | BREAK_LOW as u16;

/// Maximum packet size advertised through qSupported.
const PACKET_SIZE: usize = 16 * 1024;

const HEXCHARS: &[u8; 16] = b"0123456789ABCDEF";

/// One received RSP packet (raw payload, before unescaping).
struct Packet {
    data: Vec<u8>,
}

impl Packet {
    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.data).unwrap_or("")
    }
}

/// GDB RSP server state.
pub struct RspServer {
    listener: TcpListener,
    client: Option<TcpStream>,
    /// The client issued a continue/step and waits for a stop reply.
    client_waiting: bool,
    /// Signal reported for any stop (TRAP).
    sigval: u8,
}

impl RspServer {
    /// Bind the listener. The port must stay clear of the reserved
    /// range; the configuration parser enforces that.
    pub fn start(port: u16) -> io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)?;
        log::info!("waiting for incoming GDB connections at localhost:{}", port);
        Ok(Self {
            listener,
            client: None,
            client_waiting: false,
            sigval: 5, // TRAP
        })
    }

    /// Serve one packet while the MCU is stopped. Blocks until a
    /// client is connected and a packet (or break byte) arrives.
    pub fn handle(&mut self, mcu: &mut Mcu) -> io::Result<()> {
        if self.client.is_none() {
            self.listener.set_nonblocking(false)?;
            let (stream, peer) = self.listener.accept()?;
            stream.set_nodelay(true)?;
            log::info!("GDB client connected: {}", peer);
            self.client = Some(stream);
        }

        // Report the stop that ended the last continue/step.
        if self.client_waiting {
            self.put_str_packet(&format!("S{:02X}", self.sigval))?;
            self.client_waiting = false;
        }

        if let Some(stream) = self.client.as_mut() {
            stream.set_nonblocking(false)?;
        }
        match self.get_packet()? {
            Some(packet) => self.dispatch(mcu, &packet),
            None => {
                log::info!("GDB client disconnected");
                self.client = None;
                Ok(())
            }
        }
    }

    /// Non-blocking check while the MCU is running: honor the break
    /// byte, turn everything else away with a console message.
    pub fn poll_running(&mut self, mcu: &mut Mcu) {
        if self.client.is_none() {
            self.listener.set_nonblocking(true).ok();
            if let Ok((stream, peer)) = self.listener.accept() {
                stream.set_nodelay(true).ok();
                log::info!("GDB client connected: {}", peer);
                self.client = Some(stream);
            } else {
                return;
            }
        }

        let Some(stream) = self.client.as_mut() else {
            return;
        };
        if stream.set_nonblocking(true).is_err() {
            return;
        }

        let mut buf = [0u8; 256];
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("GDB client disconnected");
                self.client = None;
                return;
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(_) => {
                self.client = None;
                return;
            }
        };

        if buf[..n].contains(&0x03) {
            mcu.state = McuState::Stopped;
            return;
        }
        if buf[..n].contains(&b'$') {
            // Ack the packet and explain why it is ignored.
            let _ = self.put_ack();
            let msg = "MCU is running, only an interrupt request is handled\r\n";
            let mut reply = String::from("O");
            for b in msg.bytes() {
                reply.push(HEXCHARS[(b >> 4) as usize] as char);
                reply.push(HEXCHARS[(b & 0x0F) as usize] as char);
            }
            let _ = self.put_str_packet(&reply);
            log::warn!("GDB command received while the MCU is running");
        }
    }

    /// Close the client connection.
    pub fn close_client(&mut self) {
        self.client = None;
    }

    // ========== Command dispatch ==========

    fn dispatch(&mut self, mcu: &mut Mcu, packet: &Packet) -> io::Result<()> {
        let data = packet.as_str();
        match packet.data.first().copied() {
            Some(0x03) => {
                log::warn!("break command received (MCU stopped)");
                Ok(())
            }
            Some(b'!') => self.put_str_packet("OK"),
            Some(b'?') => {
                let sig = format!("S{:02X}", self.sigval);
                self.put_str_packet(&sig)
            }
            Some(b'c') | Some(b'C') => {
                // Continue, with an optional resume address in bytes.
                if let Some(addr) = parse_hex_after(data, 1) {
                    mcu.pc = (addr >> 1) as u32;
                }
                mcu.state = McuState::Running;
                self.client_waiting = true;
                Ok(())
            }
            Some(b'D') => {
                self.put_str_packet("OK")?;
                self.close_client();
                Ok(())
            }
            Some(b'g') => self.read_all_regs(mcu),
            Some(b'G') => self.write_all_regs(mcu, data),
            Some(b'H') => self.put_str_packet("OK"),
            Some(b'k') => {
                mcu.state = McuState::SimStop;
                Ok(())
            }
            Some(b'm') => self.read_mem(mcu, data),
            Some(b'M') => self.write_mem(mcu, packet),
            Some(b'p') => self.read_reg(mcu, data),
            Some(b'P') => self.write_reg(mcu, data),
            Some(b'q') => self.query(data),
            Some(b'R') => {
                restart(mcu);
                Ok(())
            }
            Some(b's') | Some(b'S') => {
                mcu.state = McuState::Step;
                self.client_waiting = true;
                Ok(())
            }
            Some(b'v') => self.vpacket(mcu, data),
            Some(b'X') => self.write_mem_bin(mcu, packet),
            Some(b'z') => self.remove_matchpoint(mcu, data),
            Some(b'Z') => self.insert_matchpoint(mcu, data),
            _ => {
                log::warn!("unknown RSP request: {}", data);
                Ok(())
            }
        }
    }

    fn query(&mut self, data: &str) -> io::Result<()> {
        if data == "qC" {
            // No thread concept: empty keeps the previous selection.
            self.put_str_packet("")
        } else if data == "qOffsets" {
            self.put_str_packet("Text=0;Data=0;Bss=0")
        } else if data.starts_with("qSupported") {
            self.put_str_packet(&format!("PacketSize={:X}", PACKET_SIZE))
        } else if data.starts_with("qSymbol:") {
            self.put_str_packet("OK")
        } else if data.starts_with("qTStatus") || data.starts_with("qAttached") {
            self.put_str_packet("")
        } else if data.starts_with("qfThreadInfo") {
            self.put_str_packet("m-1")
        } else if data.starts_with("qsThreadInfo") {
            self.put_str_packet("l")
        } else {
            log::warn!("unrecognized RSP query: {}", data);
            self.put_str_packet("")
        }
    }

    fn vpacket(&mut self, mcu: &mut Mcu, data: &str) -> io::Result<()> {
        if data.starts_with("vAttach;") {
            self.put_str_packet(&format!("S{:02X}", self.sigval))
        } else if data == "vCont?" {
            self.put_str_packet("")
        } else if data.starts_with("vCont") {
            log::warn!("RSP vCont is not supported: ignored");
            Ok(())
        } else if data.starts_with("vRun;") {
            // Restart, reporting a stop as if the program just trapped.
            restart(mcu);
            self.put_str_packet(&format!("S{:02X}", self.sigval))
        } else if data.starts_with("vKill;") {
            mcu.state = McuState::SimStop;
            self.put_str_packet("OK")
        } else {
            log::warn!("unknown RSP 'v' packet: {}", data);
            self.put_str_packet("E01")
        }
    }

    // ========== Registers ==========

    /// Registers are numbered the avr-gdb way: 0..31 are the GPRs,
    /// 32 is SREG, 33 is SP (SPL then SPH on the wire) and 34 is the
    /// PC in bytes, four bytes little-endian.
    fn reg_value(mcu: &Mcu, n: usize) -> String {
        match n {
            0..=31 => format!("{:02X}", mcu.dm[n]),
            32 => format!("{:02X}", mcu.sreg_byte()),
            33 => format!(
                "{:02X}{:02X}",
                mcu.dm[mcu.spl as usize], mcu.dm[mcu.sph as usize]
            ),
            34 => {
                let b = mcu.pc << 1;
                format!(
                    "{:02X}{:02X}{:02X}00",
                    b & 0xFF,
                    (b >> 8) & 0xFF,
                    (b >> 16) & 0xFF
                )
            }
            _ => String::new(),
        }
    }

    /// Write one register from its wire encoding. Returns the number
    /// of hex digits consumed.
    fn set_reg_value(mcu: &mut Mcu, n: usize, hex: &str) -> usize {
        match n {
            0..=31 => {
                if let Some(v) = hex_bytes_le(hex, 1) {
                    mcu.dm[n] = v as u8;
                }
                2
            }
            32 => {
                if let Some(v) = hex_bytes_le(hex, 1) {
                    mcu.set_sreg_byte(v as u8);
                }
                2
            }
            33 => {
                if let Some(v) = hex_bytes_le(hex, 2) {
                    mcu.dm[mcu.spl as usize] = v as u8;
                    mcu.dm[mcu.sph as usize] = (v >> 8) as u8;
                }
                4
            }
            34 => {
                if let Some(v) = hex_bytes_le(hex, 4) {
                    mcu.pc = (v >> 1) as u32;
                }
                8
            }
            _ => 0,
        }
    }

    fn read_all_regs(&mut self, mcu: &Mcu) -> io::Result<()> {
        let mut reply = String::new();
        for n in 0..35 {
            reply.push_str(&Self::reg_value(mcu, n));
        }
        self.put_str_packet(&reply)
    }

    fn write_all_regs(&mut self, mcu: &mut Mcu, data: &str) -> io::Result<()> {
        let mut off = 1;
        for n in 0..35 {
            if off > data.len() {
                break;
            }
            off += Self::set_reg_value(mcu, n, &data[off..]);
        }
        self.put_str_packet("OK")
    }

    fn read_reg(&mut self, mcu: &Mcu, data: &str) -> io::Result<()> {
        match parse_hex_after(data, 1) {
            Some(n) if n <= 34 => {
                let reply = Self::reg_value(mcu, n as usize);
                self.put_str_packet(&reply)
            }
            _ => {
                log::error!("failed to recognize RSP read register command: {}", data);
                self.put_str_packet("E01")
            }
        }
    }

    fn write_reg(&mut self, mcu: &mut Mcu, data: &str) -> io::Result<()> {
        let Some(eq) = data.find('=') else {
            log::error!("failed to recognize RSP write register command: {}", data);
            return self.put_str_packet("E01");
        };
        let Some(n) = parse_hex_str(&data[1..eq]) else {
            return self.put_str_packet("E01");
        };
        if n > 34 {
            return self.put_str_packet("E01");
        }
        Self::set_reg_value(mcu, n as usize, &data[eq + 1..]);
        self.put_str_packet("OK")
    }

    // ========== Memory ==========

    fn read_mem(&mut self, mcu: &mut Mcu, data: &str) -> io::Result<()> {
        let Some((addr, len)) = parse_addr_len(&data[1..]) else {
            log::error!("failed to recognize RSP read memory command: {}", data);
            return self.put_str_packet("E01");
        };
        let addr = (addr & 0x00FF_FFFF) as u32;
        let len = len.min((PACKET_SIZE - 1) / 2);

        let mut bytes = Vec::with_capacity(len);
        if addr < mcu.flashend {
            for i in 0..len as u32 {
                bytes.push(mcu.pm_read_byte(addr + i));
            }
        } else if (0x800000..=0x800000 + mcu.ramend).contains(&addr) {
            let base = (addr - 0x800000) as usize;
            for i in 0..len {
                bytes.push(mcu.dm.get(base + i).copied().unwrap_or(0));
            }
        } else if addr == 0x800000 + mcu.ramend + 1 && len == 2 {
            return self.put_str_packet("0000");
        } else if addr >= 0x810000 && (addr - 0x810000) <= mcu.e2end {
            // EEPROM window, no storage behind it.
            return self.put_str_packet("E01");
        } else {
            log::error!("unable to read memory 0x{:08X}, 0x{:08X}", addr, len);
            return self.put_str_packet("E01");
        }

        let mut reply = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            reply.push(HEXCHARS[(b >> 4) as usize] as char);
            reply.push(HEXCHARS[(b & 0x0F) as usize] as char);
        }
        self.put_str_packet(&reply)
    }

    fn write_mem(&mut self, mcu: &mut Mcu, packet: &Packet) -> io::Result<()> {
        let data = packet.as_str();
        let Some(colon) = data.find(':') else {
            return self.put_str_packet("E01");
        };
        let Some((addr, len)) = parse_addr_len(&data[1..colon]) else {
            log::error!("failed to recognize RSP write memory command: {}", data);
            return self.put_str_packet("E01");
        };
        let hex = &data[colon + 1..];
        if hex.len() != len * 2 {
            log::warn!(
                "write of {} digits requested, but {} digits supplied: request ignored",
                len * 2,
                hex.len()
            );
            return self.put_str_packet("E01");
        }

        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            let Some(b) = parse_hex_str(&hex[i * 2..i * 2 + 2]) else {
                return self.put_str_packet("E01");
            };
            bytes.push(b as u8);
        }

        self.store_mem(mcu, addr as u32, &bytes)
    }

    fn write_mem_bin(&mut self, mcu: &mut Mcu, packet: &Packet) -> io::Result<()> {
        let Some(colon) = packet.data.iter().position(|&b| b == b':') else {
            return self.put_str_packet("E01");
        };
        let header = std::str::from_utf8(&packet.data[1..colon]).unwrap_or("");
        let Some((addr, len)) = parse_addr_len(header) else {
            log::error!("failed to recognize RSP write memory command");
            return self.put_str_packet("E01");
        };

        let mut bytes = unescape(&packet.data[colon + 1..]);
        if bytes.len() != len {
            log::warn!(
                "write of {} bytes requested, but {} bytes supplied",
                len,
                bytes.len()
            );
            bytes.truncate(len);
        }

        self.store_mem(mcu, addr as u32, &bytes)
    }

    fn store_mem(&mut self, mcu: &mut Mcu, addr: u32, bytes: &[u8]) -> io::Result<()> {
        let addr = addr & 0x00FF_FFFF;
        if addr < mcu.flashend {
            for (i, &b) in bytes.iter().enumerate() {
                mcu.pm_write_byte(addr + i as u32, b);
            }
        } else if (0x800000..=0x800000 + mcu.ramend).contains(&addr) {
            let base = (addr - 0x800000) as usize;
            for (i, &b) in bytes.iter().enumerate() {
                if let Some(slot) = mcu.dm.get_mut(base + i) {
                    *slot = b;
                }
            }
        } else if addr >= 0x810000 && (addr - 0x810000) <= mcu.e2end {
            return self.put_str_packet("E01");
        } else {
            log::error!(
                "unable to write memory 0x{:08X}, 0x{:08X}",
                addr,
                bytes.len()
            );
            return self.put_str_packet("E01");
        }
        self.put_str_packet("OK")
    }

    // ========== Breakpoints ==========

    fn insert_matchpoint(&mut self, mcu: &mut Mcu, data: &str) -> io::Result<()> {
        let Some((ty, addr, _len)) = parse_matchpoint(data) else {
            log::error!("RSP matchpoint insertion request not recognized: {}", data);
            return self.put_str_packet("E01");
        };
        if ty != 0 {
            // Only software breakpoints are supported.
            log::warn!("RSP matchpoint type {} is not supported", ty);
            return self.put_str_packet("");
        }

        let llsb = mcu.pm_read_byte(addr);
        let lmsb = mcu.pm_read_byte(addr + 1);
        let inst = (llsb as u16) | ((lmsb as u16) << 8);

        if inst == BREAK_OPCODE {
            // Re-inserting at the same spot changes nothing.
            log::warn!("BREAK is already at 0x{:08X}, ignoring", addr);
            return self.put_str_packet("OK");
        }

        mcu.pm_write_byte(addr, BREAK_LOW);
        mcu.pm_write_byte(addr + 1, BREAK_HIGH);
        mcu.mpm_write_byte(addr, llsb);
        mcu.mpm_write_byte(addr + 1, lmsb);

        // A displaced 32-bit instruction takes its second word along.
        if is_32bit(inst) {
            let hlsb = mcu.pm_read_byte(addr + 2);
            let hmsb = mcu.pm_read_byte(addr + 3);
            mcu.pm_write_byte(addr + 2, 0);
            mcu.pm_write_byte(addr + 3, 0);
            mcu.mpm_write_byte(addr + 2, hlsb);
            mcu.mpm_write_byte(addr + 3, hmsb);
        }

        self.put_str_packet("OK")
    }

    fn remove_matchpoint(&mut self, mcu: &mut Mcu, data: &str) -> io::Result<()> {
        let Some((ty, addr, _len)) = parse_matchpoint(data) else {
            log::error!("RSP matchpoint removal request not recognized: {}", data);
            return self.put_str_packet("E01");
        };
        if ty != 0 {
            log::warn!("RSP matchpoint type {} is not supported", ty);
            return self.put_str_packet("");
        }

        let llsb = mcu.pm_read_byte(addr);
        let lmsb = mcu.pm_read_byte(addr + 1);
        let inst = (llsb as u16) | ((lmsb as u16) << 8);
        if inst != BREAK_OPCODE {
            log::error!("there is no BREAK at 0x{:08X}, ignoring", addr);
            return self.put_str_packet("E01");
        }

        let llsb = mcu.mpm_read_byte(addr);
        let lmsb = mcu.mpm_read_byte(addr + 1);
        mcu.pm_write_byte(addr, llsb);
        mcu.pm_write_byte(addr + 1, lmsb);

        let orig = (llsb as u16) | ((lmsb as u16) << 8);
        if is_32bit(orig) {
            mcu.pm_write_byte(addr + 2, mcu.mpm_read_byte(addr + 2));
            mcu.pm_write_byte(addr + 3, mcu.mpm_read_byte(addr + 3));
        }

        self.put_str_packet("OK")
    }

    // ========== Transport ==========

    fn put_ack(&mut self) -> io::Result<()> {
        if let Some(stream) = self.client.as_mut() {
            stream.write_all(b"+")?;
        }
        Ok(())
    }

    fn put_str_packet(&mut self, payload: &str) -> io::Result<()> {
        self.put_packet(payload.as_bytes())
    }

    /// Frame and send a packet, retrying until the client acks it.
    fn put_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut framed = Vec::with_capacity(payload.len() + 4);
        let mut checksum: u8 = 0;
        framed.push(b'$');
        for &b in payload {
            if matches!(b, b'$' | b'#' | b'*' | b'}') {
                framed.push(b'}');
                checksum = checksum.wrapping_add(b'}');
                framed.push(b ^ 0x20);
                checksum = checksum.wrapping_add(b ^ 0x20);
            } else {
                framed.push(b);
                checksum = checksum.wrapping_add(b);
            }
        }
        framed.push(b'#');
        framed.push(HEXCHARS[(checksum >> 4) as usize]);
        framed.push(HEXCHARS[(checksum & 0x0F) as usize]);

        loop {
            let Some(stream) = self.client.as_mut() else {
                return Ok(());
            };
            stream.set_nonblocking(false)?;
            stream.write_all(&framed)?;

            match self.get_byte()? {
                Some(b'+') => return Ok(()),
                Some(_) => continue,
                None => {
                    self.client = None;
                    return Ok(());
                }
            }
        }
    }

    fn get_byte(&mut self) -> io::Result<Option<u8>> {
        let Some(stream) = self.client.as_mut() else {
            return Ok(None);
        };
        let mut buf = [0u8; 1];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read packets until one arrives with a valid checksum. Returns
    /// `None` when the connection closed.
    fn get_packet(&mut self) -> io::Result<Option<Packet>> {
        loop {
            // Wait for the start character, treating a bare 0x03 as a
            // complete break pseudo-packet.
            let mut ch = match self.get_byte()? {
                Some(c) => c,
                None => return Ok(None),
            };
            while ch != b'$' {
                if ch == 0x03 {
                    return Ok(Some(Packet { data: vec![0x03] }));
                }
                ch = match self.get_byte()? {
                    Some(c) => c,
                    None => return Ok(None),
                };
            }

            let mut data = Vec::new();
            let mut checksum: u8 = 0;
            loop {
                let b = match self.get_byte()? {
                    Some(c) => c,
                    None => return Ok(None),
                };
                if b == b'$' {
                    // Start-of-packet in the middle: begin again.
                    data.clear();
                    checksum = 0;
                    continue;
                }
                if b == b'#' {
                    break;
                }
                if data.len() >= PACKET_SIZE - 1 {
                    log::warn!("RSP packet overran the buffer");
                    break;
                }
                checksum = checksum.wrapping_add(b);
                data.push(b);
            }

            let hi = match self.get_byte()? {
                Some(c) => c,
                None => return Ok(None),
            };
            let lo = match self.get_byte()? {
                Some(c) => c,
                None => return Ok(None),
            };
            let sent = (hex_digit(hi).unwrap_or(0) << 4) | hex_digit(lo).unwrap_or(0);

            if checksum == sent {
                if let Some(stream) = self.client.as_mut() {
                    stream.write_all(b"+")?;
                }
                return Ok(Some(Packet { data }));
            }
            log::warn!(
                "bad RSP checksum: computed 0x{:02X}, received 0x{:02X}",
                checksum,
                sent
            );
            if let Some(stream) = self.client.as_mut() {
                stream.write_all(b"-")?;
            }
        }
    }
}

/// Reset to the configured reset vector, stopped.
fn restart(mcu: &mut Mcu) {
    mcu.pc = mcu.intr.reset_pc;
    mcu.state = McuState::Stopped;
}

// ========== Wire format helpers ==========

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn parse_hex_str(s: &str) -> Option<usize> {
    if s.is_empty() {
        return None;
    }
    usize::from_str_radix(s, 16).ok()
}

/// Parse the hex run starting at `from`, if any.
fn parse_hex_after(s: &str, from: usize) -> Option<usize> {
    let rest = s.get(from..)?;
    let end = rest
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(rest.len());
    parse_hex_str(&rest[..end])
}

/// Parse `<addr>,<len>`.
fn parse_addr_len(s: &str) -> Option<(usize, usize)> {
    let comma = s.find(',')?;
    let addr = parse_hex_str(&s[..comma])?;
    let len = parse_hex_str(s[comma + 1..].trim_end_matches(':'))?;
    Some((addr, len))
}

/// Parse `Z<type>,<addr>,<len>` / `z<type>,<addr>,<len>`.
fn parse_matchpoint(s: &str) -> Option<(u8, u32, u32)> {
    let mut parts = s[1..].split(',');
    let ty = parts.next()?.parse::<u8>().ok()?;
    let addr = parse_hex_str(parts.next()?)? as u32;
    let len = parse_hex_str(parts.next()?)? as u32;
    Some((ty, addr, len))
}

/// Little-endian value of `n` wire bytes (2 hex digits each).
fn hex_bytes_le(s: &str, n: usize) -> Option<u64> {
    let mut v = 0u64;
    for i in 0..n {
        let byte = parse_hex_str(s.get(i * 2..i * 2 + 2)?)? as u64;
        v |= byte << (8 * i);
    }
    Some(v)
}

/// Undo RSP binary escaping: `}` followed by the byte xor 0x20.
fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'}' && i + 1 < data.len() {
            out.push(data[i + 1] ^ 0x20);
            i += 2;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Apply RSP binary escaping, the inverse of `unescape`.
#[cfg(test)]
fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if matches!(b, b'$' | b'#' | b'*' | b'}') {
            out.push(b'}');
            out.push(b ^ 0x20);
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avr::models;

    #[test]
    fn test_escape_roundtrip() {
        let payloads: [&[u8]; 4] = [
            b"plain data",
            b"with } brace",
            b"$#*}",
            &[0x00, 0x7D, 0x5D, 0x03, 0x24],
        ];
        for p in payloads {
            assert_eq!(unescape(&escape(p)), p);
        }
    }

    #[test]
    fn test_addr_len_parsing() {
        assert_eq!(parse_addr_len("800100,40"), Some((0x800100, 0x40)));
        assert_eq!(parse_addr_len("1f,2:"), Some((0x1F, 2)));
        assert_eq!(parse_addr_len("zz,2"), None);
        assert_eq!(parse_addr_len("12"), None);
    }

    #[test]
    fn test_matchpoint_parsing() {
        assert_eq!(parse_matchpoint("Z0,40,2"), Some((0, 0x40, 2)));
        assert_eq!(parse_matchpoint("z1,1f00,2"), Some((1, 0x1F00, 2)));
        assert_eq!(parse_matchpoint("Z0,40"), None);
    }

    #[test]
    fn test_reg_wire_format() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        for i in 0..32 {
            mcu.dm[i] = i as u8;
        }
        mcu.set_sreg_byte(0x80);
        mcu.dm[mcu.spl as usize] = 0x5F;
        mcu.dm[mcu.sph as usize] = 0x04;
        mcu.pc = 0x0100; // word address

        assert_eq!(RspServer::reg_value(&mcu, 0), "00");
        assert_eq!(RspServer::reg_value(&mcu, 16), "10");
        assert_eq!(RspServer::reg_value(&mcu, 32), "80");
        assert_eq!(RspServer::reg_value(&mcu, 33), "5F04");
        // PC on the wire is in bytes: 0x0100 << 1 = 0x0200.
        assert_eq!(RspServer::reg_value(&mcu, 34), "00020000");

        let mut reply = String::new();
        for n in 0..35 {
            reply.push_str(&RspServer::reg_value(&mcu, n));
        }
        assert_eq!(reply.len(), 78);
    }

    #[test]
    fn test_reg_wire_write() {
        let (mut mcu, _) = models::init("m8a").unwrap();

        RspServer::set_reg_value(&mut mcu, 16, "7F");
        assert_eq!(mcu.dm[16], 0x7F);

        RspServer::set_reg_value(&mut mcu, 33, "5F04");
        assert_eq!(mcu.dm[mcu.spl as usize], 0x5F);
        assert_eq!(mcu.dm[mcu.sph as usize], 0x04);

        RspServer::set_reg_value(&mut mcu, 34, "00020000");
        assert_eq!(mcu.pc, 0x0100);
    }

    #[test]
    fn test_breakpoint_roundtrip_16bit() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        // RJMP .-2 at word 0x20 (byte address 0x40).
        mcu.pm[0x20] = 0xCFFF;

        // Port 0 picks a free port; replies are dropped without a client.
        let mut srv = RspServer::start(0).unwrap();

        srv.insert_matchpoint(&mut mcu, "Z0,40,2").unwrap();
        assert_eq!(mcu.pm[0x20], BREAK_OPCODE);
        assert_eq!(mcu.mpm[0x20], 0xCFFF);

        srv.remove_matchpoint(&mut mcu, "z0,40,2").unwrap();
        assert_eq!(mcu.pm[0x20], 0xCFFF);
    }

    #[test]
    fn test_breakpoint_roundtrip_32bit() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        // JMP 0x40 at word 0x20: a 32-bit instruction.
        mcu.pm[0x20] = 0x940C;
        mcu.pm[0x21] = 0x0040;

        let mut srv = RspServer::start(0).unwrap();

        srv.insert_matchpoint(&mut mcu, "Z0,40,2").unwrap();
        assert_eq!(mcu.pm[0x20], BREAK_OPCODE);
        assert_eq!(mcu.pm[0x21], 0x0000);
        assert_eq!(mcu.mpm[0x20], 0x940C);
        assert_eq!(mcu.mpm[0x21], 0x0040);

        // Inserting again is idempotent.
        srv.insert_matchpoint(&mut mcu, "Z0,40,2").unwrap();
        assert_eq!(mcu.mpm[0x20], 0x940C);

        srv.remove_matchpoint(&mut mcu, "z0,40,2").unwrap();
        assert_eq!(mcu.pm[0x20], 0x940C);
        assert_eq!(mcu.pm[0x21], 0x0040);
    }

    #[test]
    fn test_remove_without_break_fails() {
        let (mut mcu, _) = models::init("m8a").unwrap();
        mcu.pm[0x10] = 0x0000;

        let mut srv = RspServer::start(0).unwrap();

        // No BREAK at word 0x10: flash must stay untouched.
        srv.remove_matchpoint(&mut mcu, "z0,20,2").unwrap();
        assert_eq!(mcu.pm[0x10], 0x0000);
    }
}
