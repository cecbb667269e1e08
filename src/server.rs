//! The framing state machine and command dispatcher. One [`RspServer`]
//! wraps one target; [`RspServer::tick`] is the only entry point, called
//! once per available input byte (or with none, to pump pending output).

use log::{debug, trace};

use crate::flash_cache::FlashCache;
use crate::recv_buffer::RecvBuffer;
use crate::send_buffer::SendBuffer;
use crate::target::{TargetAdapter, CSR_DPC, GPR_COUNT, MEMORY_MAP_XML};

/// Largest block transfer `m` will service in one packet, in words.
/// Bounds the stack buffer used while streaming a block read.
const MAX_BLOCK_WORDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramingState {
    RecvPrefix,
    RecvPacket,
    RecvEscape,
    RecvSuffix1,
    RecvSuffix2,
    SendPrefix,
    SendPacket,
    SendEscape,
    SendSuffix1,
    SendSuffix2,
    SendSuffix3,
    RecvAck,
}

/// One GDB Remote Serial Protocol endpoint, driven byte-by-byte.
///
/// The core never blocks and never owns a thread: `tick` consumes at most
/// one input byte and produces at most one output byte per call, so the
/// caller's transport loop stays in full control of timing.
pub struct RspServer<'a, T: TargetAdapter> {
    target: &'a mut T,
    recv: RecvBuffer,
    send: SendBuffer,
    flash: FlashCache,
    state: FramingState,
    checksum: u8,
    expected_checksum: u8,
    suppress_reply: bool,
}

impl<'a, T: TargetAdapter> RspServer<'a, T> {
    pub fn new(target: &'a mut T) -> Self {
        RspServer {
            target,
            recv: RecvBuffer::new(),
            send: SendBuffer::new(),
            flash: FlashCache::new(),
            state: FramingState::RecvPrefix,
            checksum: 0,
            expected_checksum: 0,
            suppress_reply: false,
        }
    }

    const COMMAND_TABLE: &'static [(&'static str, fn(&mut Self))] = &[
        ("?", Self::handle_questionmark),
        ("!", Self::handle_bang),
        ("\x03", Self::handle_ctrlc),
        ("c", Self::handle_continue),
        ("D", Self::handle_detach),
        ("g", Self::handle_read_registers),
        ("G", Self::handle_write_registers),
        ("H", Self::handle_set_thread),
        ("k", Self::handle_kill),
        ("m", Self::handle_read_memory),
        ("M", Self::handle_write_memory),
        ("p", Self::handle_read_register),
        ("P", Self::handle_write_register),
        ("q", Self::handle_query),
        ("s", Self::handle_step),
        ("R", Self::handle_restart),
        ("v", Self::handle_v_command),
    ];

    /// Advance the framing state machine by one input byte (when
    /// `byte_in_valid`) and/or one output byte. Returns the next byte to
    /// transmit, if any.
    pub fn tick(&mut self, byte_in: u8, byte_in_valid: bool) -> (u8, bool) {
        use FramingState::*;

        match self.state {
            RecvPrefix => {
                if byte_in_valid && byte_in == b'$' {
                    self.recv.clear();
                    self.checksum = 0;
                    self.state = RecvPacket;
                }
                (0, false)
            }

            RecvPacket => {
                if !byte_in_valid {
                    return (0, false);
                }
                match byte_in {
                    b'#' => {
                        self.state = RecvSuffix1;
                    }
                    b'}' => {
                        self.checksum = self.checksum.wrapping_add(byte_in);
                        self.state = RecvEscape;
                    }
                    _ => {
                        self.checksum = self.checksum.wrapping_add(byte_in);
                        self.recv.put_byte(byte_in);
                    }
                }
                (0, false)
            }

            RecvEscape => {
                if !byte_in_valid {
                    return (0, false);
                }
                self.checksum = self.checksum.wrapping_add(byte_in);
                self.recv.put_byte(byte_in ^ 0x20);
                self.state = RecvPacket;
                (0, false)
            }

            RecvSuffix1 => {
                if !byte_in_valid {
                    return (0, false);
                }
                self.expected_checksum = hex_value(byte_in) << 4;
                self.state = RecvSuffix2;
                (0, false)
            }

            RecvSuffix2 => {
                if !byte_in_valid {
                    return (0, false);
                }
                self.expected_checksum |= hex_value(byte_in);
                if self.checksum == self.expected_checksum {
                    self.dispatch();
                    if self.suppress_reply {
                        self.suppress_reply = false;
                        self.state = RecvPrefix;
                        return (0, false);
                    }
                    self.state = SendPrefix;
                    (b'+', true)
                } else {
                    self.state = RecvPrefix;
                    (b'-', true)
                }
            }

            SendPrefix => {
                self.checksum = 0;
                self.send.reset_cursor();
                self.state = if self.send.is_empty() {
                    SendSuffix1
                } else {
                    SendPacket
                };
                (b'$', true)
            }

            SendPacket => {
                let b = self.send.byte_at_cursor();
                if b == b'#' || b == b'$' || b == b'}' || b == b'*' {
                    self.state = SendEscape;
                    (b'}', true)
                } else {
                    self.checksum = self.checksum.wrapping_add(b);
                    self.send.advance_cursor();
                    self.state = if self.send.cursor() >= self.send.len() {
                        SendSuffix1
                    } else {
                        SendPacket
                    };
                    (b, true)
                }
            }

            SendEscape => {
                let b = self.send.byte_at_cursor() ^ 0x20;
                self.checksum = self.checksum.wrapping_add(b'}');
                self.checksum = self.checksum.wrapping_add(b);
                self.send.advance_cursor();
                self.state = if self.send.cursor() >= self.send.len() {
                    SendSuffix1
                } else {
                    SendPacket
                };
                (b, true)
            }

            SendSuffix1 => {
                self.state = SendSuffix2;
                (b'#', true)
            }

            SendSuffix2 => {
                self.state = SendSuffix3;
                (hex_digit(self.checksum >> 4), true)
            }

            SendSuffix3 => {
                let low = hex_digit(self.checksum & 0x0F);
                self.state = RecvAck;
                (low, true)
            }

            RecvAck => {
                if !byte_in_valid {
                    return (0, false);
                }
                match byte_in {
                    b'-' => {
                        self.checksum = 0;
                        self.send.reset_cursor();
                        self.state = if self.send.is_empty() {
                            SendSuffix1
                        } else {
                            SendPacket
                        };
                    }
                    _ => {
                        self.state = RecvPrefix;
                    }
                }
                (0, false)
            }
        }
    }

    fn dispatch(&mut self) {
        self.recv.set_cursor(0);
        self.send.clear();

        let body = self.recv.contents();
        let mut matched = false;
        for (prefix, handler) in Self::COMMAND_TABLE {
            if body.starts_with(prefix.as_bytes()) {
                self.recv.set_cursor(0);
                handler(self);
                matched = true;
                break;
            }
        }

        if !matched {
            debug!("unrecognized command: {:?}", String::from_utf8_lossy(body));
        } else if self.recv.error() && !self.send.valid {
            // Generic parse-error reply. `H` sets its own `E01` ahead of
            // this, which the `!self.send.valid` guard preserves.
            self.send.set_packet("E00");
        } else if !self.recv.error() && self.recv.cursor() != self.recv.len() {
            trace!(
                "handler left {} unread bytes in {:?}",
                self.recv.len() - self.recv.cursor(),
                String::from_utf8_lossy(body)
            );
        }

        if !self.send.valid {
            self.send.set_packet("");
        }
    }

    fn handle_questionmark(&mut self) {
        self.recv.take_literal(b'?');
        self.send.set_packet("T02");
    }

    fn handle_bang(&mut self) {
        self.recv.take_literal(b'!');
        self.send.set_packet("OK");
    }

    fn handle_ctrlc(&mut self) {
        self.recv.take_literal(0x03);
        self.send.set_packet("OK");
    }

    fn handle_continue(&mut self) {
        // The probe cannot resume execution on its own initiative; the
        // debugger re-requests state after this with a fresh `?`.
        self.recv.take_literal(b'c');
        self.send.set_packet("");
    }

    fn handle_detach(&mut self) {
        self.recv.take_literal(b'D');
        self.send.set_packet("OK");
    }

    fn handle_read_registers(&mut self) {
        self.recv.take_literal(b'g');
        self.send.start_packet();
        for i in 0..GPR_COUNT {
            let v = self.target.get_gpr(i);
            self.send.put_hex_u32(v);
        }
        let pc = self.target.get_csr(CSR_DPC);
        self.send.put_hex_u32(pc);
        self.send.end_packet();
    }

    fn handle_write_registers(&mut self) {
        // Left unimplemented on purpose: an empty reply tells the debugger
        // `G` is unsupported, so it falls back to per-register `P` writes.
        self.recv.take_literal(b'G');
        self.send.set_packet("");
    }

    fn handle_set_thread(&mut self) {
        self.recv.take_literal(b'H');
        self.recv.skip(1);
        self.recv.take_hex_i32();
        if self.recv.error() {
            self.send.set_packet("E01");
        } else {
            self.send.set_packet("OK");
        }
    }

    fn handle_kill(&mut self) {
        self.recv.take_literal(b'k');
        self.suppress_reply = true;
    }

    fn handle_read_memory(&mut self) {
        self.recv.take_literal(b'm');
        let addr = self.recv.take_hex_u32();
        self.recv.take_literal(b',');
        let size = self.recv.take_hex_u32();
        if self.recv.error() {
            return;
        }
        if size == 0 || size as usize > MAX_BLOCK_WORDS * 4 || addr % 4 != 0 {
            self.send.set_packet("E00");
            return;
        }

        if size == 4 {
            let v = self.target.get_mem(addr);
            self.send.start_packet();
            self.send.put_hex_u32(v);
            self.send.end_packet();
            return;
        }

        let word_count = ((size + 3) / 4) as usize;
        let mut words = [0u32; MAX_BLOCK_WORDS];
        self.target.get_block(addr, &mut words[..word_count]);

        self.send.start_packet();
        let mut remaining = size as usize;
        'words: for word in &words[..word_count] {
            for i in 0..4 {
                if remaining == 0 {
                    break 'words;
                }
                self.send.put_hex_byte((word >> (i * 8)) as u8);
                remaining -= 1;
            }
        }
        self.send.end_packet();
    }

    fn handle_write_memory(&mut self) {
        self.recv.take_literal(b'M');
        let addr = self.recv.take_hex_u32();
        self.recv.take_literal(b',');
        let size = self.recv.take_hex_u32();
        self.recv.take_literal(b':');
        if self.recv.error() {
            return;
        }
        if addr % 4 != 0 || size % 4 != 0 {
            return;
        }

        let word_count = (size / 4) as usize;
        for i in 0..word_count {
            let b0 = self.recv.take_hex_byte();
            let b1 = self.recv.take_hex_byte();
            let b2 = self.recv.take_hex_byte();
            let b3 = self.recv.take_hex_byte();
            if self.recv.error() {
                return;
            }
            let value = u32::from_le_bytes([b0, b1, b2, b3]);
            self.target.set_mem(addr + (i as u32) * 4, value);
        }
        self.send.set_packet("OK");
    }

    fn handle_read_register(&mut self) {
        self.recv.take_literal(b'p');
        let index = self.recv.take_hex_u32();
        if self.recv.error() {
            return;
        }
        let v = if (index as u8) < GPR_COUNT {
            self.target.get_gpr(index as u8)
        } else {
            self.target.get_csr(CSR_DPC)
        };
        self.send.start_packet();
        self.send.put_hex_u32(v);
        self.send.end_packet();
    }

    fn handle_write_register(&mut self) {
        self.recv.take_literal(b'P');
        let index = self.recv.take_hex_u32();
        self.recv.take_literal(b'=');
        let value = self.recv.take_hex_u32();
        if self.recv.error() {
            return;
        }
        if (index as u8) < GPR_COUNT {
            self.target.set_gpr(index as u8, value);
        } else {
            self.target.set_csr(CSR_DPC, value);
        }
        self.send.set_packet("OK");
    }

    fn handle_query(&mut self) {
        if self.recv.match_prefix("qAttached") {
            self.send.set_packet("1");
        } else if self.recv.match_prefix("qC") {
            self.send.set_packet("QC0");
        } else if self.recv.match_prefix("qfThreadInfo") {
            self.send.set_packet("m0");
        } else if self.recv.match_prefix("qsThreadInfo") {
            self.send.set_packet("l");
        } else if self.recv.match_prefix("qSupported") {
            self.send
                .set_packet("PacketSize=32768;qXfer:memory-map:read+");
        } else if self.recv.match_prefix("qXfer:memory-map:read::") {
            let offset = self.recv.take_hex_u32();
            self.recv.take_literal(b',');
            let _length = self.recv.take_hex_u32();
            if self.recv.error() {
                return;
            }
            self.reply_xfer(MEMORY_MAP_XML.as_bytes(), offset as usize);
        } else {
            debug!(
                "unhandled query: {:?}",
                String::from_utf8_lossy(self.recv.contents())
            );
        }
    }

    /// Returns the whole remaining document from `offset` in one shot —
    /// its size is well under the negotiated packet size, so there is
    /// never a second `l`-terminated fetch.
    fn reply_xfer(&mut self, data: &[u8], offset: usize) {
        if offset >= data.len() {
            self.send.set_packet("l");
            return;
        }
        let chunk = &data[offset..];

        self.send.start_packet();
        self.send.put_str("l");
        self.send.put_bytes(chunk);
        self.send.end_packet();
    }

    fn handle_step(&mut self) {
        self.recv.take_literal(b's');
        self.send.set_packet("");
    }

    fn handle_restart(&mut self) {
        self.recv.take_literal(b'R');
        self.send.set_packet("");
    }

    fn handle_v_command(&mut self) {
        if self.recv.match_prefix("vCont") {
            self.send.set_packet("");
        } else if self.recv.match_prefix("vFlashWrite:") {
            let addr = self.recv.take_hex_u32();
            self.recv.take_literal(b':');
            if self.recv.error() {
                return;
            }
            let start = self.recv.cursor();
            let end = self.recv.len();
            for offset in start..end {
                let byte = self.recv.contents()[offset];
                self.flash
                    .put_byte(self.target, addr + (offset - start) as u32, byte);
            }
            self.recv.set_cursor(end);
            self.send.set_packet("OK");
        } else if self.recv.match_prefix("vFlashErase:") {
            let addr = self.recv.take_hex_u32();
            self.recv.take_literal(b',');
            let size = self.recv.take_hex_u32();
            if self.recv.error() {
                return;
            }
            match self.flash.erase(self.target, addr, size) {
                Ok(()) => self.send.set_packet("OK"),
                Err(_) => self.send.set_packet("E00"),
            }
        } else if self.recv.match_prefix("vFlashDone") {
            self.flash.flush(self.target);
            self.send.set_packet("OK");
        } else if self.recv.match_prefix("vKill") {
            self.send.set_packet("OK");
        } else if self.recv.match_prefix("vMustReplyEmpty") {
            self.send.set_packet("");
        } else {
            debug!(
                "unhandled v-command: {:?}",
                String::from_utf8_lossy(self.recv.contents())
            );
        }
    }
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => 0,
    }
}

fn hex_digit(v: u8) -> u8 {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    DIGITS[(v & 0x0F) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockTarget {
        gpr: [u32; 16],
        dpc: u32,
        mem: std::collections::HashMap<u32, u32>,
        flash: std::collections::HashMap<u32, [u32; 16]>,
        erased_chip: u32,
    }

    impl TargetAdapter for MockTarget {
        fn get_gpr(&mut self, index: u8) -> u32 {
            self.gpr[index as usize]
        }
        fn set_gpr(&mut self, index: u8, value: u32) {
            self.gpr[index as usize] = value;
        }
        fn get_csr(&mut self, _id: u16) -> u32 {
            self.dpc
        }
        fn set_csr(&mut self, _id: u16, value: u32) {
            self.dpc = value;
        }
        fn get_mem(&mut self, addr: u32) -> u32 {
            *self.mem.get(&addr).unwrap_or(&0)
        }
        fn set_mem(&mut self, addr: u32, value: u32) {
            self.mem.insert(addr, value);
        }
        fn get_block(&mut self, addr: u32, out: &mut [u32]) {
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = self.get_mem(addr + (i as u32) * 4);
            }
        }
        fn wipe_chip(&mut self) {
            self.erased_chip += 1;
        }
        fn wipe_sector(&mut self, _addr: u32) {}
        fn wipe_page(&mut self, _addr: u32) {}
        fn write_flash(&mut self, page_base: u32, data: &[u32; 16]) {
            self.flash.insert(page_base, *data);
        }
    }

    fn checksum(body: &[u8]) -> u8 {
        body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    /// Build a well-formed `$body#cc` frame, computing its checksum so
    /// tests never hand-carry hex arithmetic.
    fn frame(body: &[u8]) -> Vec<u8> {
        let cs = checksum(body);
        let mut out = Vec::with_capacity(body.len() + 4);
        out.push(b'$');
        out.extend_from_slice(body);
        out.push(b'#');
        out.push(hex_digit(cs >> 4));
        out.push(hex_digit(cs & 0x0F));
        out
    }

    fn feed(server: &mut RspServer<'_, MockTarget>, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in bytes {
            let (ob, valid) = server.tick(b, true);
            if valid {
                out.push(ob);
            }
        }
        loop {
            let (ob, valid) = server.tick(0, false);
            if !valid {
                break;
            }
            out.push(ob);
        }
        out
    }

    #[test]
    fn query_halt_status() {
        let mut target = MockTarget::default();
        let mut server = RspServer::new(&mut target);
        let out = feed(&mut server, &frame(b"?"));
        let mut expected = vec![b'+'];
        expected.extend(frame(b"T02"));
        assert_eq!(out, expected);
    }

    #[test]
    fn read_registers_roundtrip() {
        let mut target = MockTarget::default();
        target.gpr[1] = 0x11223344;
        target.dpc = 0xdeadbeef;
        let mut server = RspServer::new(&mut target);
        let out = feed(&mut server, &frame(b"g"));
        let body = &out[2..out.len() - 3];
        assert!(body.windows(8).any(|w| w == b"44332211"));
    }

    #[test]
    fn bad_checksum_gets_nak_then_retransmit_acked() {
        let mut target = MockTarget::default();
        let mut server = RspServer::new(&mut target);
        let mut bytes = b"$?#00".to_vec();
        bytes.extend(frame(b"?"));
        let out = feed(&mut server, &bytes);
        let mut expected = vec![b'-', b'+'];
        expected.extend(frame(b"T02"));
        assert_eq!(out, expected);
    }

    #[test]
    fn kill_produces_no_reply() {
        let mut target = MockTarget::default();
        let mut server = RspServer::new(&mut target);
        let out = feed(&mut server, &frame(b"k"));
        assert!(out.is_empty());
    }

    #[test]
    fn write_then_read_memory() {
        let mut target = MockTarget::default();
        let mut server = RspServer::new(&mut target);
        feed(&mut server, &frame(b"M20000000,4:44332211"));
        let out = feed(&mut server, &frame(b"m20000000,4"));
        let body = &out[2..out.len() - 3];
        assert_eq!(body, b"44332211");
    }

    #[test]
    fn flash_write_and_done_programs_one_page() {
        let mut target = MockTarget::default();
        {
            let mut server = RspServer::new(&mut target);
            let mut write_body = b"vFlashWrite:00000000:".to_vec();
            write_body.extend(std::iter::repeat(0xAAu8).take(64));
            feed(&mut server, &frame(&write_body));
            feed(&mut server, &frame(b"vFlashDone"));
        }
        assert_eq!(target.flash.len(), 1);
        assert_eq!(target.flash[&0][0] & 0xFF, 0xAA);
    }

    #[test]
    fn whole_chip_erase_via_v_command() {
        let mut target = MockTarget::default();
        {
            let mut server = RspServer::new(&mut target);
            let out = feed(&mut server, &frame(b"vFlashErase:0,4000"));
            let mut expected = vec![b'+'];
            expected.extend(frame(b"OK"));
            assert_eq!(out, expected);
        }
        assert_eq!(target.erased_chip, 1);
    }
}
