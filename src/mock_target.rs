//! Test doubles: a behavioural MEM-AP target model speaking the SWD wire
//! protocol, a JTAG-DP register model, a mockall tap for traffic
//! expectations, and a deterministic clock.

use alloc::vec;
use alloc::vec::Vec;

use crate::ap::{Csw, CSW_ADDRINC_MASK, CSW_SIZE_MASK};
use crate::dp::{Abort, CtrlStat};
use crate::swd::Ack;
use crate::tap::{DelayNs, JtagTap, SwdTap, Timer};

// A tap whose every call must be expected; unexpected traffic panics.
mockall::mock! {
    pub SwdTap {}
    impl crate::tap::SwdTap for SwdTap {
        fn init(&mut self);
        fn bit_out(&mut self, bit: bool);
        fn seq_out(&mut self, value: u32, bits: u8);
        fn seq_out_parity(&mut self, value: u32, bits: u8);
        fn seq_in(&mut self, bits: u8) -> u32;
        fn seq_in_parity(&mut self, bits: u8) -> (u32, bool);
    }
}

/// A clock that advances a fixed step on every reading; delays are no-ops.
pub struct TestTimer {
    now: u32,
    step: u32,
}

impl TestTimer {
    pub fn new() -> Self {
        Self::with_step(1)
    }

    pub fn with_step(step: u32) -> Self {
        TestTimer { now: 0, step }
    }
}

impl DelayNs for TestTimer {
    fn delay_ns(&mut self, _ns: u32) {}
}

impl Timer for TestTimer {
    fn now_ms(&mut self) -> u32 {
        let t = self.now;
        self.now = self.now.wrapping_add(self.step);
        t
    }
}

/// One executed (OK-acknowledged, data phase completed) transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WireOp {
    pub ap: bool,
    pub read: bool,
    /// Full byte address for AP registers, register address for DP.
    pub addr: u8,
    pub value: u32,
}

#[derive(Copy, Clone, Debug)]
struct Request {
    ap: bool,
    read: bool,
    addr: u8,
}

#[derive(Copy, Clone, Debug)]
enum Phase {
    Idle,
    Ack(Request),
    ReadData(u32),
    WriteData(Request),
    Flush,
}

fn decode_request(byte: u32) -> Request {
    assert_eq!(byte & 0x81, 0x81, "start/park bits missing: {byte:#04x}");
    assert_eq!(byte & 0x40, 0, "stop bit set: {byte:#04x}");
    let payload = (byte >> 1) & 0xF;
    assert_eq!(
        payload.count_ones() & 1,
        (byte >> 5) & 1,
        "request parity wrong: {byte:#04x}"
    );
    Request {
        ap: byte & (1 << 1) != 0,
        read: byte & (1 << 2) != 0,
        addr: ((byte >> 1) & 0x0C) as u8,
    }
}

/// A behavioural SW-DP plus MEM-AP target.
///
/// Decodes request bytes, models SELECT banking, the posted-read pipeline,
/// CSW/TAR/DRW with genuine 10-bit auto-increment wrap, sticky errors, and
/// offers fault/WAIT/parity injection knobs plus traffic instrumentation.
pub struct TargetModel {
    pub idcode: u32,
    pub ap_idr: u32,
    pub ap_cfg: u32,
    pub ap_base: u32,
    /// Backing memory, starting at `mem_base`.
    pub mem: Vec<u8>,
    pub mem_base: u32,
    /// Additional APs visible only through their IDR, for sparse-scan tests.
    pub extra_aps: Vec<(u8, u32)>,

    // Injection knobs.
    pub wait_acks: usize,
    pub wait_forever: bool,
    pub protocol_acks: usize,
    pub corrupt_read_parity: bool,
    pub fault_after_ap_accesses: Option<usize>,
    pub missing_ap_faults: bool,
    pub power_acks: bool,

    // Instrumentation.
    pub requests: usize,
    pub ops: Vec<WireOp>,
    pub selects: Vec<u32>,
    pub aborts: Vec<u32>,
    pub line_resets: usize,
    pub switch_sequences: usize,

    ctrlstat: u32,
    select: u32,
    posted: u32,
    csw: u32,
    tar: u32,
    sticky_err: bool,
    ap_accesses_done: usize,
    high_bits: u32,
    phase: Phase,
}

impl TargetModel {
    pub fn new() -> Self {
        TargetModel {
            idcode: 0x2BA0_1477,
            ap_idr: 0x2477_0011,
            ap_cfg: 0,
            ap_base: 0xE00F_F003,
            mem: vec![0; 0x800],
            mem_base: 0x2000_0000,
            extra_aps: Vec::new(),
            wait_acks: 0,
            wait_forever: false,
            protocol_acks: 0,
            corrupt_read_parity: false,
            fault_after_ap_accesses: None,
            missing_ap_faults: false,
            power_acks: true,
            requests: 0,
            ops: Vec::new(),
            selects: Vec::new(),
            aborts: Vec::new(),
            line_resets: 0,
            switch_sequences: 0,
            ctrlstat: 0,
            select: 0,
            posted: 0,
            csw: 0,
            tar: 0,
            sticky_err: false,
            ap_accesses_done: 0,
            high_bits: 0,
            phase: Phase::Idle,
        }
    }

    /// Executed AP writes to the given full register address.
    pub fn writes_to(&self, addr: u8) -> usize {
        self.ops
            .iter()
            .filter(|op| op.ap && !op.read && op.addr == addr)
            .count()
    }

    /// OK-acknowledged AP accesses so far.
    pub fn ap_accesses(&self) -> usize {
        self.ap_accesses_done
    }

    fn set_sticky(&mut self) {
        self.sticky_err = true;
        self.ctrlstat |= CtrlStat::STICKYERR.bits();
    }

    fn ack_for(&mut self, req: Request) -> u8 {
        if self.wait_forever {
            return Ack::Wait as u8;
        }
        if self.wait_acks > 0 {
            self.wait_acks -= 1;
            return Ack::Wait as u8;
        }
        if self.protocol_acks > 0 {
            self.protocol_acks -= 1;
            return Ack::Protocol as u8;
        }
        if req.ap {
            if self.sticky_err {
                return Ack::Fault as u8;
            }
            let apsel = (self.select >> 24) as u8;
            let missing = apsel != 0 && !self.extra_aps.iter().any(|&(s, _)| s == apsel);
            if missing && self.missing_ap_faults {
                self.set_sticky();
                return Ack::Fault as u8;
            }
            if let Some(n) = self.fault_after_ap_accesses {
                if self.ap_accesses_done >= n {
                    self.set_sticky();
                    return Ack::Fault as u8;
                }
            }
            self.ap_accesses_done += 1;
        }
        Ack::Ok as u8
    }

    fn mem_byte(&self, addr: u32) -> u8 {
        addr.checked_sub(self.mem_base)
            .and_then(|off| self.mem.get(off as usize))
            .copied()
            .unwrap_or(0)
    }

    fn mem_set(&mut self, addr: u32, byte: u8) {
        if let Some(off) = addr.checked_sub(self.mem_base) {
            if let Some(slot) = self.mem.get_mut(off as usize) {
                *slot = byte;
            }
        }
    }

    fn mem_word(&self, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.mem_byte(addr + i as u32);
        }
        u32::from_le_bytes(bytes)
    }

    fn autoinc(&mut self) {
        if self.csw & CSW_ADDRINC_MASK == Csw::ADDRINC_SINGLE.bits() {
            let step = 1u32 << (self.csw & CSW_SIZE_MASK).min(2);
            // Hardware increment wraps within the 1 KiB span.
            self.tar = (self.tar & !0x3FF) | (self.tar.wrapping_add(step) & 0x3FF);
        }
    }

    fn ap_read_value(&mut self, full: u8) -> u32 {
        let apsel = (self.select >> 24) as u8;
        if apsel != 0 {
            return if full == 0xFC {
                self.extra_aps
                    .iter()
                    .find(|&&(s, _)| s == apsel)
                    .map(|&(_, idr)| idr)
                    .unwrap_or(0)
            } else {
                0
            };
        }
        match full {
            0x00 => self.csw,
            0x04 => self.tar,
            0x0C => {
                let word = self.mem_word(self.tar & !3);
                self.autoinc();
                word
            }
            0xF4 => self.ap_cfg,
            0xF8 => self.ap_base,
            0xFC => self.ap_idr,
            _ => 0,
        }
    }

    fn ap_write_value(&mut self, full: u8, value: u32) {
        if (self.select >> 24) as u8 != 0 {
            return;
        }
        match full {
            0x00 => self.csw = value,
            0x04 => self.tar = value,
            0x0C => {
                let step = 1u32 << (self.csw & CSW_SIZE_MASK).min(2);
                let lane = match step {
                    4 => 0,
                    2 => self.tar & 2,
                    _ => self.tar & 3,
                };
                let shifted = value >> (lane * 8);
                for i in 0..step {
                    self.mem_set(self.tar + i, (shifted >> (8 * i)) as u8);
                }
                self.autoinc();
            }
            _ => {}
        }
    }

    fn dp_read_value(&self, addr: u8) -> u32 {
        match addr {
            0x0 => self.idcode,
            0x4 => self.ctrlstat,
            0x8 => self.select,
            0xC => self.posted,
            _ => 0,
        }
    }

    fn dp_write_value(&mut self, addr: u8, value: u32) {
        match addr {
            0x0 => {
                self.aborts.push(value);
                let abort = Abort::from_bits_truncate(value);
                if abort.contains(Abort::STKERRCLR) {
                    self.sticky_err = false;
                    self.ctrlstat &= !CtrlStat::STICKYERR.bits();
                }
                if abort.contains(Abort::STKCMPCLR) {
                    self.ctrlstat &= !CtrlStat::STICKYCMP.bits();
                }
                if abort.contains(Abort::WDERRCLR) {
                    self.ctrlstat &= !CtrlStat::WDATAERR.bits();
                }
                if abort.contains(Abort::ORUNERRCLR) {
                    self.ctrlstat &= !CtrlStat::STICKYORUN.bits();
                }
            }
            0x4 => {
                let sticky = CtrlStat::STICKY_MASK.bits();
                let ack_bits = (CtrlStat::CSYSPWRUPACK | CtrlStat::CDBGPWRUPACK).bits();
                let mut acks = 0;
                if self.power_acks {
                    if value & CtrlStat::CSYSPWRUPREQ.bits() != 0 {
                        acks |= CtrlStat::CSYSPWRUPACK.bits();
                    }
                    if value & CtrlStat::CDBGPWRUPREQ.bits() != 0 {
                        acks |= CtrlStat::CDBGPWRUPACK.bits();
                    }
                }
                self.ctrlstat = (value & !(sticky | ack_bits)) | (self.ctrlstat & sticky) | acks;
            }
            0x8 => {
                self.select = value;
                self.selects.push(value);
            }
            _ => {}
        }
    }

    fn exec_read(&mut self, req: Request) -> u32 {
        if req.ap {
            let full = ((self.select & 0xF0) as u8) | req.addr;
            let new = self.ap_read_value(full);
            let old = self.posted;
            self.posted = new;
            self.ops.push(WireOp {
                ap: true,
                read: true,
                addr: full,
                value: new,
            });
            // AP reads are posted: this transaction's data phase carries the
            // previous result.
            old
        } else {
            let value = self.dp_read_value(req.addr);
            self.ops.push(WireOp {
                ap: false,
                read: true,
                addr: req.addr,
                value,
            });
            value
        }
    }

    fn exec_write(&mut self, req: Request, value: u32) {
        if req.ap {
            let full = ((self.select & 0xF0) as u8) | req.addr;
            self.ap_write_value(full, value);
            self.ops.push(WireOp {
                ap: true,
                read: false,
                addr: full,
                value,
            });
        } else {
            self.dp_write_value(req.addr, value);
            self.ops.push(WireOp {
                ap: false,
                read: false,
                addr: req.addr,
                value,
            });
        }
    }
}

impl SwdTap for TargetModel {
    fn init(&mut self) {}

    fn bit_out(&mut self, bit: bool) {
        if bit {
            self.high_bits += 1;
            if self.high_bits == 50 {
                self.line_resets += 1;
            }
        } else {
            self.high_bits = 0;
        }
    }

    fn seq_out(&mut self, value: u32, bits: u8) {
        self.high_bits = 0;
        match (self.phase, bits) {
            (Phase::Idle, 8) => self.phase = Phase::Ack(decode_request(value)),
            (Phase::Flush, 8) => {
                assert_eq!(value, 0, "flush must be idle cycles");
                self.phase = Phase::Idle;
            }
            (Phase::Idle, 16) => {
                if value == 0xE79E {
                    self.switch_sequences += 1;
                }
            }
            (phase, bits) => panic!("unexpected seq_out({value:#x}, {bits}) in {phase:?}"),
        }
    }

    fn seq_out_parity(&mut self, value: u32, bits: u8) {
        assert_eq!(bits, 32);
        match self.phase {
            Phase::WriteData(req) => {
                self.exec_write(req, value);
                self.phase = Phase::Flush;
            }
            phase => panic!("unexpected write data phase in {phase:?}"),
        }
    }

    fn seq_in(&mut self, bits: u8) -> u32 {
        assert_eq!(bits, 3, "only the ack is read as a plain sequence");
        let req = match self.phase {
            Phase::Ack(req) => req,
            phase => panic!("unexpected ack read in {phase:?}"),
        };
        self.requests += 1;
        let ack = self.ack_for(req);
        self.phase = if ack == Ack::Ok as u8 {
            if req.read {
                let value = self.exec_read(req);
                Phase::ReadData(value)
            } else {
                Phase::WriteData(req)
            }
        } else {
            Phase::Idle
        };
        ack as u32
    }

    fn seq_in_parity(&mut self, bits: u8) -> (u32, bool) {
        assert_eq!(bits, 32);
        match self.phase {
            Phase::ReadData(value) => {
                self.phase = Phase::Flush;
                let corrupt = core::mem::take(&mut self.corrupt_read_parity);
                (value, !corrupt)
            }
            phase => panic!("unexpected read data phase in {phase:?}"),
        }
    }
}

/// A JTAG-DP register model: every DR scan captures the result of the
/// previous one, as the hardware does.
pub struct JtagModel {
    pub ir_log: Vec<u32>,
    pub scans: usize,
    pub wait_acks: usize,
    pub bad_acks: usize,
    pub aborts: Vec<u32>,
    pub ctrlstat: u32,
    pub ap_idr: u32,
    ir: u32,
    select: u32,
    posted: u32,
    csw: u32,
    tar: u32,
}

impl JtagModel {
    pub fn new() -> Self {
        JtagModel {
            ir_log: Vec::new(),
            scans: 0,
            wait_acks: 0,
            bad_acks: 0,
            aborts: Vec::new(),
            ctrlstat: 0,
            ap_idr: 0x2477_0011,
            ir: 0xF,
            select: 0,
            posted: 0,
            csw: 0,
            tar: 0,
        }
    }

    fn dp_read(&self, addr: u8) -> u32 {
        match addr {
            0x4 => self.ctrlstat,
            0x8 => self.select,
            0xC => self.posted,
            _ => 0,
        }
    }

    fn dp_write(&mut self, addr: u8, value: u32) {
        match addr {
            0x4 => {
                let sticky = CtrlStat::STICKY_MASK.bits();
                self.ctrlstat = (value & !sticky) | (self.ctrlstat & sticky);
            }
            0x8 => self.select = value,
            _ => {}
        }
    }

    fn ap_read(&mut self, addr: u8) -> u32 {
        let full = ((self.select & 0xF0) as u8) | addr;
        match full {
            0x00 => self.csw,
            0x04 => self.tar,
            0xFC => self.ap_idr,
            _ => 0,
        }
    }

    fn ap_write(&mut self, addr: u8, value: u32) {
        let full = ((self.select & 0xF0) as u8) | addr;
        match full {
            0x00 => self.csw = value,
            0x04 => self.tar = value,
            _ => {}
        }
    }

    fn apply_abort(&mut self, value: u32) {
        self.aborts.push(value);
        let abort = Abort::from_bits_truncate(value);
        if abort.contains(Abort::STKERRCLR) {
            self.ctrlstat &= !CtrlStat::STICKYERR.bits();
        }
        if abort.contains(Abort::STKCMPCLR) {
            self.ctrlstat &= !CtrlStat::STICKYCMP.bits();
        }
        if abort.contains(Abort::WDERRCLR) {
            self.ctrlstat &= !CtrlStat::WDATAERR.bits();
        }
        if abort.contains(Abort::ORUNERRCLR) {
            self.ctrlstat &= !CtrlStat::STICKYORUN.bits();
        }
    }
}

impl JtagTap for JtagModel {
    fn init(&mut self) {}

    fn shift_ir(&mut self, ir: u32) {
        self.ir = ir;
        self.ir_log.push(ir);
    }

    fn shift_dr(&mut self, out: u64, bits: u8) -> u64 {
        assert_eq!(bits, 35);
        self.scans += 1;

        if self.bad_acks > 0 {
            self.bad_acks -= 1;
            return 0b111;
        }
        if self.wait_acks > 0 {
            self.wait_acks -= 1;
            return 0b001;
        }

        let read = out & 1 == 1;
        let addr = (((out >> 1) & 0x3) as u8) << 2;
        let value = (out >> 3) as u32;
        let old = self.posted as u64;

        match self.ir {
            0x8 => self.apply_abort(value),
            0xA => {
                if read {
                    self.posted = self.dp_read(addr);
                } else {
                    self.dp_write(addr, value);
                }
            }
            0xB => {
                if read {
                    self.posted = self.ap_read(addr);
                } else {
                    self.ap_write(addr, value);
                }
            }
            ir => panic!("DR scan with unexpected IR {ir:#x}"),
        }

        (old << 3) | 0b010
    }
}
