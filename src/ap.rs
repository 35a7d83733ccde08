//! Access ports: banked register windows behind a debug port, and the
//! MEM-AP engine for arbitrary-length, arbitrarily-aligned memory access.

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::dp::{Abort, DebugPort, DpRegister, Error, LowAccess, Result};
use crate::swd::{APnDP, RnW};

/// A full 8-bit MEM-AP register address: bank in the high nibble, A[3:2] in
/// the low.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApAddr(pub u8);

impl ApAddr {
    /// Control/status word.
    pub const CSW: ApAddr = ApAddr(0x00);
    /// Transfer address register.
    pub const TAR: ApAddr = ApAddr(0x04);
    /// Data read/write register.
    pub const DRW: ApAddr = ApAddr(0x0C);
    /// Configuration register.
    pub const CFG: ApAddr = ApAddr(0xF4);
    /// Debug base address register.
    pub const BASE: ApAddr = ApAddr(0xF8);
    /// Identification register.
    pub const IDR: ApAddr = ApAddr(0xFC);

    /// Banked data register `n` (0..=3), a window onto TAR + 4n.
    pub const fn banked_data(n: u8) -> ApAddr {
        ApAddr(0x10 + 4 * (n & 3))
    }

    /// The bank nibble, positioned as SELECT wants it.
    pub const fn bank(self) -> u8 {
        self.0 & 0xF0
    }

    /// The A[3:2] part that goes on the wire.
    pub const fn offset(self) -> u8 {
        self.0 & 0x0C
    }
}

bitflags! {
    /// MEM-AP control/status word bits.
    pub struct Csw: u32 {
        /// Debug software access enable.
        const DBGSWENABLE = 1 << 31;
        /// Master type debug (implementation defined).
        const MASTERTYPE_DEBUG = 1 << 29;
        /// Privileged access (implementation defined).
        const HPROT1 = 1 << 25;
        /// Secure privileged debug enabled.
        const SPIDEN = 1 << 23;
        /// Transfer in progress.
        const TRINPROG = 1 << 7;
        /// Device enabled.
        const DEVICEEN = 1 << 6;
        /// Auto-increment TAR on each DRW access.
        const ADDRINC_SINGLE = 1 << 4;
        /// Packed-transfer auto-increment.
        const ADDRINC_PACKED = 2 << 4;
    }
}

/// Size field mask within CSW.
pub const CSW_SIZE_MASK: u32 = 0x7;
/// Address-increment field mask within CSW.
pub const CSW_ADDRINC_MASK: u32 = 0x3 << 4;

/// Hardware TAR auto-increment is only architecturally guaranteed within
/// this span; crossing it needs an explicit TAR rewrite.
const TAR_AUTOINC_SPAN: u32 = 0x400;

/// MEM-AP access width, also the CSW size field value.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum AccessSize {
    Byte = 0,
    Halfword = 1,
    Word = 2,
}

impl AccessSize {
    /// Widest size both the address and the length are aligned to.
    pub fn for_transfer(addr: u32, len: usize) -> AccessSize {
        if addr % 4 == 0 && len % 4 == 0 {
            AccessSize::Word
        } else if addr % 2 == 0 && len % 2 == 0 {
            AccessSize::Halfword
        } else {
            AccessSize::Byte
        }
    }

    const fn bytes(self) -> u32 {
        1 << (self as u32)
    }
}

/// Pick a sub-word unit out of its DRW byte lane.
fn extract_lane(value: u32, addr: u32, size: AccessSize) -> u32 {
    match size {
        AccessSize::Word => value,
        AccessSize::Halfword => (value >> ((addr & 2) * 8)) & 0xFFFF,
        AccessSize::Byte => (value >> ((addr & 3) * 8)) & 0xFF,
    }
}

/// Put a sub-word unit onto the DRW byte lane its address selects.
fn place_lane(value: u32, addr: u32, size: AccessSize) -> u32 {
    match size {
        AccessSize::Word => value,
        AccessSize::Halfword => (value & 0xFFFF) << ((addr & 2) * 8),
        AccessSize::Byte => (value & 0xFF) << ((addr & 3) * 8),
    }
}

/// A memory transfer that stopped early.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryFault {
    /// Bytes confirmed transferred before the failure; callers may resume
    /// from here or fail the whole higher-level operation.
    pub transferred: usize,
    /// What stopped the transfer. [`Error::AckFault`] means the AP faulted
    /// and the port stays latched until [`DebugPort::error`] runs.
    pub cause: Error,
}

/// How [`ap_scan`] treats the first unpopulated APSEL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanPolicy {
    /// Assume dense numbering and stop at the first empty slot.
    #[default]
    StopAtFirstEmpty,
    /// Probe all 256 slots; robust against sparse numbering, much slower.
    Exhaustive,
}

/// One access port behind a debug port.
///
/// The port does not own its DP: the `DebugPort` is borrowed into every
/// operation, outlives all its APs, and a single physical link is assumed.
/// The CSW/TAR caches are write-through optimisations only; invalidate them
/// whenever another agent may have touched the AP.
#[derive(Clone, Debug)]
pub struct AccessPort {
    apsel: u8,
    idr: u32,
    cfg: u32,
    base: u32,
    csw_base: u32,
    csw_cache: Option<u32>,
    tar_cache: Option<u32>,
}

impl AccessPort {
    /// An access port at a known APSEL, with nothing probed yet. Discovery
    /// via [`ap_scan`] fills in IDR/CFG/BASE and the CSW base value.
    pub fn new(apsel: u8) -> AccessPort {
        AccessPort {
            apsel,
            idr: 0,
            cfg: 0,
            base: 0,
            csw_base: 0,
            csw_cache: None,
            tar_cache: None,
        }
    }

    /// Probe one APSEL; `None` when nothing answers there.
    fn probe<LA: LowAccess>(dp: &mut DebugPort<LA>, apsel: u8) -> Result<Option<AccessPort>> {
        let mut ap = AccessPort::new(apsel);
        let idr = ap.read(dp, ApAddr::IDR)?;
        if dp.fault() {
            // An unpopulated slot may answer FAULT; clear it so one bad
            // probe cannot poison the rest of the scan.
            dp.error()?;
            return Ok(None);
        }
        if idr == 0 {
            return Ok(None);
        }
        ap.idr = idr;
        ap.cfg = ap.read(dp, ApAddr::CFG)?;
        ap.base = ap.read(dp, ApAddr::BASE)?;
        ap.csw_base = ap.read(dp, ApAddr::CSW)? & !(CSW_SIZE_MASK | CSW_ADDRINC_MASK);
        Ok(Some(ap))
    }

    /// The APSEL index of this port.
    pub fn apsel(&self) -> u8 {
        self.apsel
    }

    /// The identification register captured at discovery.
    pub fn idr(&self) -> u32 {
        self.idr
    }

    /// The configuration register captured at discovery.
    pub fn cfg(&self) -> u32 {
        self.cfg
    }

    /// The debug base address captured at discovery.
    pub fn base(&self) -> u32 {
        self.base
    }

    fn select_value(&self, addr: ApAddr) -> u32 {
        ((self.apsel as u32) << 24) | (addr.bank() as u32)
    }

    /// Read an AP register, banking SELECT first when needed.
    pub fn read<LA: LowAccess>(&mut self, dp: &mut DebugPort<LA>, addr: ApAddr) -> Result<u32> {
        dp.select(self.select_value(addr))?;
        dp.read_ap(addr.offset())
    }

    /// Write an AP register, banking SELECT first when needed.
    pub fn write<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: ApAddr,
        value: u32,
    ) -> Result<()> {
        dp.select(self.select_value(addr))?;
        dp.write_ap(addr.offset(), value)
    }

    /// Forget the cached CSW/TAR values, forcing the next transfer to
    /// rewrite them. Required after a multidrop hand-off, an external reset
    /// or any out-of-band abort.
    pub fn invalidate_caches(&mut self) {
        self.csw_cache = None;
        self.tar_cache = None;
    }

    fn ensure_csw<LA: LowAccess>(&mut self, dp: &mut DebugPort<LA>, size: AccessSize) -> Result<()> {
        let csw = self.csw_base | Csw::ADDRINC_SINGLE.bits() | size as u32;
        if self.csw_cache != Some(csw) {
            self.write(dp, ApAddr::CSW, csw)?;
            if !dp.fault() {
                self.csw_cache = Some(csw);
            }
        }
        Ok(())
    }

    fn ensure_tar<LA: LowAccess>(&mut self, dp: &mut DebugPort<LA>, addr: u32) -> Result<()> {
        if self.tar_cache != Some(addr) {
            self.write(dp, ApAddr::TAR, addr)?;
            if !dp.fault() {
                self.tar_cache = Some(addr);
            }
        }
        Ok(())
    }

    /// Track where hardware auto-increment left TAR. Its value at a span
    /// boundary is not architecturally defined, so the cache is dropped
    /// there.
    fn retire_tar(&mut self, addr: u32) {
        self.tar_cache = if addr & (TAR_AUTOINC_SPAN - 1) == 0 {
            None
        } else {
            Some(addr)
        };
    }

    /// Read `dest.len()` bytes of target memory starting at `src`.
    ///
    /// The access size follows from the alignment of `src` and the length.
    /// On failure the confirmed byte count and cause are reported, the
    /// caches dropped, and for an AP fault a DAPABORT issued; the fault
    /// latch itself is left for the caller's [`DebugPort::error`].
    pub fn mem_read<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        dest: &mut [u8],
        src: u32,
    ) -> core::result::Result<(), MemoryFault> {
        if dest.is_empty() {
            return Ok(());
        }
        let size = AccessSize::for_transfer(src, dest.len());
        let mut done = 0;
        match self.mem_read_inner(dp, dest, src, size, &mut done) {
            Ok(()) => Ok(()),
            Err(cause) => Err(self.mem_fault(dp, done, cause)),
        }
    }

    /// Write `src` into target memory starting at `dest`.
    ///
    /// Same sizing, caching and failure rules as [`AccessPort::mem_read`].
    pub fn mem_write<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        dest: u32,
        src: &[u8],
    ) -> core::result::Result<(), MemoryFault> {
        if src.is_empty() {
            return Ok(());
        }
        let size = AccessSize::for_transfer(dest, src.len());
        let mut done = 0;
        match self.mem_write_inner(dp, dest, src, size, &mut done) {
            Ok(()) => Ok(()),
            Err(cause) => Err(self.mem_fault(dp, done, cause)),
        }
    }

    fn mem_read_inner<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        dest: &mut [u8],
        src: u32,
        size: AccessSize,
        done: &mut usize,
    ) -> Result<()> {
        check_fault(dp)?;
        let step = size.bytes();
        dp.select(self.select_value(ApAddr::DRW))?;
        self.ensure_csw(dp, size)?;
        check_fault(dp)?;

        let mut addr = src;
        let mut remaining = (dest.len() as u32) / step;
        while remaining > 0 {
            let span = span_units(addr, step, remaining);
            self.ensure_tar(dp, addr)?;
            check_fault(dp)?;

            // Prime the posted-read pipeline; the stale value is discarded.
            dp.low_access(APnDP::AP, RnW::R, ApAddr::DRW.offset(), 0)?;
            check_fault(dp)?;

            for unit in 0..span {
                let value = if unit < span - 1 {
                    dp.low_access(APnDP::AP, RnW::R, ApAddr::DRW.offset(), 0)?
                } else {
                    dp.low_access(APnDP::DP, RnW::R, DpRegister::RDBUFF as u8, 0)?
                };
                check_fault(dp)?;

                let unit_addr = addr + unit * step;
                let lane = extract_lane(value, unit_addr, size);
                let bytes = lane.to_le_bytes();
                dest[*done..*done + step as usize].copy_from_slice(&bytes[..step as usize]);
                *done += step as usize;
            }

            addr += span * step;
            remaining -= span;
            self.retire_tar(addr);
        }
        Ok(())
    }

    fn mem_write_inner<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        dest: u32,
        src: &[u8],
        size: AccessSize,
        done: &mut usize,
    ) -> Result<()> {
        check_fault(dp)?;
        let step = size.bytes();
        dp.select(self.select_value(ApAddr::DRW))?;
        self.ensure_csw(dp, size)?;
        check_fault(dp)?;

        let mut addr = dest;
        let mut remaining = (src.len() as u32) / step;
        while remaining > 0 {
            let span = span_units(addr, step, remaining);
            self.ensure_tar(dp, addr)?;
            check_fault(dp)?;

            for unit in 0..span {
                let unit_addr = addr + unit * step;
                let mut bytes = [0u8; 4];
                bytes[..step as usize].copy_from_slice(&src[*done..*done + step as usize]);
                let value = place_lane(u32::from_le_bytes(bytes), unit_addr, size);
                dp.low_access(APnDP::AP, RnW::W, ApAddr::DRW.offset(), value)?;
                check_fault(dp)?;
                *done += step as usize;
            }

            addr += span * step;
            remaining -= span;
            self.retire_tar(addr);
        }
        Ok(())
    }

    fn mem_fault<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        transferred: usize,
        cause: Error,
    ) -> MemoryFault {
        self.invalidate_caches();
        if cause == Error::AckFault {
            // Cancel whatever the AP still has in flight; the sticky state
            // is the caller's to clear.
            let _ = dp.abort(Abort::DAPABORT);
        }
        debug!("mem: transfer stopped after {} bytes", transferred);
        MemoryFault { transferred, cause }
    }

    /// Read one aligned word of target memory.
    pub fn mem_read_word<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: u32,
    ) -> Result<u32> {
        self.mem_unit_read(dp, addr, AccessSize::Word)
    }

    /// Read one aligned halfword of target memory.
    pub fn mem_read_halfword<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: u32,
    ) -> Result<u16> {
        Ok(self.mem_unit_read(dp, addr, AccessSize::Halfword)? as u16)
    }

    /// Write one aligned word of target memory.
    pub fn mem_write_word<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: u32,
        value: u32,
    ) -> Result<()> {
        self.mem_unit_write(dp, addr, value, AccessSize::Word)
    }

    /// Write one aligned halfword of target memory.
    pub fn mem_write_halfword<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: u32,
        value: u16,
    ) -> Result<()> {
        self.mem_unit_write(dp, addr, value as u32, AccessSize::Halfword)
    }

    fn mem_unit_read<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: u32,
        size: AccessSize,
    ) -> Result<u32> {
        dp.select(self.select_value(ApAddr::DRW))?;
        self.ensure_csw(dp, size)?;
        self.ensure_tar(dp, addr)?;
        let value = dp.read_ap(ApAddr::DRW.offset())?;
        if dp.fault() {
            self.invalidate_caches();
            return Ok(0);
        }
        self.retire_tar(addr.wrapping_add(size.bytes()));
        Ok(extract_lane(value, addr, size))
    }

    fn mem_unit_write<LA: LowAccess>(
        &mut self,
        dp: &mut DebugPort<LA>,
        addr: u32,
        value: u32,
        size: AccessSize,
    ) -> Result<()> {
        dp.select(self.select_value(ApAddr::DRW))?;
        self.ensure_csw(dp, size)?;
        self.ensure_tar(dp, addr)?;
        dp.write_ap(ApAddr::DRW.offset(), place_lane(value, addr, size))?;
        if dp.fault() {
            self.invalidate_caches();
            return Ok(());
        }
        self.retire_tar(addr.wrapping_add(size.bytes()));
        Ok(())
    }
}

/// Units until the end of the current auto-increment span, capped at what
/// is left to transfer.
fn span_units(addr: u32, step: u32, remaining: u32) -> u32 {
    ((TAR_AUTOINC_SPAN - (addr & (TAR_AUTOINC_SPAN - 1))) / step).min(remaining)
}

fn check_fault<LA: LowAccess>(dp: &DebugPort<LA>) -> Result<()> {
    if dp.fault() {
        Err(Error::AckFault)
    } else {
        Ok(())
    }
}

/// Enumerate the access ports behind `dp`.
///
/// An IDR of zero conventionally means "no AP here"; `policy` decides
/// whether that ends the scan or just skips the slot.
pub fn ap_scan<LA: LowAccess>(
    dp: &mut DebugPort<LA>,
    policy: ScanPolicy,
) -> Result<Vec<AccessPort>> {
    let mut found = Vec::new();
    for apsel in 0..=255u8 {
        match AccessPort::probe(dp, apsel)? {
            Some(ap) => {
                info!("ap {}: IDR {:08x}", apsel, ap.idr());
                found.push(ap);
            }
            None if policy == ScanPolicy::StopAtFirstEmpty => break,
            None => {}
        }
    }
    info!("ap scan: {} access ports", found.len());
    Ok(found)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock_target::{TargetModel, TestTimer};
    use crate::swd::SwdDp;

    type TestDp = DebugPort<SwdDp<TargetModel, TestTimer>>;

    fn setup(model: TargetModel) -> (TestDp, AccessPort) {
        let mut dp = DebugPort::new(SwdDp::new(model, TestTimer::new()), 0);
        let mut aps = ap_scan(&mut dp, ScanPolicy::StopAtFirstEmpty).unwrap();
        (dp, aps.remove(0))
    }

    fn patterned_model() -> TargetModel {
        let mut model = TargetModel::new();
        for i in 0..model.mem.len() {
            model.mem[i] = (i as u8).wrapping_mul(7).wrapping_add(3);
        }
        model
    }

    #[test]
    fn discovery_probes_the_ap() {
        let (_, ap) = setup(TargetModel::new());
        assert_eq!(ap.apsel(), 0);
        assert_eq!(ap.idr(), 0x2477_0011);
        assert_eq!(ap.base(), 0xE00F_F003);
    }

    #[test]
    fn block_read_matches_single_word_reads() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());

        let mut block = [0u8; 8 * 4];
        ap.mem_read(&mut dp, &mut block, base).unwrap();

        let mut singles = [0u8; 8 * 4];
        for i in 0..8 {
            let word = ap.mem_read_word(&mut dp, base + 4 * i as u32).unwrap();
            singles[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
        assert_eq!(block, singles);
    }

    #[test]
    fn csw_and_tar_writes_are_cached() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());

        let mut buf = [0u8; 8];
        ap.mem_read(&mut dp, &mut buf, base).unwrap();
        ap.mem_read(&mut dp, &mut buf, base + 8).unwrap();

        let model = dp.into_link().tap;
        assert_eq!(model.writes_to(ApAddr::CSW.0), 1);
        // The second transfer continues where auto-increment left TAR.
        assert_eq!(model.writes_to(ApAddr::TAR.0), 1);
    }

    #[test]
    fn cache_invalidation_forces_rewrites() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());

        let mut buf = [0u8; 8];
        ap.mem_read(&mut dp, &mut buf, base).unwrap();
        ap.invalidate_caches();
        ap.mem_read(&mut dp, &mut buf, base + 8).unwrap();

        let model = dp.into_link().tap;
        assert_eq!(model.writes_to(ApAddr::CSW.0), 2);
        assert_eq!(model.writes_to(ApAddr::TAR.0), 2);
    }

    #[test]
    fn tar_is_rewritten_at_the_wrap_boundary() {
        // The model's auto-increment genuinely wraps at 10 bits, so this
        // only passes if the engine rewrites TAR when crossing.
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());
        let start = base + TAR_AUTOINC_SPAN - 8;

        let mut buf = [0u8; 16];
        ap.mem_read(&mut dp, &mut buf, start).unwrap();

        let model = dp.into_link().tap;
        let expect = &model.mem[(TAR_AUTOINC_SPAN - 8) as usize..(TAR_AUTOINC_SPAN + 8) as usize];
        assert_eq!(&buf[..], expect);
        assert_eq!(model.writes_to(ApAddr::TAR.0), 2);
    }

    #[test]
    fn unaligned_access_uses_byte_lanes() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());

        let mut bytes = [0u8; 5];
        ap.mem_read(&mut dp, &mut bytes, base + 1).unwrap();
        let model = dp.link().tap.mem.clone();
        assert_eq!(&bytes, &model[1..6]);

        ap.mem_write(&mut dp, base + 3, &[0xAA, 0xBB, 0xCC]).unwrap();
        let model = dp.link().tap.mem.clone();
        assert_eq!(&model[3..6], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn halfword_access_is_lane_correct() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());

        let upper = ap.mem_read_halfword(&mut dp, base + 6).unwrap();
        let mem = &dp.link().tap.mem;
        assert_eq!(upper, u16::from_le_bytes([mem[6], mem[7]]));

        ap.mem_write_halfword(&mut dp, base + 6, 0xBEEF).unwrap();
        let mem = &dp.link().tap.mem;
        assert_eq!(u16::from_le_bytes([mem[6], mem[7]]), 0xBEEF);
        // The neighbouring halfword is untouched.
        assert_eq!(mem[4], patterned_model().mem[4]);
        assert_eq!(mem[5], patterned_model().mem[5]);
    }

    #[test]
    fn block_write_lands_in_memory() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(TargetModel::new());

        let data: alloc::vec::Vec<u8> = (0..64u8).collect();
        ap.mem_write(&mut dp, base + 16, &data).unwrap();
        assert_eq!(&dp.link().tap.mem[16..80], &data[..]);
    }

    #[test]
    fn mid_transfer_fault_reports_confirmed_bytes() {
        let base = TargetModel::new().mem_base;
        let (mut dp, mut ap) = setup(patterned_model());

        // Count past the AP accesses the scan already made. CSW and TAR
        // take two, the prime a third, then one data unit lands before the
        // fifth AP access faults.
        let used = dp.link().tap.ap_accesses();
        tap_mut(&mut dp).fault_after_ap_accesses = Some(used + 4);

        let mut buf = [0u8; 16];
        let fault = ap.mem_read(&mut dp, &mut buf, base).unwrap_err();
        assert_eq!(fault.cause, Error::AckFault);
        assert_eq!(fault.transferred, 4);
        assert!(dp.fault());
        // The engine cancelled the stream and recovery still works.
        assert!(dp
            .link()
            .tap
            .aborts
            .iter()
            .any(|a| a & Abort::DAPABORT.bits() != 0));
        assert!(dp.error().unwrap() != 0);
        assert!(!dp.fault());
    }

    #[test]
    fn latched_fault_blocks_transfers_up_front() {
        let (mut dp, mut ap) = setup(TargetModel::new());
        let used = dp.link().tap.ap_accesses();
        tap_mut(&mut dp).fault_after_ap_accesses = Some(used);

        // Latch the fault with a throwaway register access.
        ap.read(&mut dp, ApAddr::CSW).unwrap();
        assert!(dp.fault());

        let mut buf = [0u8; 8];
        let fault = ap.mem_read(&mut dp, &mut buf, 0x2000_0000).unwrap_err();
        assert_eq!(fault.transferred, 0);
        assert_eq!(fault.cause, Error::AckFault);
    }

    #[test]
    fn scan_policies_differ_on_sparse_numbering() {
        let mut model = TargetModel::new();
        model.extra_aps.push((2, 0x4477_0004));
        let mut dp = DebugPort::new(SwdDp::new(model, TestTimer::new()), 0);

        let dense = ap_scan(&mut dp, ScanPolicy::StopAtFirstEmpty).unwrap();
        assert_eq!(dense.len(), 1);

        let all = ap_scan(&mut dp, ScanPolicy::Exhaustive).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].apsel(), 2);
        assert_eq!(all[1].idr(), 0x4477_0004);
    }

    #[test]
    fn scan_survives_faulting_empty_slots() {
        let mut model = TargetModel::new();
        model.extra_aps.push((2, 0x4477_0004));
        model.missing_ap_faults = true;
        let mut dp = DebugPort::new(SwdDp::new(model, TestTimer::new()), 0);

        let all = ap_scan(&mut dp, ScanPolicy::Exhaustive).unwrap();
        assert_eq!(all.len(), 2);
        assert!(!dp.fault());
    }

    #[test]
    fn banking_writes_select_once_per_bank() {
        let (mut dp, mut ap) = setup(TargetModel::new());
        let selects = dp.link().tap.selects.clone();
        // Discovery ends on bank 0 (CSW); reading IDR banks to 0xF0 once,
        // and a repeat read stays there.
        ap.read(&mut dp, ApAddr::IDR).unwrap();
        ap.read(&mut dp, ApAddr::BASE).unwrap();
        let now = dp.link().tap.selects.clone();
        assert_eq!(now.len(), selects.len() + 1);
        assert_eq!(*now.last().unwrap(), 0x0000_00F0);
    }

    /// Reach through the port for fault-injection knobs mid-test.
    fn tap_mut(dp: &mut TestDp) -> &mut TargetModel {
        &mut dp.link_mut().tap
    }
}
