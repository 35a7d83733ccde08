//! The ADIv5 Debug Port: register file, sticky-fault handling and the
//! dispatch seam between the SWD and JTAG link variants.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::swd::{APnDP, RnW};

/// The errors a DP/AP transaction can surface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Ack not yet ready. Handled by the retry loop; callers only see it as
    /// [`Error::Timeout`] once the retry window is exhausted.
    AckWait,
    /// A fault. Latched by [`DebugPort`] rather than propagated.
    AckFault,
    /// The line was not driven during the ack phase.
    AckProtocol,
    /// Unknown ack pattern.
    AckUnknown(u8),
    /// Parity error on read data.
    BadParity,
    /// The target kept answering WAIT past the retry window.
    Timeout,
}

/// The definition of DP/AP transaction results.
pub type Result<T> = core::result::Result<T, Error>;

/// Available DP registers.
///
/// Address 0x0 reads as IDCODE and writes as ABORT.
#[repr(u8)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum DpRegister {
    IDCODE = 0x0,
    CTRLSTAT = 0x4,
    SELECT = 0x8,
    RDBUFF = 0xC,
}

bitflags! {
    /// DP CTRL/STAT register bits.
    pub struct CtrlStat: u32 {
        /// System power-up acknowledge.
        const CSYSPWRUPACK = 1 << 31;
        /// System power-up request.
        const CSYSPWRUPREQ = 1 << 30;
        /// Debug power-up acknowledge.
        const CDBGPWRUPACK = 1 << 29;
        /// Debug power-up request.
        const CDBGPWRUPREQ = 1 << 28;
        /// Debug reset acknowledge.
        const CDBGRSTACK = 1 << 27;
        /// Debug reset request.
        const CDBGRSTREQ = 1 << 26;
        /// Write data error (SW-DP only).
        const WDATAERR = 1 << 7;
        /// Last AP read was OK (SW-DP only).
        const READOK = 1 << 6;
        /// Sticky error.
        const STICKYERR = 1 << 5;
        /// Sticky compare.
        const STICKYCMP = 1 << 4;
        /// Sticky overrun.
        const STICKYORUN = 1 << 1;
        /// Overrun detection enable.
        const ORUNDETECT = 1 << 0;
    }
}

bitflags! {
    /// DP ABORT register bits.
    pub struct Abort: u32 {
        /// Clear STICKYORUN.
        const ORUNERRCLR = 1 << 4;
        /// Clear WDATAERR.
        const WDERRCLR = 1 << 3;
        /// Clear STICKYERR.
        const STKERRCLR = 1 << 2;
        /// Clear STICKYCMP.
        const STKCMPCLR = 1 << 1;
        /// Abort the current AP transaction (SW-DP only).
        const DAPABORT = 1 << 0;
    }
}

impl CtrlStat {
    /// The four sticky error flags reported by [`DebugPort::error`].
    pub const STICKY_MASK: CtrlStat = CtrlStat::from_bits_truncate(
        CtrlStat::STICKYORUN.bits()
            | CtrlStat::STICKYCMP.bits()
            | CtrlStat::STICKYERR.bits()
            | CtrlStat::WDATAERR.bits(),
    );
}

/// Knobs shared by both link variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferConfig {
    /// Wall-clock window a transaction may keep answering WAIT before the
    /// engine gives up with [`Error::Timeout`].
    pub wait_timeout_ms: u32,
    /// Back-off between WAIT retries.
    pub retry_delay_us: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            wait_timeout_ms: 2000,
            retry_delay_us: 10,
        }
    }
}

/// CTRL/STAT polls before a power-up handshake is abandoned.
const POWER_UP_ATTEMPTS: usize = 100;

/// One DP-or-AP register transaction over a concrete link.
///
/// Implemented by [`crate::swd::SwdDp`] and [`crate::jtag::JtagDp`]; a link
/// is picked once at scan time and never changes for the life of the
/// session.
pub trait LowAccess {
    /// Execute a single register transaction, running the ack/retry state
    /// machine. The returned value is meaningful for reads only.
    fn low_access(&mut self, port: APnDP, dir: RnW, addr: u8, value: u32) -> Result<u32>;

    /// Write the ABORT register through the link-specific path.
    fn write_abort(&mut self, value: u32) -> Result<()>;

    /// Read a DP register, applying any link-specific read posting.
    ///
    /// SW-DP reads return their data in the same transaction, so the default
    /// is a plain `low_access`. JTAG-DP overrides this: there every scan
    /// captures the *previous* result, so a DP read needs a trailing RDBUFF
    /// scan just like an AP read does.
    fn dp_read(&mut self, addr: u8) -> Result<u32> {
        self.low_access(APnDP::DP, RnW::R, addr, 0)
    }
}

/// An ADIv5 debug port on the far end of a synchronised link.
///
/// Owns the link variant, the sticky-fault latch and the cached SELECT
/// value. Created by [`crate::swd::SwdDp::scan`] or
/// [`crate::jtag::JtagDp::attach`]; access ports borrow it per operation.
pub struct DebugPort<LA> {
    link: LA,
    idcode: u32,
    fault: bool,
    select_cache: Option<u32>,
}

impl<LA: LowAccess> DebugPort<LA> {
    /// Wrap an already-synchronised link.
    pub fn new(link: LA, idcode: u32) -> Self {
        DebugPort {
            link,
            idcode,
            fault: false,
            select_cache: None,
        }
    }

    /// The IDCODE captured when the link was synchronised.
    pub fn idcode(&self) -> u32 {
        self.idcode
    }

    /// Tear the port down and hand the link back, e.g. on detach.
    pub fn into_link(self) -> LA {
        self.link
    }

    /// Borrow the underlying link.
    pub fn link(&self) -> &LA {
        &self.link
    }

    /// Borrow the underlying link mutably, e.g. to retune it. The caller is
    /// responsible for not disturbing a transaction in flight.
    pub fn link_mut(&mut self) -> &mut LA {
        &mut self.link
    }

    /// Whether a FAULT acknowledge has been latched.
    ///
    /// While latched, AP-addressed accesses are skipped entirely and read as
    /// zero; [`DebugPort::error`] clears the latch.
    pub fn fault(&self) -> bool {
        self.fault
    }

    /// Latch a fault instead of propagating it, per the ADIv5 sticky-fault
    /// model: the access reads as zero and the caller decides when to
    /// recover.
    fn latch(&mut self, result: Result<u32>) -> Result<u32> {
        match result {
            Err(Error::AckFault) => {
                debug!("dp: FAULT latched");
                self.fault = true;
                Ok(0)
            }
            other => other,
        }
    }

    /// A single raw register transaction.
    ///
    /// AP-addressed traffic is short-circuited to zero while the fault latch
    /// is set, so a known-bad link state is not compounded.
    pub fn low_access(&mut self, port: APnDP, dir: RnW, addr: u8, value: u32) -> Result<u32> {
        if port == APnDP::AP && self.fault {
            return Ok(0);
        }
        let result = self.link.low_access(port, dir, addr, value);
        self.latch(result)
    }

    /// Read a DP register.
    pub fn read(&mut self, reg: DpRegister) -> Result<u32> {
        let result = self.link.dp_read(reg as u8);
        self.latch(result)
    }

    /// Write a DP register.
    pub fn write(&mut self, reg: DpRegister, value: u32) -> Result<()> {
        self.low_access(APnDP::DP, RnW::W, reg as u8, value)?;
        if reg == DpRegister::SELECT {
            // A faulted write never reached the register.
            self.select_cache = if self.fault { None } else { Some(value) };
        }
        Ok(())
    }

    /// Read an AP register at `addr` (A[3:2] within the selected bank).
    ///
    /// AP reads are posted: the first transaction issues the access and
    /// returns the previous pipelined value, which is discarded; the real
    /// result is fetched with a trailing RDBUFF read.
    pub fn read_ap(&mut self, addr: u8) -> Result<u32> {
        self.low_access(APnDP::AP, RnW::R, addr, 0)?;
        self.low_access(APnDP::DP, RnW::R, DpRegister::RDBUFF as u8, 0)
    }

    /// Write an AP register at `addr` (A[3:2] within the selected bank).
    pub fn write_ap(&mut self, addr: u8, value: u32) -> Result<()> {
        self.low_access(APnDP::AP, RnW::W, addr, value).map(drop)
    }

    /// Write SELECT, skipping the transaction when the cached value already
    /// matches. The cache is only an optimisation: it is dropped on faults
    /// and may be dropped by [`DebugPort::invalidate_select_cache`] whenever
    /// another agent may have touched the link.
    pub(crate) fn select(&mut self, value: u32) -> Result<()> {
        if self.select_cache == Some(value) {
            return Ok(());
        }
        self.write(DpRegister::SELECT, value)
    }

    /// Forget the cached SELECT value, forcing the next banked access to
    /// rewrite it. Required after a multidrop hand-off or an external reset.
    pub fn invalidate_select_cache(&mut self) {
        self.select_cache = None;
    }

    /// Read the sticky error flags, clear them through ABORT, drop the fault
    /// latch and return the pre-clear [`CtrlStat`] mask for diagnostics.
    pub fn error(&mut self) -> Result<u32> {
        let status = CtrlStat::from_bits_truncate(self.read(DpRegister::CTRLSTAT)?);
        let sticky = status & CtrlStat::STICKY_MASK;

        let mut clear = Abort::empty();
        if sticky.contains(CtrlStat::STICKYORUN) {
            clear |= Abort::ORUNERRCLR;
        }
        if sticky.contains(CtrlStat::STICKYCMP) {
            clear |= Abort::STKCMPCLR;
        }
        if sticky.contains(CtrlStat::STICKYERR) {
            clear |= Abort::STKERRCLR;
        }
        if sticky.contains(CtrlStat::WDATAERR) {
            clear |= Abort::WDERRCLR;
        }

        // The clear write itself runs through the latch: a FAULT on it is
        // swallowed like any other, and the flag is dropped right after.
        let cleared = self.link.write_abort(clear.bits()).map(|()| 0);
        self.latch(cleared)?;
        self.fault = false;

        if !sticky.is_empty() {
            debug!("dp: cleared sticky errors {:08x}", sticky.bits());
        }
        Ok(sticky.bits())
    }

    /// Direct ABORT write, e.g. [`Abort::DAPABORT`] to cancel an in-flight
    /// AP transaction after a fault. Does not clear the fault latch; use
    /// [`DebugPort::error`] to recover.
    pub fn abort(&mut self, bits: Abort) -> Result<()> {
        let result = self.link.write_abort(bits.bits()).map(|()| 0);
        self.latch(result).map(drop)
    }

    /// Request system and debug power-up and wait for both acknowledges.
    pub fn power_up(&mut self) -> Result<()> {
        let ctrlstat = self.read(DpRegister::CTRLSTAT)?;
        self.write(
            DpRegister::CTRLSTAT,
            ctrlstat | (CtrlStat::CSYSPWRUPREQ | CtrlStat::CDBGPWRUPREQ).bits(),
        )?;

        let acks = CtrlStat::CSYSPWRUPACK | CtrlStat::CDBGPWRUPACK;
        for _ in 0..POWER_UP_ATTEMPTS {
            let status = CtrlStat::from_bits_truncate(self.read(DpRegister::CTRLSTAT)?);
            if status.contains(acks) {
                return Ok(());
            }
        }
        warn!("dp: power-up acknowledge never asserted");
        Err(Error::Timeout)
    }
}
