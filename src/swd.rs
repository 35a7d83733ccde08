//! The SW-DP link variant: request framing, ack handling and the line-reset
//! scan that brings a target out of JTAG mode and synchronises on IDCODE.

use num_enum::TryFromPrimitive;

use crate::dp::{DebugPort, DpRegister, Error, LowAccess, Result, TransferConfig};
use crate::tap::{SwdTap, Timer};

/// Encode if a transaction is for AP or DP.
#[repr(u8)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum APnDP {
    /// For DP.
    DP = 0,
    /// For AP.
    AP = 1,
}

/// Encode if a transaction is a read or a write.
#[repr(u8)]
#[derive(PartialEq, Eq, Copy, Clone, Debug, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RnW {
    /// Write flag.
    W = 0,
    /// Read flag.
    R = 1,
}

/// The different kinds of SWD Ack.
#[repr(u8)]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Ack {
    Ok = 0b001,
    Wait = 0b010,
    Fault = 0b100,
    Protocol = 0b111,
}

impl Ack {
    /// Decode a 3-bit ack into the matching transaction result.
    pub fn try_ok(ack: u8) -> Result<()> {
        match ack {
            v if v == (Ack::Ok as u8) => Ok(()),
            v if v == (Ack::Wait as u8) => Err(Error::AckWait),
            v if v == (Ack::Fault as u8) => Err(Error::AckFault),
            v if v == (Ack::Protocol as u8) => Err(Error::AckProtocol),
            _ => Err(Error::AckUnknown(ack)),
        }
    }
}

/// Build an 8-bit SWD request: start, APnDP, RnW, A[2:3], parity, stop, park.
///
/// `addr` is the register byte address; only A[3:2] go on the wire.
pub fn make_request(apndp: APnDP, rnw: RnW, addr: u8) -> u8 {
    let req = 1 | ((apndp as u8) << 1) | ((rnw as u8) << 2) | ((addr & 0xC) << 1) | (1 << 7);
    let parity = (req.count_ones() & 1) as u8;
    req | (parity << 5)
}

/// The 16-bit JTAG-to-SWD switch sequence, sent LSB first.
const JTAG_TO_SWD: u32 = 0xE79E;

/// High cycles in a line reset; the specification demands at least 50.
const LINE_RESET_CYCLES: usize = 50;

/// The IDCODE read request used to synchronise after a line reset.
const IDCODE_REQUEST: u8 = 0xA5;

/// Hold the line high for a full reset period.
fn line_reset<TAP: SwdTap>(tap: &mut TAP) {
    for _ in 0..LINE_RESET_CYCLES {
        tap.bit_out(true);
    }
}

/// SW-DP low-level access over an [`SwdTap`].
pub struct SwdDp<TAP, T> {
    pub(crate) tap: TAP,
    timer: T,
    config: TransferConfig,
}

impl<TAP: SwdTap, T: Timer> SwdDp<TAP, T> {
    /// Wrap an already-synchronised link. Most callers want
    /// [`SwdDp::scan`] instead.
    pub fn new(tap: TAP, timer: T) -> Self {
        Self::with_config(tap, timer, TransferConfig::default())
    }

    /// Like [`SwdDp::new`] with explicit transfer knobs.
    pub fn with_config(tap: TAP, timer: T, config: TransferConfig) -> Self {
        SwdDp { tap, timer, config }
    }

    /// Reset the line, switch the target to SWD and synchronise on IDCODE.
    ///
    /// Returns `None` when the IDCODE read does not come back with an OK ack
    /// and good parity; nothing is constructed in that case and the scan can
    /// simply be retried.
    pub fn scan(tap: TAP, timer: T) -> Option<DebugPort<Self>> {
        Self::scan_with_config(tap, timer, TransferConfig::default())
    }

    /// Like [`SwdDp::scan`] with explicit transfer knobs.
    pub fn scan_with_config(
        mut tap: TAP,
        timer: T,
        config: TransferConfig,
    ) -> Option<DebugPort<Self>> {
        tap.init();
        line_reset(&mut tap);
        tap.seq_out(JTAG_TO_SWD, 16);
        line_reset(&mut tap);
        tap.seq_out(0, 16);

        // Read IDCODE by hand so the ack can be checked before any debug
        // port object exists.
        tap.seq_out(IDCODE_REQUEST as u32, 8);
        let ack = tap.seq_in(3) as u8;
        if Ack::try_ok(ack).is_err() {
            debug!("swd scan: no sync, ack {}", ack);
            return None;
        }
        let (idcode, parity_ok) = tap.seq_in_parity(32);
        tap.seq_out(0, 8);
        if !parity_ok {
            debug!("swd scan: parity error on IDCODE");
            return None;
        }

        info!("swd scan: IDCODE {:08x}", idcode);
        let mut dp = DebugPort::new(SwdDp { tap, timer, config }, idcode);
        // Start from a clean slate, like any fresh synchronisation.
        dp.error().ok()?;
        Some(dp)
    }
}

impl<TAP: SwdTap, T: Timer> LowAccess for SwdDp<TAP, T> {
    fn low_access(&mut self, port: APnDP, dir: RnW, addr: u8, value: u32) -> Result<u32> {
        let request = make_request(port, dir, addr);
        trace!("swd {:?} {:?} {:02x}", port, dir, addr);

        let start = self.timer.now_ms();
        loop {
            self.tap.seq_out(request as u32, 8);
            let ack = self.tap.seq_in(3) as u8;
            match Ack::try_ok(ack) {
                Ok(()) => break,
                Err(Error::AckWait) => {
                    if self.timer.now_ms().wrapping_sub(start) > self.config.wait_timeout_ms {
                        debug!("swd: WAIT past {} ms, giving up", self.config.wait_timeout_ms);
                        return Err(Error::Timeout);
                    }
                    self.timer.delay_us(self.config.retry_delay_us);
                }
                Err(e) => return Err(e),
            }
        }

        let response = if dir == RnW::R {
            let (value, parity_ok) = self.tap.seq_in_parity(32);
            // Idle cycles so the transaction lands before the line goes
            // quiet, then report the parity verdict.
            self.tap.seq_out(0, 8);
            if !parity_ok {
                return Err(Error::BadParity);
            }
            value
        } else {
            self.tap.seq_out_parity(value, 32);
            self.tap.seq_out(0, 8);
            0
        };

        Ok(response)
    }

    fn write_abort(&mut self, value: u32) -> Result<()> {
        // Address 0x0 is ABORT on a write.
        self.low_access(APnDP::DP, RnW::W, DpRegister::IDCODE as u8, value)
            .map(drop)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mock_target::{TargetModel, TestTimer};

    #[test]
    fn request_bytes_are_bit_exact() {
        // The canonical request bytes from the ADIv5 specification.
        assert_eq!(make_request(APnDP::DP, RnW::R, 0x0), 0xA5);
        assert_eq!(make_request(APnDP::DP, RnW::W, 0x0), 0x81);
        assert_eq!(make_request(APnDP::DP, RnW::R, 0x4), 0x8D);
        assert_eq!(make_request(APnDP::DP, RnW::W, 0x8), 0xB1);
        assert_eq!(make_request(APnDP::DP, RnW::R, 0xC), 0xBD);
        assert_eq!(make_request(APnDP::AP, RnW::R, 0xC), 0x9F);
        assert_eq!(make_request(APnDP::AP, RnW::W, 0x0), 0xA3);
    }

    #[test]
    fn ack_decode() {
        assert_eq!(Ack::try_ok(0b001), Ok(()));
        assert_eq!(Ack::try_ok(0b010), Err(Error::AckWait));
        assert_eq!(Ack::try_ok(0b100), Err(Error::AckFault));
        assert_eq!(Ack::try_ok(0b111), Err(Error::AckProtocol));
        assert_eq!(Ack::try_ok(0b101), Err(Error::AckUnknown(0b101)));
    }

    #[test]
    fn scan_finds_a_debug_port() {
        let mut model = TargetModel::new();
        model.idcode = 0x2BA0_1477;
        let dp = SwdDp::scan(model, TestTimer::new()).unwrap();
        assert_eq!(dp.idcode(), 0x2BA0_1477);
    }

    #[test]
    fn scan_emits_the_switch_sequence() {
        let dp = SwdDp::scan(TargetModel::new(), TestTimer::new()).unwrap();
        let (_, model) = dp_parts(dp);
        assert_eq!(model.switch_sequences, 1);
        assert!(model.line_resets >= 2);
    }

    #[test]
    fn scan_fails_cleanly_on_wait() {
        let mut model = TargetModel::new();
        model.wait_acks = 1;
        assert!(SwdDp::scan(model, TestTimer::new()).is_none());
    }

    #[test]
    fn scan_fails_cleanly_on_bad_parity() {
        let mut model = TargetModel::new();
        model.corrupt_read_parity = true;
        assert!(SwdDp::scan(model, TestTimer::new()).is_none());
    }

    #[test]
    fn wait_is_retried_until_ok() {
        for k in [1usize, 3, 7] {
            let mut model = TargetModel::new();
            model.wait_acks = k;
            let mut link = SwdDp::new(model, TestTimer::new());
            let value = link.low_access(APnDP::DP, RnW::R, 0x0, 0).unwrap();
            assert_eq!(value, TargetModel::new().idcode);
            // Exactly k WAITed attempts plus the one that succeeded.
            assert_eq!(link.tap.requests, k + 1);
        }
    }

    #[test]
    fn endless_wait_times_out() {
        let mut model = TargetModel::new();
        model.wait_forever = true;
        // 300 ms per clock reading: the 2000 ms window closes quickly.
        let mut link = SwdDp::new(model, TestTimer::with_step(300));
        assert_eq!(
            link.low_access(APnDP::DP, RnW::R, 0x0, 0),
            Err(Error::Timeout)
        );
        assert!(link.tap.requests > 1);
    }

    #[test]
    fn read_parity_error_is_fatal() {
        let mut model = TargetModel::new();
        model.corrupt_read_parity = true;
        let mut link = SwdDp::new(model, TestTimer::new());
        assert_eq!(
            link.low_access(APnDP::DP, RnW::R, 0x0, 0),
            Err(Error::BadParity)
        );
    }

    #[test]
    fn protocol_ack_is_not_retried() {
        let mut model = TargetModel::new();
        model.protocol_acks = 1;
        let mut link = SwdDp::new(model, TestTimer::new());
        assert_eq!(
            link.low_access(APnDP::DP, RnW::R, 0x0, 0),
            Err(Error::AckProtocol)
        );
        assert_eq!(link.tap.requests, 1);
    }

    /// Tear a test debug port apart to inspect the model underneath.
    fn dp_parts(
        dp: DebugPort<SwdDp<TargetModel, TestTimer>>,
    ) -> (u32, TargetModel) {
        let idcode = dp.idcode();
        (idcode, dp.into_link().tap)
    }
}
