//! Transport seams: the bit-level tap primitives the engine is built on.
//!
//! The engine never touches pins. A platform provides an [`SwdTap`] or a
//! [`JtagTap`] (GPIO bit-banging, a hardware SPI block, an FTDI adapter, ...)
//! plus a [`Timer`] for the bounded WAIT-retry window, and the rest of the
//! crate drives those.

pub use embedded_hal::delay::DelayNs;

/// Ordered bit-sequence I/O over the two-wire SWD link.
///
/// Sequences are transferred LSB first. Direction turnaround is the tap's
/// responsibility: an input sequence following an output sequence (and vice
/// versa) must include the mandated turnaround clock cycle, so callers never
/// see it.
pub trait SwdTap {
    /// Bring the pins into a state where the link can be driven.
    fn init(&mut self);

    /// Clock out a single bit.
    fn bit_out(&mut self, bit: bool);

    /// Clock out the low `bits` bits of `value`.
    fn seq_out(&mut self, value: u32, bits: u8);

    /// Clock out the low `bits` bits of `value`, followed by an even parity
    /// bit over them.
    fn seq_out_parity(&mut self, value: u32, bits: u8);

    /// Clock in `bits` bits.
    fn seq_in(&mut self, bits: u8) -> u32;

    /// Clock in `bits` bits followed by a parity bit; the `bool` reports
    /// whether the received parity matched.
    fn seq_in_parity(&mut self, bits: u8) -> (u32, bool);
}

/// IR/DR shifts on a single, already-selected JTAG TAP.
///
/// Scan chains with multiple devices are the tap implementation's concern:
/// it pads the shifts with the bypass bits for the devices before and after
/// the selected one.
pub trait JtagTap {
    /// Bring the pins into a state where the link can be driven.
    fn init(&mut self);

    /// Shift `ir` into the instruction register.
    fn shift_ir(&mut self, ir: u32);

    /// Shift `bits` bits through the data register, returning the captured
    /// bits. LSB first in both directions.
    fn shift_dr(&mut self, out: u64, bits: u8) -> u64;
}

/// A monotonic millisecond clock on top of [`DelayNs`].
///
/// `now_ms` bounds the WAIT-retry loop against wall time; the delay side
/// paces retries so a busy target is not hammered at wire speed.
pub trait Timer: DelayNs {
    /// Milliseconds since some fixed point. Wrapping is fine; elapsed times
    /// are computed with wrapping subtraction.
    fn now_ms(&mut self) -> u32;
}
