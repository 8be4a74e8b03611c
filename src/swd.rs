//! L1: the SWD line driver.
//!
//! Turns one SWD transaction — `(APnDP, RnW, A[3:2], data?)` — into a
//! bridge command sequence and parses the reply, driving raw GPIO bits on
//! an FTDI MPSSE bridge rather than a probe's native SWD transfer command.

use log::{debug, trace, warn};

use crate::error::SwdError;
use crate::retry::retry;
use crate::transport::{mpsse, pins, Transport};

/// The 16-bit JTAG-to-SWD switch sequence, clocked LSB-first.
pub const JTAG_TO_SWD_SEQUENCE: u16 = 0x79E7;

/// How many WAIT acks a single transaction will ride out before surfacing
/// [`SwdError::ProtocolAckWait`]. Nothing in the wire protocol dictates the
/// number; it is purely a patience budget.
pub const WAIT_RETRIES: usize = 100;

const OUTPUT_PINS: u8 = pins::SWCLK | pins::SWDIO;
const INPUT_PINS: u8 = pins::SWCLK;

/// Transfer/fault/retry counters. Surfaced at `debug!` when a session tears
/// down, useful for diagnosing a noisy bus after the fact.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwdStatistics {
    pub transfers: u64,
    pub wait_retries: u64,
    pub faults: u64,
    pub parity_errors: u64,
}

impl SwdStatistics {
    pub fn log_summary(&self) {
        debug!(
            "swd stats: {} transfers, {} wait-retries, {} faults, {} parity errors",
            self.transfers, self.wait_retries, self.faults, self.parity_errors
        );
    }
}

/// The outcome of one single-shot wire transaction, before WAIT/FAULT
/// policy is applied.
enum RawAck {
    Ok(Option<u32>),
    Wait,
    Fault,
}

/// Drives the SWD line protocol over a [`Transport`], bit-banging MPSSE
/// "Set/Get Data Bits Low Byte" commands rather than issuing whole-byte
/// shift commands, since SWD's single bidirectional SWDIO line needs a
/// direction flip on every turnaround that a byte-wide shift command can't
/// express on its own.
pub struct SwdDriver<T: Transport> {
    transport: T,
    stats: SwdStatistics,
}

impl<T: Transport> SwdDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            stats: SwdStatistics::default(),
        }
    }

    pub fn stats(&self) -> SwdStatistics {
        self.stats
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn enter_reset(&mut self) -> Result<(), SwdError> {
        self.transport.assert_reset()?;
        Ok(())
    }

    pub fn leave_reset(&mut self) -> Result<(), SwdError> {
        self.transport.release_reset()?;
        Ok(())
    }

    pub fn configure(&mut self, frequency_hz: u32) -> Result<(), SwdError> {
        self.transport.configure(frequency_hz)?;
        Ok(())
    }

    /// Drives the line-reset sequence and reads DP.IDCODE, the mandatory
    /// first transaction afterward. Returns the IDCODE value;
    /// `0x0000_0000` or `0xffff_ffff` means no target answered.
    pub fn init(&mut self) -> Result<u32, SwdError> {
        self.line_reset()?;
        let idcode = self.read(false, 0)?;
        if idcode == 0 || idcode == 0xffff_ffff {
            warn!("no-target: IDCODE read as {idcode:#010x}");
            return Err(SwdError::NoTarget);
        }
        debug!("SWD target responds with IDCODE {idcode:#010x}");
        Ok(idcode)
    }

    fn line_reset(&mut self) -> Result<(), SwdError> {
        // >= 50 clocks with SWDIO high.
        self.clock_out_bits(std::iter::repeat(true).take(50))?;
        // 16-bit JTAG-to-SWD switch pattern, LSB first.
        let switch_bits = (0..16).map(|i| (JTAG_TO_SWD_SEQUENCE >> i) & 1 != 0);
        self.clock_out_bits(switch_bits)?;
        // >= 50 clocks with SWDIO high again.
        self.clock_out_bits(std::iter::repeat(true).take(50))?;
        // >= 2 idle low cycles.
        self.clock_out_bits(std::iter::repeat(false).take(2))?;
        Ok(())
    }

    /// Reads a DP register (`apndp = false`) or AP register (`apndp =
    /// true`) selected by `a23` (the A[3:2] field), retrying WAIT acks up to
    /// [`WAIT_RETRIES`] times.
    pub fn read(&mut self, apndp: bool, a23: u8) -> Result<u32, SwdError> {
        let mut waits = 0u64;
        let result = retry(WAIT_RETRIES, |_| {
            match self.transfer_once(apndp, true, a23, None)? {
                RawAck::Ok(value) => Ok(value.expect("read transfer always yields a value")),
                RawAck::Wait => {
                    waits += 1;
                    Err(SwdError::ProtocolAckWait)
                }
                RawAck::Fault => Err(SwdError::ProtocolFault),
            }
        });
        self.stats.transfers += 1;
        self.stats.wait_retries += waits;
        if matches!(result, Err(SwdError::ProtocolFault)) {
            self.stats.faults += 1;
        }
        result
    }

    /// Writes a DP or AP register, same addressing convention as
    /// [`Self::read`].
    pub fn write(&mut self, apndp: bool, a23: u8, data: u32) -> Result<(), SwdError> {
        let mut waits = 0u64;
        let result = retry(WAIT_RETRIES, |_| {
            match self.transfer_once(apndp, false, a23, Some(data))? {
                RawAck::Ok(_) => Ok(()),
                RawAck::Wait => {
                    waits += 1;
                    Err(SwdError::ProtocolAckWait)
                }
                RawAck::Fault => Err(SwdError::ProtocolFault),
            }
        });
        self.stats.transfers += 1;
        self.stats.wait_retries += waits;
        if matches!(result, Err(SwdError::ProtocolFault)) {
            self.stats.faults += 1;
        }
        result
    }

    fn transfer_once(
        &mut self,
        apndp: bool,
        rnw: bool,
        a23: u8,
        write_data: Option<u32>,
    ) -> Result<RawAck, SwdError> {
        let header = header_byte(apndp, rnw, a23);
        self.clock_out_bits((0..8).map(|i| (header >> i) & 1 != 0))?;

        // turnaround: host releases the line.
        self.clock_undriven(1)?;

        let ack_bits = self.clock_in_bits(3)?;
        let ack = (ack_bits[0] as u8) | (ack_bits[1] as u8) << 1 | (ack_bits[2] as u8) << 2;

        trace!("swd transfer apndp={apndp} rnw={rnw} a23={a23} ack={ack:#05b}");

        match ack {
            0b001 => {}
            0b010 => {
                self.clock_undriven(1)?;
                return Ok(RawAck::Wait);
            }
            0b100 => {
                self.clock_undriven(1)?;
                return Ok(RawAck::Fault);
            }
            _ => return Err(SwdError::NoTarget),
        }

        if rnw {
            let mut data_bits = self.clock_in_bits(33)?;
            let parity_bit = data_bits.pop().expect("33 bits requested");
            let mut value = 0u32;
            for (i, bit) in data_bits.iter().enumerate() {
                if *bit {
                    value |= 1 << i;
                }
            }
            self.clock_undriven(1)?;
            if (value.count_ones() % 2 == 1) != parity_bit {
                self.stats.parity_errors += 1;
                warn!("parity mismatch reading SWD data phase, value={value:#010x}");
                return Err(SwdError::ProtocolParity);
            }
            Ok(RawAck::Ok(Some(value)))
        } else {
            let data = write_data.expect("write transfer always carries data");
            self.clock_undriven(1)?;
            let parity = data.count_ones() % 2 == 1;
            let bits = (0..32)
                .map(move |i| (data >> i) & 1 != 0)
                .chain(std::iter::once(parity));
            self.clock_out_bits(bits)?;
            // idle cycles so the DP can latch the write.
            self.clock_out_bits(std::iter::repeat(false).take(8))?;
            Ok(RawAck::Ok(None))
        }
    }

    fn clock_out_bits(&mut self, bits: impl IntoIterator<Item = bool>) -> Result<(), SwdError> {
        let mut buf = Vec::new();
        for bit in bits {
            let value = if bit { pins::SWDIO } else { 0 };
            buf.extend_from_slice(&[mpsse::SET_BITS_LOW, value, OUTPUT_PINS]);
            buf.extend_from_slice(&[mpsse::SET_BITS_LOW, value | pins::SWCLK, OUTPUT_PINS]);
        }
        self.transport.write_bytes(&buf)?;
        Ok(())
    }

    fn clock_undriven(&mut self, n: usize) -> Result<(), SwdError> {
        let mut buf = Vec::new();
        for _ in 0..n {
            buf.extend_from_slice(&[mpsse::SET_BITS_LOW, 0, INPUT_PINS]);
            buf.extend_from_slice(&[mpsse::SET_BITS_LOW, pins::SWCLK, INPUT_PINS]);
        }
        self.transport.write_bytes(&buf)?;
        Ok(())
    }

    fn clock_in_bits(&mut self, n: usize) -> Result<Vec<bool>, SwdError> {
        let mut buf = Vec::new();
        for _ in 0..n {
            buf.extend_from_slice(&[mpsse::SET_BITS_LOW, 0, INPUT_PINS]);
            buf.push(mpsse::GET_BITS_LOW);
            buf.extend_from_slice(&[mpsse::SET_BITS_LOW, pins::SWCLK, INPUT_PINS]);
        }
        self.transport.write_bytes(&buf)?;
        let reply = self.transport.read_bytes(n)?;
        Ok(reply.into_iter().map(|b| b & pins::SWDIO != 0).collect())
    }
}

fn header_byte(apndp: bool, rnw: bool, a23: u8) -> u8 {
    let a2 = a23 & 1;
    let a3 = (a23 >> 1) & 1;
    let parity = (apndp as u8) ^ (rnw as u8) ^ a2 ^ a3;
    1 | (apndp as u8) << 1
        | (rnw as u8) << 2
        | a2 << 3
        | a3 << 4
        | parity << 5
        | 1 << 7
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::MockTransport;

    fn ack_bits(ack: u8) -> [u8; 3] {
        [
            if ack & 1 != 0 { pins::SWDIO } else { 0 },
            if ack & 2 != 0 { pins::SWDIO } else { 0 },
            if ack & 4 != 0 { pins::SWDIO } else { 0 },
        ]
    }

    fn queue_ok_read(mock: &mut MockTransport, value: u32) {
        mock.queue_reply_bytes(&ack_bits(0b001));
        let parity = (value.count_ones() % 2 == 1) as u8;
        for i in 0..32 {
            let bit = (value >> i) & 1;
            mock.queue_reply_bytes(&[if bit != 0 { pins::SWDIO } else { 0 }]);
        }
        mock.queue_reply_bytes(&[if parity != 0 { pins::SWDIO } else { 0 }]);
    }

    #[test]
    fn header_byte_parity_is_xor_of_the_four_fields() {
        for apndp in [false, true] {
            for rnw in [false, true] {
                for a23 in 0..4u8 {
                    let header = header_byte(apndp, rnw, a23);
                    let parity_bit = (header >> 5) & 1;
                    let expected = (apndp as u8) ^ (rnw as u8) ^ (a23 & 1) ^ ((a23 >> 1) & 1);
                    assert_eq!(parity_bit, expected);
                    assert_eq!(header & 1, 1, "start bit always set");
                    assert_eq!((header >> 6) & 1, 0, "stop bit always clear");
                    assert_eq!((header >> 7) & 1, 1, "park bit always set");
                }
            }
        }
    }

    #[test]
    fn read_dp_register_returns_the_value_on_ok_ack() {
        let mut mock = MockTransport::default();
        queue_ok_read(&mut mock, 0x0bc1_1477);
        let mut driver = SwdDriver::new(mock);
        let value = driver.read(false, 0).expect("ok ack");
        assert_eq!(value, 0x0bc1_1477);
    }

    #[test]
    fn wait_storm_retries_until_ok() {
        let mut mock = MockTransport::default();
        for _ in 0..7 {
            mock.queue_reply_bytes(&ack_bits(0b010));
        }
        queue_ok_read(&mut mock, 0x1234_5678);
        let mut driver = SwdDriver::new(mock);
        let value = driver.read(true, 0).expect("eventually acks OK");
        assert_eq!(value, 0x1234_5678);
        assert_eq!(driver.stats().wait_retries, 7);
    }

    #[test]
    fn fault_ack_surfaces_as_protocol_fault() {
        let mut mock = MockTransport::default();
        mock.queue_reply_bytes(&ack_bits(0b100));
        let mut driver = SwdDriver::new(mock);
        let err = driver.read(true, 0).unwrap_err();
        assert!(matches!(err, SwdError::ProtocolFault));
    }

    #[test]
    fn parity_mismatch_on_read_is_reported() {
        let mut mock = MockTransport::default();
        mock.queue_reply_bytes(&ack_bits(0b001));
        for _ in 0..32 {
            mock.queue_reply_bytes(&[0]);
        }
        // wrong parity bit for a value of 0 (should be even/0).
        mock.queue_reply_bytes(&[pins::SWDIO]);
        let mut driver = SwdDriver::new(mock);
        let err = driver.read(false, 0).unwrap_err();
        assert!(matches!(err, SwdError::ProtocolParity));
    }

    #[test]
    fn no_target_ack_is_reported() {
        let mut mock = MockTransport::default();
        mock.queue_reply_bytes(&ack_bits(0b111));
        let mut driver = SwdDriver::new(mock);
        let err = driver.read(false, 0).unwrap_err();
        assert!(matches!(err, SwdError::NoTarget));
    }
}
