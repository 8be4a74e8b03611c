//! L0: the opaque byte-oriented channel to the USB bridge chip.
//!
//! The rest of the crate depends only on the [`Transport`] trait.
//! [`FtdiTransport`] is the one concrete implementation this crate ships,
//! so that `console-host` and `dump-flash` run end to end: it wraps
//! `libftdi1-sys`, opening the device, closing the handle on `Drop`, and
//! translating libftdi's negative return codes into a `thiserror` enum.

use std::ffi::CStr;

use libftdi1_sys as ffi;
use thiserror::Error;

use crate::error::TransportError;

/// A byte channel to the bridge chip, plus the two out-of-band controls the
/// SWD stack needs that aren't part of the SWD wire protocol itself: the
/// physical target reset line, and placing the bridge into the bit-banging
/// serial mode the SWD driver's MPSSE command sequences assume.
pub trait Transport {
    /// Send `data` to the bridge. The bridge executes whatever MPSSE command
    /// stream it contains and queues any reply bytes those commands request.
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Block until exactly `n` reply bytes are available and return them.
    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError>;

    /// Drive the target system reset line low.
    fn assert_reset(&mut self) -> Result<(), TransportError>;

    /// Release the target system reset line.
    fn release_reset(&mut self) -> Result<(), TransportError>;

    /// Place the bridge into MPSSE bit-bang mode at approximately
    /// `frequency_hz` SWCLK.
    fn configure(&mut self, frequency_hz: u32) -> Result<(), TransportError>;
}

/// GPIO bit assignment on the FTDI ADBUS byte used to bit-bang SWD.
///
/// This is a programmer-specific pin mapping in general; the constants here
/// are the default wiring this crate assumes absent an override and are
/// what [`crate::programmer`] entries may reinterpret.
pub mod pins {
    /// SWCLK, always an output.
    pub const SWCLK: u8 = 1 << 0;
    /// SWDIO. Direction flips between output (driving requests) and input
    /// (sampling ACK/data/turnaround phases).
    pub const SWDIO: u8 = 1 << 1;
    /// Target nRESET, open-drain: driven low to assert, released (input) to
    /// deassert.
    pub const NRESET: u8 = 1 << 3;
}

/// FTDI MPSSE opcodes this crate's SWD bit-banger issues, from FTDI AN_108.
pub mod mpsse {
    /// Set Data Bits Low Byte: value, then direction (1 = output).
    pub const SET_BITS_LOW: u8 = 0x80;
    /// Read Data Bits Low Byte: queues one reply byte.
    pub const GET_BITS_LOW: u8 = 0x81;
    /// Set clock divisor: `TCK = 12MHz / ((1 + divisor) * 2)`.
    pub const SET_CLOCK_DIVISOR: u8 = 0x86;
    /// Disable the internal clock-divide-by-5 so SET_CLOCK_DIVISOR operates
    /// against the full 60MHz base clock on FT232H-class chips.
    pub const DISABLE_CLK_DIV5: u8 = 0x8a;
}

#[derive(Debug, Error)]
pub enum FtdiError {
    #[error("failed to enumerate devices to open the correct one")]
    EnumerationFailed,
    #[error("no FTDI device matched vid={vid:#06x} pid={pid:#06x}")]
    DeviceNotFound { vid: u16, pid: u16 },
    #[error("failed to open the matched device")]
    AccessFailed,
    #[error("libftdi reported an error: {message}")]
    Unknown { message: String },
}

impl From<FtdiError> for TransportError {
    fn from(e: FtdiError) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// A bridge chip from the FTDI FT232H/FT2232H family, opened by VID/PID and
/// interface index and driven in MPSSE bit-bang mode.
pub struct FtdiTransport {
    context: *mut ffi::ftdi_context,
}

impl FtdiTransport {
    /// Opens interface `interface` (0-3, mapping to A-D) of the first device
    /// matching `vid`/`pid`.
    pub fn open(vid: u16, pid: u16, interface: u8) -> Result<Self, FtdiError> {
        let context = unsafe { ffi::ftdi_new() };
        assert!(!context.is_null(), "ftdi_new: out of memory or libusb_init failed");

        let iface = match interface {
            0 => ffi::ftdi_interface::INTERFACE_A,
            1 => ffi::ftdi_interface::INTERFACE_B,
            2 => ffi::ftdi_interface::INTERFACE_C,
            _ => ffi::ftdi_interface::INTERFACE_D,
        };
        let result = unsafe { ffi::ftdi_set_interface(context, iface) };
        if result != 0 {
            unsafe { ffi::ftdi_free(context) };
            return Err(Self::unknown(context));
        }

        let result = unsafe { ffi::ftdi_usb_open(context, vid as i32, pid as i32) };
        match result {
            0 => Ok(Self { context }),
            -3 => {
                unsafe { ffi::ftdi_free(context) };
                Err(FtdiError::DeviceNotFound { vid, pid })
            }
            -4 | -5 => {
                unsafe { ffi::ftdi_free(context) };
                Err(FtdiError::AccessFailed)
            }
            -1 | -2 | -8 | -9 | -12 => {
                unsafe { ffi::ftdi_free(context) };
                Err(FtdiError::EnumerationFailed)
            }
            _ => {
                let err = Self::unknown(context);
                unsafe { ffi::ftdi_free(context) };
                Err(err)
            }
        }
    }

    fn unknown(context: *mut ffi::ftdi_context) -> FtdiError {
        let message = unsafe { CStr::from_ptr(ffi::ftdi_get_error_string(context)) }
            .to_string_lossy()
            .into_owned();
        FtdiError::Unknown { message }
    }

    fn gpio_command(&mut self, value: u8, direction: u8) -> Result<(), TransportError> {
        self.write_bytes(&[mpsse::SET_BITS_LOW, value, direction])
    }
}

unsafe impl Send for FtdiTransport {}

impl Drop for FtdiTransport {
    fn drop(&mut self) {
        if !self.context.is_null() {
            unsafe {
                ffi::ftdi_usb_close(self.context);
                ffi::ftdi_free(self.context);
            }
        }
    }
}

impl Transport for FtdiTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let len = data.len().min(i32::MAX as usize) as i32;
        let result = unsafe { ffi::ftdi_write_data(self.context, data.as_ptr(), len) };
        if result < 0 {
            return Err(TransportError::Io(Self::unknown(self.context).to_string()));
        }
        if result as usize != data.len() {
            return Err(TransportError::ShortRead {
                expected: data.len(),
                got: result as usize,
            });
        }
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; n];
        let mut have = 0usize;
        // The bridge streams reply bytes as its internal queue drains; a
        // single `ftdi_read_data` call is not guaranteed to return all of
        // them at once.
        while have < n {
            let result = unsafe {
                ffi::ftdi_read_data(self.context, buf[have..].as_mut_ptr(), (n - have) as i32)
            };
            if result < 0 {
                return Err(TransportError::Io(Self::unknown(self.context).to_string()));
            }
            have += result as usize;
        }
        Ok(buf)
    }

    fn assert_reset(&mut self) -> Result<(), TransportError> {
        self.gpio_command(0, pins::SWCLK | pins::SWDIO | pins::NRESET)
    }

    fn release_reset(&mut self) -> Result<(), TransportError> {
        self.gpio_command(pins::NRESET, pins::SWCLK | pins::SWDIO)
    }

    fn configure(&mut self, frequency_hz: u32) -> Result<(), TransportError> {
        let result = unsafe {
            ffi::ftdi_set_bitmode(self.context, 0, ffi::ftdi_mpsse_mode::BITMODE_MPSSE.0 as u8)
        };
        if result != 0 {
            return Err(TransportError::ConfigureFailed);
        }

        // base clock on FT232H/FT2232H is 60MHz with the /5 prescaler
        // disabled; divisor solves TCK = 60MHz / ((1 + divisor) * 2).
        let divisor = ((60_000_000 / (2 * frequency_hz.max(1))) as u32).saturating_sub(1);
        let divisor = divisor.min(0xffff) as u16;
        let [lo, hi] = divisor.to_le_bytes();
        self.write_bytes(&[mpsse::DISABLE_CLK_DIV5, mpsse::SET_CLOCK_DIVISOR, lo, hi])?;

        // release SWCLK/SWDIO to idle (clock low, line released), reset
        // line held released.
        self.gpio_command(pins::NRESET, pins::SWCLK | pins::SWDIO)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;

    use super::*;

    /// An in-memory transport used by the SWD/DP/MEM-AP unit tests. Queues
    /// reply bytes the test wires up in advance and records every byte
    /// written.
    #[derive(Default)]
    pub struct MockTransport {
        pub written: Vec<u8>,
        pub replies: VecDeque<u8>,
        pub reset_asserted: bool,
    }

    impl MockTransport {
        pub fn queue_reply_bytes(&mut self, bytes: &[u8]) {
            self.replies.extend(bytes.iter().copied());
        }
    }

    impl Transport for MockTransport {
        fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, TransportError> {
            if self.replies.len() < n {
                return Err(TransportError::ShortRead {
                    expected: n,
                    got: self.replies.len(),
                });
            }
            Ok((0..n).map(|_| self.replies.pop_front().unwrap()).collect())
        }

        fn assert_reset(&mut self) -> Result<(), TransportError> {
            self.reset_asserted = true;
            Ok(())
        }

        fn release_reset(&mut self) -> Result<(), TransportError> {
            self.reset_asserted = false;
            Ok(())
        }

        fn configure(&mut self, _frequency_hz: u32) -> Result<(), TransportError> {
            Ok(())
        }
    }
}
