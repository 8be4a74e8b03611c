//! L2: the Debug/Access Port engine.
//!
//! Presents typed DP and AP register access on top of [`crate::swd`],
//! hiding SELECT bank selection and posted-read timing behind `read_dp` /
//! `write_dp` / `read_ap` / `write_ap`.

use log::{debug, warn};

use crate::error::{DapError, SwdError};
use crate::swd::SwdDriver;
use crate::transport::Transport;

/// DP register selectors, addressed by A[3:2] (the bank-independent part
/// of the DP space; IDCODE/ABORT and CTRL/STAT/SELECT/RDBUFF don't bank).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpRegister {
    /// A=0, read: IDCODE. A=0, write: ABORT.
    IdcodeOrAbort,
    /// A=1: CTRL/STAT.
    CtrlStat,
    /// A=2: SELECT.
    Select,
    /// A=3, read: RDBUFF. A=3, write: TARGETSEL (unused — single-drop only).
    RdBuffOrTargetSel,
}

impl DpRegister {
    fn a23(self) -> u8 {
        match self {
            DpRegister::IdcodeOrAbort => 0,
            DpRegister::CtrlStat => 1,
            DpRegister::Select => 2,
            DpRegister::RdBuffOrTargetSel => 3,
        }
    }
}

/// ABORT register clear bits (offset 0x0, write-only).
pub mod abort {
    pub const DAPABORT: u32 = 1 << 0;
    pub const STKCMPCLR: u32 = 1 << 1;
    pub const STKERRCLR: u32 = 1 << 2;
    pub const WDERRCLR: u32 = 1 << 3;
    pub const ORUNERRCLR: u32 = 1 << 4;
}

/// CTRL/STAT bits this crate reads or writes.
pub mod ctrl_stat {
    pub const ORUNDETECT: u32 = 1 << 0;
    pub const STICKYORUN: u32 = 1 << 1;
    pub const STICKYCMP: u32 = 1 << 4;
    pub const STICKYERR: u32 = 1 << 5;
    pub const WDATAERR: u32 = 1 << 7;
    pub const CDBGRSTREQ: u32 = 1 << 26;
    pub const CDBGRSTACK: u32 = 1 << 27;
    pub const CDBGPWRUPREQ: u32 = 1 << 28;
    pub const CDBGPWRUPACK: u32 = 1 << 29;
    pub const CSYSPWRUPREQ: u32 = 1 << 30;
    pub const CSYSPWRUPACK: u32 = 1 << 31;
}

/// How many times `reset_state` polls CTRL/STAT for the power-up ACK bits
/// before giving up.
const POWER_UP_RETRIES: usize = 100;

/// The SELECT shadow: which (AP, bank) is currently selected on the wire,
/// or `None` immediately after a reset/reconnect when it is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SelectShadow {
    ap: u8,
    bank: u8,
}

/// The DP/AP engine. Owns the SWD driver and the SELECT/posted-read state
/// a session needs between transactions.
pub struct Dap<T: Transport> {
    swd: SwdDriver<T>,
    select: Option<SelectShadow>,
    idcode: u32,
}

impl<T: Transport> Dap<T> {
    /// Builds a DAP on a freshly-initialized SWD driver, taking its already
    /// discovered IDCODE. Callers should call [`Self::reset_state`] before
    /// issuing any AP transactions.
    pub fn new(swd: SwdDriver<T>, idcode: u32) -> Self {
        Self {
            swd,
            select: None,
            idcode,
        }
    }

    pub fn idcode(&self) -> u32 {
        self.idcode
    }

    pub fn swd_stats(&self) -> crate::swd::SwdStatistics {
        self.swd.stats()
    }

    /// Unwraps the DAP back down to its SWD driver, for teardown.
    pub fn into_swd(self) -> SwdDriver<T> {
        self.swd
    }

    pub fn read_dp(&mut self, reg: DpRegister) -> Result<u32, DapError> {
        self.with_fault_recovery(|this| Ok(this.swd.read(false, reg.a23())?))
    }

    pub fn write_dp(&mut self, reg: DpRegister, value: u32) -> Result<(), DapError> {
        self.with_fault_recovery(|this| Ok(this.swd.write(false, reg.a23(), value)?))
    }

    /// Reads AP register `reg_offset` (a byte offset within the AP's
    /// register file) on `ap_index`, auto-draining the posted read so the
    /// caller sees the value the AP actually held at `reg_offset`, not the
    /// value from whatever the previous AP access was.
    pub fn read_ap(&mut self, ap_index: u8, reg_offset: u8) -> Result<u32, DapError> {
        self.select_ap_bank(ap_index, reg_offset)?;
        let a23 = (reg_offset >> 2) & 0b11;
        self.with_fault_recovery(|this| Ok(this.swd.read(true, a23)?))?;
        // auto-drain: the value above is the *previous* posted read; the
        // actual result of this access is latched in RDBUFF.
        self.read_dp(DpRegister::RdBuffOrTargetSel)
    }

    pub fn write_ap(&mut self, ap_index: u8, reg_offset: u8, value: u32) -> Result<(), DapError> {
        self.select_ap_bank(ap_index, reg_offset)?;
        let a23 = (reg_offset >> 2) & 0b11;
        self.with_fault_recovery(|this| Ok(this.swd.write(true, a23, value)?))
    }

    /// Writes SELECT only when the (AP, bank) the caller wants differs from
    /// the shadow — the SELECT-shadowing invariant in spec form.
    fn select_ap_bank(&mut self, ap_index: u8, reg_offset: u8) -> Result<(), DapError> {
        let bank = (reg_offset >> 4) & 0xf;
        let wanted = SelectShadow { ap: ap_index, bank };
        if self.select == Some(wanted) {
            return Ok(());
        }
        let select = ((ap_index as u32) << 24) | ((bank as u32) << 4);
        self.write_dp(DpRegister::Select, select)?;
        self.select = Some(wanted);
        Ok(())
    }

    /// Zeroes the SELECT shadow, rereads IDCODE, clears any sticky fault,
    /// and powers up the debug and system domains, spinning on the ACK
    /// bits.
    pub fn reset_state(&mut self) -> Result<(), DapError> {
        self.select = None;
        self.idcode = self.swd.init()?;

        self.write_dp(
            DpRegister::IdcodeOrAbort,
            abort::STKCMPCLR | abort::STKERRCLR | abort::WDERRCLR | abort::ORUNERRCLR,
        )?;

        self.write_dp(
            DpRegister::CtrlStat,
            ctrl_stat::CDBGPWRUPREQ | ctrl_stat::CSYSPWRUPREQ,
        )?;

        crate::retry::poll_until(
            POWER_UP_RETRIES,
            std::time::Duration::from_micros(100),
            || DapError::Swd(SwdError::ProtocolAckWait),
            || {
                let status = self.read_dp(DpRegister::CtrlStat)?;
                let acked = status & (ctrl_stat::CDBGPWRUPACK | ctrl_stat::CSYSPWRUPACK)
                    == (ctrl_stat::CDBGPWRUPACK | ctrl_stat::CSYSPWRUPACK);
                Ok(acked.then_some(()))
            },
        )?;

        debug!("DAP power-up complete, IDCODE={:#010x}", self.idcode);
        Ok(())
    }

    /// Runs `op`, and on [`SwdError::ProtocolFault`] reads CTRL/STAT to
    /// classify the sticky bit, clears it via ABORT, then propagates the
    /// original fault. The SELECT shadow survives this recovery; only a
    /// line reset invalidates it.
    fn with_fault_recovery<R>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<R, DapError>,
    ) -> Result<R, DapError> {
        match op(self) {
            Err(DapError::Swd(SwdError::ProtocolFault)) => {
                let status = self.swd.read(false, DpRegister::CtrlStat.a23())?;
                let mut clear = abort::DAPABORT;
                if status & ctrl_stat::STICKYERR != 0 {
                    clear |= abort::STKERRCLR;
                }
                if status & ctrl_stat::STICKYCMP != 0 {
                    clear |= abort::STKCMPCLR;
                }
                if status & ctrl_stat::WDATAERR != 0 {
                    clear |= abort::WDERRCLR;
                }
                if status & ctrl_stat::STICKYORUN != 0 {
                    clear |= abort::ORUNERRCLR;
                }
                warn!("SWD FAULT observed, CTRL/STAT={status:#010x}, clearing via ABORT");
                self.swd.write(false, DpRegister::IdcodeOrAbort.a23(), clear)?;
                Err(DapError::Swd(SwdError::ProtocolFault))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::MockTransport;

    fn push_ok_read_reply(mock: &mut MockTransport, value: u32) {
        use crate::transport::pins;
        mock.queue_reply_bytes(&[pins::SWDIO, 0, 0]);
        for i in 0..32 {
            let bit = (value >> i) & 1;
            mock.queue_reply_bytes(&[if bit != 0 { pins::SWDIO } else { 0 }]);
        }
        let parity = (value.count_ones() % 2 == 1) as u8;
        mock.queue_reply_bytes(&[if parity != 0 { pins::SWDIO } else { 0 }]);
    }

    fn push_ok_write_reply(mock: &mut MockTransport) {
        use crate::transport::pins;
        mock.queue_reply_bytes(&[pins::SWDIO, 0, 0]);
    }

    #[test]
    fn select_is_elided_when_bank_unchanged() {
        let mut mock = MockTransport::default();
        // SELECT write, then AP read (ack + 32 data + parity), then RDBUFF
        // read (ack + 32 data + parity), repeated for a second AP read of
        // the same bank with no further SELECT write.
        push_ok_write_reply(&mut mock); // SELECT
        push_ok_read_reply(&mut mock, 0); // ap read (posted, discarded value)
        push_ok_read_reply(&mut mock, 0x1111_1111); // RDBUFF drain
        push_ok_read_reply(&mut mock, 0); // second ap read
        push_ok_read_reply(&mut mock, 0x2222_2222); // RDBUFF drain

        let driver = SwdDriver::new(mock);
        let mut dap = Dap::new(driver, 0x0bc1_1477);

        let first = dap.read_ap(0, 0x0c).expect("first ap read");
        let second = dap.read_ap(0, 0x0c).expect("second ap read, same bank");
        assert_eq!(first, 0x1111_1111);
        assert_eq!(second, 0x2222_2222);
    }

    #[test]
    fn fault_triggers_exactly_one_ctrl_stat_read_and_one_abort_write() {
        let mut mock = MockTransport::default();
        use crate::transport::pins;
        // FAULT ack on the original DP read.
        mock.queue_reply_bytes(&[0, 0, pins::SWDIO]);
        // CTRL/STAT read during recovery: STICKYERR set.
        push_ok_read_reply(&mut mock, ctrl_stat::STICKYERR);
        // ABORT write during recovery.
        push_ok_write_reply(&mut mock);

        let driver = SwdDriver::new(mock);
        let mut dap = Dap::new(driver, 0x0bc1_1477);
        let err = dap.read_dp(DpRegister::CtrlStat).unwrap_err();
        assert!(matches!(err, DapError::Swd(SwdError::ProtocolFault)));
    }
}
