//! The ARM Cortex-M Debug Control Block driver: halt/step/resume, core
//! register access via DCRSR/DCRDR, and DFSR halt-cause decoding.

use bitfield::bitfield;
use log::{debug, warn};

use crate::dp::Dap;
use crate::error::TargetError;
use crate::memory::MemoryAp;
use crate::retry::poll_until;
use crate::transport::Transport;
use std::time::Duration;

const DHCSR: u32 = 0xe000_edf0;
const DCRSR: u32 = 0xe000_edf4;
const DCRDR: u32 = 0xe000_edf8;
const DEMCR: u32 = 0xe000_edfc;
const AIRCR: u32 = 0xe000_ed0c;
const DFSR: u32 = 0xe000_ed30;

const DHCSR_DBGKEY: u32 = 0xa05f_0000;
const AIRCR_VECTKEY: u32 = 0x05fa_0000;

const HALT_RETRIES: usize = 100;
const REGISTER_RETRIES: usize = 100;
const RESET_HALT_RETRIES: usize = 100;

bitfield! {
    /// Debug Halting Control and Status Register.
    pub struct Dhcsr(u32);
    impl Debug;
    pub c_debugen, set_c_debugen: 0;
    pub c_halt, set_c_halt: 1;
    pub c_step, set_c_step: 2;
    pub c_maskints, set_c_maskints: 3;
    pub s_regrdy, _: 16;
    pub s_halt, _: 17;
    pub s_sleep, _: 18;
    pub s_lockup, _: 19;
    pub s_reset_st, _: 25;
}

impl Dhcsr {
    fn with_write_key(mut self) -> Self {
        self.0 = (self.0 & 0x0000_ffff) | DHCSR_DBGKEY;
        self
    }
}

bitfield! {
    /// Debug Core Register Selector Register.
    pub struct Dcrsr(u32);
    impl Debug;
    pub regsel, set_regsel: 6, 0;
    pub regwnr, set_regwnr: 16;
}

bitfield! {
    /// Application Interrupt and Reset Control Register.
    pub struct Aircr(u32);
    impl Debug;
    pub sysresetreq, set_sysresetreq: 2;
    pub vectclractive, set_vectclractive: 1;
}

impl Aircr {
    fn with_write_key(mut self) -> Self {
        self.0 = (self.0 & 0x0000_ffff) | AIRCR_VECTKEY;
        self
    }
}

bitfield! {
    /// Debug Exception and Monitor Control Register.
    pub struct Demcr(u32);
    impl Debug;
    pub vc_corereset, set_vc_corereset: 0;
}

bitfield! {
    /// Debug Fault Status Register.
    pub struct Dfsr(u32);
    impl Debug;
    pub halted, _: 0;
    pub bkpt, _: 1;
    pub dwttrap, _: 2;
    pub vcatch, _: 3;
    pub external, _: 4;
}

/// A core register addressable through DCRSR's REGSEL encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterId {
    Core(u8),
    Xpsr,
    Msp,
    Psp,
    /// CONTROL/FAULTMASK/BASEPRI/PRIMASK, packed into one REGSEL=20
    /// transaction (CONTROL in bits [31:24], FAULTMASK in [23:16], BASEPRI
    /// in [15:8], PRIMASK in [7:0], the conventional ARMv7-M packing).
    Special,
}

impl RegisterId {
    pub fn r(n: u8) -> Self {
        debug_assert!(n <= 15);
        RegisterId::Core(n)
    }

    fn regsel(self) -> u32 {
        match self {
            RegisterId::Core(n) => n as u32,
            RegisterId::Xpsr => 16,
            RegisterId::Msp => 17,
            RegisterId::Psp => 18,
            RegisterId::Special => 20,
        }
    }
}

/// Why the core most recently halted, decoded from DFSR bits [4:0].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Halted,
    Breakpoint,
    Watchpoint,
    VectorCatch,
    External,
    /// More than one DFSR bit was set, or none were — an unusual state
    /// worth surfacing rather than guessing at.
    Multiple(u32),
}

fn decode_halt_reason(dfsr: u32) -> HaltReason {
    let bits = Dfsr(dfsr);
    let set = [
        bits.halted(),
        bits.bkpt(),
        bits.dwttrap(),
        bits.vcatch(),
        bits.external(),
    ];
    match set.iter().filter(|b| **b).count() {
        1 if bits.bkpt() => HaltReason::Breakpoint,
        1 if bits.halted() => HaltReason::Halted,
        1 if bits.dwttrap() => HaltReason::Watchpoint,
        1 if bits.vcatch() => HaltReason::VectorCatch,
        1 if bits.external() => HaltReason::External,
        _ => HaltReason::Multiple(dfsr & 0x1f),
    }
}

/// Target state machine: *unknown* → (`initialize`) → *running*/*halted*;
/// `halt()`/`resume()` toggle halted↔running; a sticky DP fault drives the
/// state back to *unknown*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unknown,
    Running,
    Halted,
    LockedOut,
}

/// The Cortex-M target. Carries only the state-machine value; every
/// operation is driven through the [`Dap`]/[`MemoryAp`] the caller owns, so
/// there is exactly one of these per session and no hidden global state.
pub struct CortexM {
    state: TargetState,
}

impl CortexM {
    pub fn new() -> Self {
        Self {
            state: TargetState::Unknown,
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    fn read_word<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
    ) -> Result<u32, TargetError> {
        Ok(mem.read_word(dap, address)?)
    }

    fn write_word<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
        value: u32,
    ) -> Result<(), TargetError> {
        Ok(mem.write_word(dap, address, value)?)
    }

    /// Enables debug (`C_DEBUGEN`) without halting, and clears
    /// `C_MASKINTS`. Transitions the state machine out of *unknown*.
    pub fn initialize<T: Transport>(
        &mut self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
    ) -> Result<(), TargetError> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_maskints(false);
        self.write_word(dap, mem, DHCSR, dhcsr.with_write_key().0)?;

        let status = Dhcsr(self.read_word(dap, mem, DHCSR)?);
        self.state = if status.s_halt() {
            TargetState::Halted
        } else {
            TargetState::Running
        };
        debug!("target initialized, state={:?}", self.state);
        Ok(())
    }

    /// Halts the core and polls DHCSR.S_HALT up to [`HALT_RETRIES`] times.
    pub fn halt<T: Transport>(
        &mut self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
    ) -> Result<(), TargetError> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        self.write_word(dap, mem, DHCSR, dhcsr.with_write_key().0)?;

        poll_until(
            HALT_RETRIES,
            Duration::from_micros(100),
            || TargetError::Timeout("DHCSR.S_HALT"),
            || {
                let status = Dhcsr(self.read_word(dap, mem, DHCSR)?);
                Ok(status.s_halt().then_some(()))
            },
        )?;
        self.state = TargetState::Halted;
        Ok(())
    }

    /// Resumes the core. Does not poll: the core may re-halt immediately on
    /// a pending breakpoint, and the caller's next `halt()`/semihosting
    /// poll will observe that.
    pub fn resume<T: Transport>(
        &mut self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
    ) -> Result<(), TargetError> {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(false);
        self.write_word(dap, mem, DHCSR, dhcsr.with_write_key().0)?;
        self.state = TargetState::Running;
        Ok(())
    }

    /// Sets DEMCR.VC_CORERESET, writes AIRCR.SYSRESETREQ, and waits for
    /// DHCSR.S_HALT — a reset that leaves the core halted at its reset
    /// vector rather than running.
    pub fn reset_halt<T: Transport>(
        &mut self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
    ) -> Result<(), TargetError> {
        let mut demcr = Demcr(self.read_word(dap, mem, DEMCR)?);
        demcr.set_vc_corereset(true);
        self.write_word(dap, mem, DEMCR, demcr.0)?;

        let mut aircr = Aircr(0);
        aircr.set_sysresetreq(true);
        self.write_word(dap, mem, AIRCR, aircr.with_write_key().0)?;

        poll_until(
            RESET_HALT_RETRIES,
            Duration::from_millis(1),
            || TargetError::Timeout("DHCSR.S_HALT after reset_halt"),
            || {
                let status = Dhcsr(self.read_word(dap, mem, DHCSR)?);
                Ok(status.s_halt().then_some(()))
            },
        )?;
        self.state = TargetState::Halted;
        Ok(())
    }

    fn require_halted(&self) -> Result<(), TargetError> {
        if self.state != TargetState::Halted {
            return Err(TargetError::WrongState {
                required: "halted",
                actual: state_name(self.state),
            });
        }
        Ok(())
    }

    /// Reads a core register. Only valid while halted.
    pub fn read_register<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        reg: RegisterId,
    ) -> Result<u32, TargetError> {
        self.require_halted()?;
        let mut dcrsr = Dcrsr(0);
        dcrsr.set_regsel(reg.regsel());
        dcrsr.set_regwnr(false);
        self.write_word(dap, mem, DCRSR, dcrsr.0)?;
        self.wait_for_register_ready(dap, mem)?;
        self.read_word(dap, mem, DCRDR)
    }

    /// Writes a core register. Only valid while halted.
    pub fn write_register<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        reg: RegisterId,
        value: u32,
    ) -> Result<(), TargetError> {
        self.require_halted()?;
        self.write_word(dap, mem, DCRDR, value)?;
        let mut dcrsr = Dcrsr(0);
        dcrsr.set_regsel(reg.regsel());
        dcrsr.set_regwnr(true);
        self.write_word(dap, mem, DCRSR, dcrsr.0)?;
        self.wait_for_register_ready(dap, mem)
    }

    fn wait_for_register_ready<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
    ) -> Result<(), TargetError> {
        poll_until(
            REGISTER_RETRIES,
            Duration::from_micros(100),
            || TargetError::Timeout("DHCSR.S_REGRDY"),
            || {
                let status = Dhcsr(self.read_word(dap, mem, DHCSR)?);
                Ok(status.s_regrdy().then_some(()))
            },
        )
    }

    /// Reads DFSR and decodes the halt cause. Does not clear DFSR; callers
    /// that need edge-triggered semantics write back the bits they
    /// observed.
    pub fn halt_reason<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
    ) -> Result<HaltReason, TargetError> {
        let dfsr = self.read_word(dap, mem, DFSR)?;
        let reason = decode_halt_reason(dfsr);
        if !matches!(reason, HaltReason::Breakpoint) {
            warn!("halted for an unexpected reason: {reason:?} (dfsr={dfsr:#010x})");
        }
        Ok(reason)
    }

    pub fn pc<T: Transport>(&self, dap: &mut Dap<T>, mem: &mut MemoryAp<T>) -> Result<u32, TargetError> {
        self.read_register(dap, mem, RegisterId::r(15))
    }

    pub fn set_pc<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        value: u32,
    ) -> Result<(), TargetError> {
        self.write_register(dap, mem, RegisterId::r(15), value)
    }

    pub fn read_memory_word<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
    ) -> Result<u32, TargetError> {
        self.read_word(dap, mem, address)
    }

    pub fn write_memory_word<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
        value: u32,
    ) -> Result<(), TargetError> {
        self.write_word(dap, mem, address, value)
    }

    pub fn read_memory_halfword<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
    ) -> Result<u16, TargetError> {
        Ok(mem.read_halfword(dap, address)?)
    }

    pub fn write_memory_halfword<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
        value: u16,
    ) -> Result<(), TargetError> {
        Ok(mem.write_halfword(dap, address, value)?)
    }

    pub fn read_memory_byte<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
    ) -> Result<u8, TargetError> {
        Ok(mem.read_byte(dap, address)?)
    }

    pub fn write_memory_byte<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
        value: u8,
    ) -> Result<(), TargetError> {
        Ok(mem.write_byte(dap, address, value)?)
    }

    pub fn read_memory_block<T: Transport>(
        &self,
        dap: &mut Dap<T>,
        mem: &mut MemoryAp<T>,
        address: u32,
        count: usize,
    ) -> Result<Vec<u32>, TargetError> {
        Ok(mem.read_block(dap, address, count)?)
    }
}

impl Default for CortexM {
    fn default() -> Self {
        Self::new()
    }
}

fn state_name(state: TargetState) -> &'static str {
    match state {
        TargetState::Unknown => "unknown",
        TargetState::Running => "running",
        TargetState::Halted => "halted",
        TargetState::LockedOut => "locked-out",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_halt_reason_identifies_breakpoint() {
        let mut dfsr = Dfsr(0);
        dfsr.0 |= 1 << 1; // BKPT
        assert_eq!(decode_halt_reason(dfsr.0), HaltReason::Breakpoint);
    }

    #[test]
    fn dhcsr_write_key_preserves_low_bits_only() {
        let mut dhcsr = Dhcsr(0);
        dhcsr.set_c_debugen(true);
        dhcsr.set_c_halt(true);
        let word = dhcsr.with_write_key().0;
        assert_eq!(word & 0xffff_0000, DHCSR_DBGKEY);
        assert_eq!(word & 0b11, 0b11);
    }

    #[test]
    fn register_requires_halted_state() {
        let core = CortexM::new();
        assert_eq!(core.state(), TargetState::Unknown);
        let err = core.require_halted().unwrap_err();
        assert!(matches!(err, TargetError::WrongState { required: "halted", .. }));
    }
}
