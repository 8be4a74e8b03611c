//! A host-side SWD debug agent: halt a Cortex-M target, stream its
//! semihosting console, dump memory, and drive it as a reusable
//! target-control library.
//!
//! The layers compose bottom-up: [`transport`] (L0) → [`swd`] (L1) →
//! [`dp`] (L2) → [`memory`] (L3) → [`core`] (L4) → [`semihosting`] (L5).
//! [`Session`] wires all of them together for the two binaries in
//! `src/bin/`.

pub mod core;
pub mod dp;
pub mod error;
pub mod logging;
pub mod memory;
pub mod programmer;
pub mod retry;
pub mod semihosting;
pub mod swd;
pub mod transport;

use log::info;

use crate::core::CortexM;
use crate::dp::Dap;
use crate::error::Result;
use crate::memory::MemoryAp;
use crate::swd::SwdDriver;
use crate::transport::Transport;

/// A fully connected session: transport → SWD → DAP → MEM-AP → target.
/// There is exactly one of these per process; all state lives on this
/// value rather than in statics.
pub struct Session<T: Transport> {
    dap: Dap<T>,
    mem: MemoryAp<T>,
    core: CortexM,
}

impl<T: Transport> Session<T> {
    /// Brings up a session from an opened transport: configures the bridge,
    /// drives the SWD line-reset/IDCODE sequence, constructs the DAP and
    /// runs `reset_state()`, then initializes the target for halting debug.
    pub fn connect(mut transport: T, frequency_hz: u32) -> Result<Self> {
        transport.configure(frequency_hz)?;
        let mut swd = SwdDriver::new(transport);
        swd.leave_reset()?;
        let idcode = swd.init()?;
        info!("connected, IDCODE={idcode:#010x}");

        let mut dap = Dap::new(swd, idcode);
        dap.reset_state()?;

        let mut mem = MemoryAp::new();
        mem.invalidate_shadow();

        let mut core = CortexM::new();
        core.initialize(&mut dap, &mut mem)?;

        Ok(Self { dap, mem, core })
    }

    pub fn halt(&mut self) -> Result<()> {
        self.core.halt(&mut self.dap, &mut self.mem)?;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.core.resume(&mut self.dap, &mut self.mem)?;
        Ok(())
    }

    pub fn reset_halt(&mut self) -> Result<()> {
        self.core.reset_halt(&mut self.dap, &mut self.mem)?;
        Ok(())
    }

    pub fn read_word(&mut self, address: u32) -> Result<u32> {
        Ok(self.core.read_memory_word(&mut self.dap, &mut self.mem, address)?)
    }

    pub fn write_word(&mut self, address: u32, value: u32) -> Result<()> {
        Ok(self.core.write_memory_word(&mut self.dap, &mut self.mem, address, value)?)
    }

    pub fn read_block(&mut self, address: u32, count: usize) -> Result<Vec<u32>> {
        Ok(self.core.read_memory_block(&mut self.dap, &mut self.mem, address, count)?)
    }

    /// Runs the semihosting console loop, forwarding `SYS_WRITEC` bytes to
    /// `console`, until the target calls `SYS_EXIT` or the loop errors.
    pub fn run_semihosting(&mut self, console: &mut impl std::io::Write) -> Result<i32> {
        Ok(semihosting::run(&mut self.dap, &mut self.mem, &mut self.core, console)?)
    }

    pub fn idcode(&self) -> u32 {
        self.dap.idcode()
    }

    pub fn target_state(&self) -> core::TargetState {
        self.core.state()
    }

    /// Consumes the session, logging final SWD transfer statistics and
    /// returning the transport so the caller can release reset / close the
    /// bridge on its own terms.
    pub fn teardown(self) -> T {
        self.dap.swd_stats().log_summary();
        self.dap.into_swd().into_transport()
    }
}
