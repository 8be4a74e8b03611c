//! L5: the semihosting supervisor.
//!
//! Polls for a halted core, identifies a `BKPT 0xAB` semihosting request,
//! dispatches the handful of `SYS_*` operations this agent supports, and
//! resumes.

use std::io::Write;
use std::time::Duration;

use log::{debug, warn};

use crate::core::{CortexM, HaltReason, RegisterId};
use crate::dp::Dap;
use crate::error::{SemihostingError, TargetError};
use crate::memory::MemoryAp;
use crate::retry::poll_until;
use crate::transport::Transport;

/// The 16-bit Thumb encoding of `BKPT #0xAB`.
pub const SEMIHOSTING_BREAKPOINT: u16 = 0xbeab;

pub const SYS_OPEN: u32 = 0x01;
pub const SYS_CLOSE: u32 = 0x02;
pub const SYS_WRITEC: u32 = 0x03;
pub const SYS_WRITE0: u32 = 0x04;
pub const SYS_WRITE: u32 = 0x05;
pub const SYS_ERRNO: u32 = 0x13;
pub const SYS_GET_CMDLINE: u32 = 0x15;
pub const SYS_EXIT: u32 = 0x18;
pub const SYS_EXIT_EXTENDED: u32 = 0x20;

const HALT_POLL_RETRIES: usize = 100_000;

/// What the outer poll loop in [`run`] should do after one `on_halt`
/// dispatch.
enum LoopAction {
    Resume,
    /// The target requested `SYS_EXIT`; the session ends with this code.
    Exit(i32),
}

/// Runs the semihosting console loop until the target calls `SYS_EXIT`, an
/// unsupported operation is requested, or an unexpected halt occurs.
/// `console` receives every byte written via `SYS_WRITEC`.
pub fn run<T: Transport>(
    dap: &mut Dap<T>,
    mem: &mut MemoryAp<T>,
    core: &mut CortexM,
    console: &mut impl Write,
) -> Result<i32, SemihostingError> {
    loop {
        poll_until(
            HALT_POLL_RETRIES,
            Duration::from_micros(200),
            || SemihostingError::Target(TargetError::Timeout("core halt (semihosting poll)")),
            || {
                let dhcsr = core.read_memory_word(dap, mem, 0xe000_edf0)?;
                Ok((dhcsr & (1 << 17) != 0).then_some(()))
            },
        )?;

        match on_halt(dap, mem, core, console)? {
            LoopAction::Resume => {
                core.resume(dap, mem)?;
            }
            LoopAction::Exit(code) => return Ok(code),
        }
    }
}

fn on_halt<T: Transport>(
    dap: &mut Dap<T>,
    mem: &mut MemoryAp<T>,
    core: &mut CortexM,
    console: &mut impl Write,
) -> Result<LoopAction, SemihostingError> {
    let reason = core.halt_reason(dap, mem)?;
    if !matches!(reason, HaltReason::Breakpoint) {
        let dfsr = core.read_memory_word(dap, mem, 0xe000_ed30)?;
        let pc = core.pc(dap, mem)?;
        warn!("halted for a non-semihosting reason: {reason:?}");
        return Err(SemihostingError::NotASemihostingBreakpoint {
            dfsr,
            pc,
            instruction: 0,
        });
    }

    let pc = core.pc(dap, mem)?;
    let aligned = pc & !0x3;
    let word = core.read_memory_word(dap, mem, aligned)?;
    let instruction = if pc & 0x2 != 0 {
        (word >> 16) as u16
    } else {
        (word & 0xffff) as u16
    };

    if instruction != SEMIHOSTING_BREAKPOINT {
        warn!("unexpected breakpoint instruction {instruction:#06x} at pc={pc:#010x}");
        return Err(SemihostingError::NotASemihostingBreakpoint {
            dfsr: core.read_memory_word(dap, mem, 0xe000_ed30)?,
            pc,
            instruction,
        });
    }

    let operation = core.read_register(dap, mem, RegisterId::r(0))?;
    let parameter = core.read_register(dap, mem, RegisterId::r(1))?;

    let action = match operation {
        SYS_WRITEC => {
            let byte = (parameter & 0xff) as u8;
            console
                .write_all(&[byte])
                .and_then(|_| console.flush())
                .map_err(|_| SemihostingError::UnsupportedOperation { operation, parameter })?;
            LoopAction::Resume
        }
        SYS_EXIT | SYS_EXIT_EXTENDED => {
            debug!("target requested SYS_EXIT, parameter={parameter:#010x}");
            LoopAction::Exit(parameter as i32)
        }
        _ => {
            warn!("unsupported semihosting operation {operation:#04x} (r1={parameter:#010x})");
            return Err(SemihostingError::UnsupportedOperation { operation, parameter });
        }
    };

    core.set_pc(dap, mem, pc.wrapping_add(2))?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TargetState;
    use crate::swd::SwdDriver;
    use crate::transport::test_support::MockTransport;

    const DHCSR_S_HALT: u32 = 1 << 17;
    const DHCSR_S_REGRDY: u32 = 1 << 16;
    const DFSR_BKPT: u32 = 1 << 1;

    /// Queues one ACK-only reply: every SWD write transaction, and the
    /// discarded half of a posted AP read.
    fn push_write(mock: &mut MockTransport) {
        use crate::transport::pins;
        mock.queue_reply_bytes(&[pins::SWDIO, 0, 0]);
    }

    /// Queues one full SWD read transaction's reply (ack + 32 data bits +
    /// parity) for `value`.
    fn push_read(mock: &mut MockTransport, value: u32) {
        use crate::transport::pins;
        mock.queue_reply_bytes(&[pins::SWDIO, 0, 0]);
        for i in 0..32 {
            let bit = (value >> i) & 1;
            mock.queue_reply_bytes(&[if bit != 0 { pins::SWDIO } else { 0 }]);
        }
        let parity = (value.count_ones() % 2 == 1) as u8;
        mock.queue_reply_bytes(&[if parity != 0 { pins::SWDIO } else { 0 }]);
    }

    /// Queues one AP register read as `Dap::read_ap` observes it: the
    /// posted value (discarded) followed by the RDBUFF drain carrying
    /// `value`.
    fn push_ap_read(mock: &mut MockTransport, value: u32) {
        push_read(mock, 0);
        push_read(mock, value);
    }

    /// Queues one MEM-AP word write as `MemoryAp::write_word` emits it:
    /// a TAR write (the shadow is always invalidated by the previous
    /// access) followed by the DRW write.
    fn push_mem_write(mock: &mut MockTransport) {
        push_write(mock); // TAR
        push_write(mock); // DRW
    }

    /// Queues one MEM-AP word read as `MemoryAp::read_word` emits it: a
    /// TAR write followed by the posted DRW read/RDBUFF drain.
    fn push_mem_read(mock: &mut MockTransport, value: u32) {
        push_write(mock); // TAR
        push_ap_read(mock, value); // DRW + RDBUFF
    }

    /// Queues the wire traffic for one `CortexM::read_register` call whose
    /// `S_REGRDY` poll succeeds on the first attempt: write DCRSR, poll
    /// DHCSR once, read DCRDR.
    fn push_read_register(mock: &mut MockTransport, value: u32) {
        push_mem_write(mock); // DCRSR select
        push_mem_read(mock, DHCSR_S_HALT | DHCSR_S_REGRDY); // S_REGRDY poll
        push_mem_read(mock, value); // DCRDR
    }

    /// Queues the wire traffic for one `CortexM::write_register` call whose
    /// `S_REGRDY` poll succeeds on the first attempt: write DCRDR, write
    /// DCRSR, poll DHCSR once.
    fn push_write_register(mock: &mut MockTransport) {
        push_mem_write(mock); // DCRDR
        push_mem_write(mock); // DCRSR select
        push_mem_read(mock, DHCSR_S_HALT | DHCSR_S_REGRDY); // S_REGRDY poll
    }

    /// Queues every wire transaction `initialize()` and the start of
    /// `on_halt` issue onto `mock`: DHCSR enable, DHCSR halt poll, DFSR
    /// read, PC read, and the instruction word fetch. `pc` must be
    /// word-aligned with bit 1 clear so the breakpoint lands in the low
    /// halfword of `instruction_word`. Callers queue the rest of the
    /// scenario (the R0/R1 reads and, if applicable, the PC write-back)
    /// before building the `Dap`/`MemoryAp`/`CortexM` trio, since the mock
    /// transport can't be reached once it's wrapped inside `SwdDriver`.
    fn queue_halt_prefix(mock: &mut MockTransport, pc: u32, instruction_word: u32) {
        // CortexM::initialize: write DHCSR (first AP access of the
        // session, so SELECT and CSW are each written once here), then
        // read it back.
        push_write(mock); // SELECT
        push_write(mock); // CSW
        push_mem_write(mock); // DHCSR write (C_DEBUGEN): TAR + DRW
        push_mem_read(mock, DHCSR_S_HALT); // DHCSR read-back, halted

        // on_halt: halt_reason() reads DFSR and finds BKPT set.
        push_mem_read(mock, DFSR_BKPT);

        // on_halt: pc() reads R15 via DCRSR/DCRDR.
        push_read_register(mock, pc);

        // on_halt: fetch the instruction word at the aligned PC.
        push_mem_read(mock, instruction_word);
    }

    /// Builds a `Dap`/`MemoryAp`/`CortexM` trio over `mock` and drives
    /// `CortexM::initialize`, asserting it lands in the halted state
    /// `queue_halt_prefix` staged.
    fn initialize_halted(mock: MockTransport) -> (Dap<MockTransport>, MemoryAp<MockTransport>, CortexM) {
        let driver = SwdDriver::new(mock);
        let mut dap = Dap::new(driver, 0x0bc1_1477);
        let mut mem = MemoryAp::new();
        let mut core = CortexM::new();
        core.initialize(&mut dap, &mut mem).expect("initialize");
        assert_eq!(core.state(), TargetState::Halted);
        (dap, mem, core)
    }

    #[test]
    fn semihosting_round_trip_writes_byte_advances_pc_and_resumes() {
        let pc = 0x2000_1000u32;
        let instruction_word = 0x1234_beabu32; // low halfword: BKPT 0xAB

        let mut mock = MockTransport::default();
        queue_halt_prefix(&mut mock, pc, instruction_word);
        // R0 = SYS_WRITEC, R1 = 'X'.
        push_read_register(&mut mock, SYS_WRITEC);
        push_read_register(&mut mock, b'X' as u32);
        // PC written back as pc + 2.
        push_write_register(&mut mock);

        let (mut dap, mut mem, mut core) = initialize_halted(mock);

        let mut console = Vec::new();
        let action = on_halt(&mut dap, &mut mem, &mut core, &mut console).expect("on_halt");

        assert!(matches!(action, LoopAction::Resume));
        assert_eq!(console, vec![b'X']);
    }

    #[test]
    fn unsupported_semihosting_operation_is_rejected_without_advancing_pc() {
        let pc = 0x2000_2000u32;
        let instruction_word = 0x0000_beabu32;

        let mut mock = MockTransport::default();
        queue_halt_prefix(&mut mock, pc, instruction_word);
        // R0 = SYS_WRITE0 (unsupported), R1 = 0. No further wire traffic is
        // queued past here: if `on_halt` tried to write PC back it would
        // hit the mock's empty reply queue and surface a transport error
        // instead of `UnsupportedOperation`, so this also pins down that PC
        // is left untouched.
        push_read_register(&mut mock, SYS_WRITE0);
        push_read_register(&mut mock, 0);

        let (mut dap, mut mem, mut core) = initialize_halted(mock);

        let mut console = Vec::new();
        let err = on_halt(&mut dap, &mut mem, &mut core, &mut console).unwrap_err();

        assert!(matches!(
            err,
            SemihostingError::UnsupportedOperation { operation: 0x04, parameter: 0 }
        ));
        assert!(console.is_empty());
    }
}
