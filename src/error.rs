//! Crate-wide error type composing the per-layer error kinds named in the
//! design (transport, protocol-ack-wait, protocol-fault, protocol-parity,
//! no-target, target-state, target-timeout, semihosting-unsupported).

use thiserror::Error;

/// Failures from the byte-oriented transport to the bridge chip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("USB bridge I/O failed: {0}")]
    Io(String),
    #[error("bridge reply framing was malformed: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("failed to place the bridge into the requested serial mode")]
    ConfigureFailed,
}

/// Failures from the SWD line driver (L1).
#[derive(Debug, Error)]
pub enum SwdError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// FAULT ACK: a sticky DP bit was set.
    #[error("SWD transaction faulted (sticky error bit set)")]
    ProtocolFault,

    /// WAIT ACK exhausted the retry budget.
    #[error("SWD transaction timed out waiting for an OK ack after retrying")]
    ProtocolAckWait,

    /// Data-phase parity did not match.
    #[error("parity mismatch on SWD read")]
    ProtocolParity,

    /// ACK bits were all-ones/all-zeros, or IDCODE read back as 0 / all-ones.
    #[error("no target responded on the SWD bus")]
    NoTarget,
}

/// Failures from the DP/AP engine (L2) and MEM-AP (L3).
#[derive(Debug, Error)]
pub enum DapError {
    #[error(transparent)]
    Swd(#[from] SwdError),

    #[error("address 0x{0:08x} is not aligned to the requested transfer size")]
    MisalignedAccess(u32),
}

/// Failures from the Cortex-M target driver (L4).
#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Dap(#[from] DapError),

    /// The caller attempted an operation that requires a different target
    /// state (e.g. a register read while the core is running).
    #[error("operation requires the target to be {required}, but it is {actual}")]
    WrongState {
        required: &'static str,
        actual: &'static str,
    },

    /// A polling condition (S_HALT, S_REGRDY, power-up ACKs) never became
    /// true within the retry bound.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Failures from the semihosting supervisor (L5).
#[derive(Debug, Error)]
pub enum SemihostingError {
    #[error(transparent)]
    Target(#[from] TargetError),

    /// The halted core stopped for a reason other than a semihosting
    /// breakpoint, or the instruction at PC was not `BKPT 0xAB`.
    #[error("core halted but not for a semihosting request (dfsr={dfsr:#010x}, pc={pc:#010x}, instruction={instruction:#06x})")]
    NotASemihostingBreakpoint {
        dfsr: u32,
        pc: u32,
        instruction: u16,
    },

    /// An unrecognized or not-yet-implemented `SYS_*` operation.
    #[error("unsupported semihosting operation {operation:#04x} (r1={parameter:#010x})")]
    UnsupportedOperation { operation: u32, parameter: u32 },
}

/// The single error type surfaced at the crate boundary and by the CLI
/// binaries. Each layer's error composes into this one via `#[from]`, so a
/// `main` that prints `source()` repeatedly gets the full call chain.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Swd(#[from] SwdError),
    #[error(transparent)]
    Dap(#[from] DapError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Semihosting(#[from] SemihostingError),
    #[error("unknown programmer {0:?}; see --help for the supported names")]
    UnknownProgrammer(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Prints `err` followed by its full `source()` chain, one "Caused by:" line
/// per layer, the way the `console-host`/`dump-flash` binaries report a
/// fatal error before exiting 1.
pub fn print_error_chain(err: &(dyn std::error::Error + 'static)) {
    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
