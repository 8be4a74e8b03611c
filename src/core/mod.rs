//! L4: the Cortex-M target driver.

mod cortex_m;

pub use cortex_m::{CortexM, HaltReason, RegisterId, TargetState};
