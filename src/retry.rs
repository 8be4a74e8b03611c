//! A first-class bounded-retry combinator, parameterized over
//! `(op, predicate, bound)` rather than inlined at each call site.

use std::{thread, time::Duration};

/// Re-invokes `op` until it returns `Ok` or `attempts` calls have been made.
///
/// `op` returning `Err` is treated as "retry unless attempts are exhausted".
/// This is the right shape for ACK-WAIT retries and polling loops like
/// `S_HALT`/`S_REGRDY`, both of which retry an operation that either
/// succeeds outright or needs to be tried again.
pub fn retry<T, E>(attempts: usize, mut op: impl FnMut(usize) -> Result<T, E>) -> Result<T, E> {
    debug_assert!(attempts > 0);
    let mut last_err = None;
    for attempt in 0..attempts {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.expect("attempts > 0 guarantees at least one iteration ran"))
}

/// Re-invokes `poll` until it returns `Some`, sleeping `backoff` between
/// attempts, or returns `timeout_err` once `attempts` is exhausted.
///
/// Used for the S_HALT / S_REGRDY / CTRL-STAT power-up-ack polling loops,
/// where the operation itself cannot fail (it is a register read) but the
/// condition it is waiting on may not yet be true.
pub fn poll_until<T, E>(
    attempts: usize,
    backoff: Duration,
    timeout_err: impl FnOnce() -> E,
    mut poll: impl FnMut() -> Result<Option<T>, E>,
) -> Result<T, E> {
    for attempt in 0..attempts {
        if let Some(value) = poll()? {
            return Ok(value);
        }
        if attempt + 1 < attempts {
            thread::sleep(backoff);
        }
    }
    Err(timeout_err())
}
