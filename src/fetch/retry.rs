//! fetch::retry
//!
//! Bounded retry for recoverable transport failures.
//!
//! # Policy
//!
//! Only errors classified [`ErrorKind::TransportRecoverable`] are retried
//! (connection reset, temporary DNS failure, handshake timeout). Rejected
//! credentials and permanent transport failures surface immediately.
//! Partial progress does not refill the attempt budget: one budget per
//! logical operation.

use std::time::Duration;

use crate::core::context::OpContext;
use crate::error::{Error, ErrorKind};

/// Pure recoverability predicate over the error taxonomy.
pub fn is_recoverable(error: &Error) -> bool {
    error.kind() == ErrorKind::TransportRecoverable
}

/// Run `op` up to `attempts` times, pausing `interval` between tries.
///
/// Retries only recoverable failures (logged at debug); the last error is
/// returned when the budget is exhausted. Cancellation is honored between
/// attempts.
pub fn with_retry<T>(
    attempts: u32,
    interval: Duration,
    ctx: &OpContext,
    mut op: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        ctx.check_interrupted()?;
        match op() {
            Ok(value) => return Ok(value),
            Err(error) if is_recoverable(&error) && attempt < attempts => {
                tracing::debug!(
                    attempt,
                    attempts,
                    error = %error,
                    "recoverable transport error, will retry"
                );
                attempt += 1;
                std::thread::sleep(interval);
            }
            Err(error) => return Err(error),
        }
    }
}
