//! Job plans: the four long-running, sequential procedures a device worker
//! can run. Every plan polls a shared cancel flag between sub-steps, fails
//! fast on the first protocol/verify error, and always ends by emitting
//! exactly one `Finished` event — never a bare `Result` escapes to the
//! supervisor.

pub mod backup;
pub mod production;
pub mod qa;
pub mod reset_nor;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ChisError;
use crate::events::EventSink;

/// Shared cancellation flag a plan polls between sub-steps.
pub type CancelFlag = AtomicBool;

pub(crate) fn is_cancelled(cancel: &CancelFlag) -> bool {
    cancel.load(Ordering::Relaxed)
}

/// Runs `step`, and on failure logs it and reports `Finished{ok=false}`.
/// Returns `true` iff `step` succeeded.
pub(crate) fn run_step<F>(sink: &EventSink, step: F) -> bool
where
    F: FnOnce() -> Result<(), ChisError>,
{
    match step() {
        Ok(()) => true,
        Err(e) => {
            sink.log(format!("error: {}", e));
            sink.finished(false);
            false
        }
    }
}

/// Runs `step`, and on failure logs it and reports `Finished{ok=false}`.
/// Returns `Some(value)` iff `step` succeeded.
pub(crate) fn run_result<T, F>(sink: &EventSink, step: F) -> Option<T>
where
    F: FnOnce() -> Result<T, ChisError>,
{
    match step() {
        Ok(v) => Some(v),
        Err(e) => {
            sink.log(format!("error: {}", e));
            sink.finished(false);
            None
        }
    }
}

/// Checks the cancel flag; if set, logs and reports `Finished{ok=false}`.
/// Returns `true` iff cancelled (caller should return immediately).
pub(crate) fn bail_if_cancelled(cancel: &CancelFlag, sink: &EventSink) -> bool {
    if is_cancelled(cancel) {
        sink.log("cancelled");
        sink.finished(false);
        true
    } else {
        false
    }
}

/// `floor((k - 0.5) * 100 / n)`, the "entering step k of n" progress value.
pub(crate) fn progress_entering(k: usize, n: usize) -> u8 {
    (((k as f64) - 0.5) * 100.0 / (n as f64)).floor() as u8
}

/// `floor(k * 100 / n)`, the "completed step k of n" progress value.
pub(crate) fn progress_completed(k: usize, n: usize) -> u8 {
    ((k as f64) * 100.0 / (n as f64)).floor() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_formula_matches_two_step_scenario() {
        // 2 enabled steps: progress 25 -> 50 -> 75 -> 100
        assert_eq!(progress_entering(1, 2), 25);
        assert_eq!(progress_completed(1, 2), 50);
        assert_eq!(progress_entering(2, 2), 75);
        assert_eq!(progress_completed(2, 2), 100);
    }
}
