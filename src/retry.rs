use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};

/// Default retry budget: 900 attempts at 1 second spacing (15 minutes).
///
/// No exponential backoff; the fixed cadence is intentional so that test
/// runs are reproducible in wall time.
pub const DEFAULT_ATTEMPTS: u32 = 900;
/// Spacing between attempts: 1 second.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `predicate` until it returns `Ok(true)` or the retry budget is
/// exhausted.
///
/// `predicate` receives `false` on every attempt except a final one, which
/// is only made after the budget is exhausted and is passed `true` so
/// callers can log a "last chance" message. An `Err` returned by the
/// predicate aborts the retry immediately without consuming the rest of the
/// budget -- this is how e.g. `wait_for_unit` fails fast on a `failed` unit
/// instead of waiting out the full timeout.
pub fn retry<F>(predicate: F) -> Result<()>
where
    F: FnMut(bool) -> Result<bool>,
{
    retry_with(DEFAULT_ATTEMPTS, DEFAULT_INTERVAL, predicate)
}

/// Like [`retry`] but with an explicit attempt budget and spacing. Tests use
/// this to shrink the budget without touching the 900s/1s production
/// defaults.
pub fn retry_with<F>(attempts: u32, interval: Duration, mut predicate: F) -> Result<()>
where
    F: FnMut(bool) -> Result<bool>,
{
    for _ in 0..attempts {
        if predicate(false)? {
            return Ok(());
        }
        thread::sleep(interval);
    }

    if predicate(true)? {
        return Ok(());
    }

    bail!("action timed out")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn succeeds_immediately() {
        let calls = Cell::new(0);
        retry_with(5, Duration::from_millis(1), |_| {
            calls.set(calls.get() + 1);
            Ok(true)
        })
        .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn succeeds_on_final_attempt_without_exhausting_budget() {
        let calls = Cell::new(0);
        retry_with(3, Duration::from_millis(1), |_| {
            calls.set(calls.get() + 1);
            Ok(calls.get() == 3)
        })
        .unwrap();
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn succeeds_on_the_very_last_chance_call() {
        // attempts=3 means 3 regular calls (false) then one final call with
        // last=true. If that final call returns true, retry succeeds.
        let calls = Cell::new(0);
        retry_with(3, Duration::from_millis(1), |last| {
            calls.set(calls.get() + 1);
            Ok(last)
        })
        .unwrap();
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn times_out_and_marks_the_last_call() {
        let last_seen = Cell::new(false);
        let calls = Cell::new(0);
        let err = retry_with(3, Duration::from_millis(1), |last| {
            calls.set(calls.get() + 1);
            last_seen.set(last);
            Ok(false)
        })
        .unwrap_err();
        assert_eq!(calls.get(), 4);
        assert!(last_seen.get());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn propagates_errors_without_exhausting_budget() {
        let calls = Cell::new(0);
        let err = retry_with(10, Duration::from_millis(1), |_| {
            calls.set(calls.get() + 1);
            bail!("permanent failure")
        })
        .unwrap_err();
        assert_eq!(calls.get(), 1);
        assert_eq!(err.to_string(), "permanent failure");
    }
}
