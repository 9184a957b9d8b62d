use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// Retry a fallible vSphere operation with exponential backoff.
///
/// Attempt `n` (1-based) sleeps `backoff_secs * 2^(n-1)` seconds before the
/// next try. The last error is returned once `retries` attempts are spent.
/// `label` names the operation in log lines.
pub fn retry_op<F, T>(retries: u32, backoff_secs: f64, label: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let retries = retries.max(1);
    let mut last_err = None;

    for attempt in 1..=retries {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) => {
                if attempt < retries {
                    let sleep = backoff_secs * f64::from(1u32 << (attempt - 1));
                    warn!(
                        op = label,
                        attempt,
                        retries,
                        sleep_secs = sleep,
                        error = %e,
                        "operation failed, backing off",
                    );
                    thread::sleep(Duration::from_secs_f64(sleep));
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_first_try_success_skips_backoff() {
        let result = retry_op(3, 60.0, "clone_vm", || Ok("vm"));
        assert_eq!(result.unwrap(), "vm");
    }

    #[test]
    fn test_succeeds_on_later_attempt() {
        let count = Cell::new(0);
        let result = retry_op(3, 0.001, "power_on_vm", || {
            let c = count.get() + 1;
            count.set(c);
            if c < 3 {
                anyhow::bail!("task still failing");
            }
            Ok(c)
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhausts_attempts_and_returns_last_error() {
        let count = Cell::new(0);
        let result: Result<()> = retry_op(3, 0.001, "rename_vm", || {
            count.set(count.get() + 1);
            anyhow::bail!("attempt {}", count.get());
        });
        assert_eq!(count.get(), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[test]
    fn test_zero_retries_still_runs_once() {
        let count = Cell::new(0);
        let _: Result<()> = retry_op(0, 0.001, "delete_vm", || {
            count.set(count.get() + 1);
            anyhow::bail!("fail");
        });
        assert_eq!(count.get(), 1);
    }
}
