use std::io;
use std::path::Path;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReshardError, Result, is_transient_io};

/// Bounded retry with exponential backoff for transient I/O failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ReshardError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Runs `op` on `path`, retrying transient failures.
    ///
    /// Non-transient failures are returned immediately. A transient failure that
    /// persists through every attempt becomes [`ReshardError::IoTimeout`] when it was a
    /// timeout and [`ReshardError::Io`] otherwise.
    pub fn run<T, F>(&self, path: &Path, mut op: F) -> Result<T>
    where
        F: FnMut() -> io::Result<T>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient_io(&err) && attempt < attempts => {
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "Transient failure on {} (attempt {attempt}/{attempts}): {err}; retrying in {delay:?}",
                        path.display()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    return Err(ReshardError::IoTimeout {
                        path: path.to_path_buf(),
                        attempts: attempt,
                    });
                }
                Err(err) => return Err(ReshardError::io(path, err)),
            }
        }
    }
}

/// Runs one blocking read on its own thread and gives up on it after `timeout`.
///
/// An expired read is reported as [`io::ErrorKind::TimedOut`], which [`RetryPolicy::run`]
/// retries and finally surfaces as [`ReshardError::IoTimeout`]. The abandoned thread exits
/// whenever the underlying call returns.
pub(crate) fn with_deadline<T, F>(timeout: Duration, op: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    let (tx, rx) = channel();
    thread::Builder::new()
        .name("reshard-read".into())
        .spawn(move || {
            // The caller may have stopped waiting.
            let _ = tx.send(op());
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("read did not finish within {timeout:?}"),
        )),
        Err(RecvTimeoutError::Disconnected) => Err(io::Error::other("read thread exited early")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(1), Duration::from_millis(50));
        assert_eq!(policy.backoff(2), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(200));
        assert_eq!(policy.backoff(30), Duration::from_millis(2_000));
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let calls = Cell::new(0);
        let value = fast()
            .run(Path::new("blob"), || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(io::Error::new(io::ErrorKind::Interrupted, "signal"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_persistent_timeout_surfaces_as_io_timeout() {
        let calls = Cell::new(0);
        let err = fast()
            .run(Path::new("blob"), || -> io::Result<()> {
                calls.set(calls.get() + 1);
                Err(io::Error::new(io::ErrorKind::TimedOut, "slow disk"))
            })
            .unwrap_err();

        assert!(matches!(err, ReshardError::IoTimeout { attempts: 3, .. }));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_deadline_passes_fast_reads_through() {
        let value = with_deadline(Duration::from_secs(5), || Ok(vec![1u8, 2])).unwrap();

        assert_eq!(value, vec![1, 2]);
    }

    #[test]
    fn test_stalled_read_surfaces_as_io_timeout() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            ..fast()
        };
        let err = policy
            .run(Path::new("tp00_pp000.bin"), || {
                calls.set(calls.get() + 1);
                with_deadline(Duration::from_millis(20), || {
                    thread::sleep(Duration::from_millis(500));
                    Ok(0u8)
                })
            })
            .unwrap_err();

        assert!(matches!(err, ReshardError::IoTimeout { attempts: 2, .. }));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let err = fast()
            .run(Path::new("blob"), || -> io::Result<()> {
                calls.set(calls.get() + 1);
                Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
            })
            .unwrap_err();

        assert!(matches!(err, ReshardError::Io { .. }));
        assert_eq!(calls.get(), 1);
    }
}
