use std::time::{Duration, Instant};

use crate::error::{HwError, Result};

/// Poll `done` until it returns true or `timeout` expires. Sleeps between
/// polls to avoid CPU spinning.
pub fn wait_until(
    mut done: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return Err(HwError::Timeout);
        }
        std::thread::sleep(poll_interval);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn completes_once_predicate_flips() {
        let n = AtomicU32::new(0);
        wait_until(
            || n.fetch_add(1, Ordering::Relaxed) >= 3,
            Duration::from_secs(1),
            Duration::from_millis(1),
        )
        .unwrap();
    }

    #[test]
    fn times_out_when_predicate_never_flips() {
        let r = wait_until(
            || false,
            Duration::from_millis(20),
            Duration::from_millis(5),
        );
        assert!(matches!(r, Err(HwError::Timeout)));
    }
}
