//! Timing helpers.

use std::time::Instant;

/// Milliseconds elapsed since `start`, saturating at `u64::MAX`.
#[must_use]
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_elapsed_ms_counts_sleep() {
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(5));
        assert!(elapsed_ms(start) >= 5);
    }
}
