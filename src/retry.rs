//! Retry pacing shared by the transceiver driver and the IPC connectors.

use std::time::Duration;

/// Delay before the next attempt after `failures` consecutive failures:
/// 100ms, 200ms, ... capped at 1.6s.
pub fn backoff(failures: u32) -> Duration {
    Duration::from_millis(50 * (1 << failures.min(5)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(0), Duration::from_millis(50));
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(2), Duration::from_millis(200));
        assert_eq!(backoff(5), Duration::from_millis(1600));
        assert_eq!(backoff(u32::MAX), Duration::from_millis(1600));
    }
}
