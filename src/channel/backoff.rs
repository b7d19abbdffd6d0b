use std::time::Duration;

/// Reconnect schedule. Attempt `n` waits `delays[n]`; past the end of the
/// list the last delay repeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        let delays = if delays.is_empty() {
            vec![Duration::ZERO]
        } else {
            delays
        };
        Self { delays }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// True once every scheduled delay has been used up.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt as usize >= self.delays.len()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(vec![
            Duration::ZERO,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_cap_at_the_last_entry() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(30));
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn exhaustion_tracks_schedule_length() {
        let backoff = Backoff::new(vec![Duration::ZERO, Duration::from_secs(1)]);
        assert!(!backoff.exhausted(1));
        assert!(backoff.exhausted(2));
    }

    #[test]
    fn empty_schedule_retries_immediately() {
        let backoff = Backoff::new(Vec::new());
        assert_eq!(backoff.delay(5), Duration::ZERO);
        assert!(backoff.exhausted(1));
    }
}
