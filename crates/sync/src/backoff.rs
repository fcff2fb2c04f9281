use std::time::Duration;

/// Reconnection backoff: doubles from one second up to a fixed cap.
#[derive(Debug, Clone)]
pub struct GeometricBackoff {
    current: u64,
    max: u64,
}

impl GeometricBackoff {
    const START_SECS: u64 = 1;
    const MAX_SECS: u64 = 30;

    pub fn new() -> Self {
        Self {
            current: Self::START_SECS,
            max: Self::MAX_SECS,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current);
        self.current = self.max.min(self.current * 2);
        delay
    }
}

impl Default for GeometricBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for GeometricBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps_at_thirty_seconds() {
        let delays: Vec<u64> = GeometricBackoff::new()
            .take(8)
            .map(|d| d.as_secs())
            .collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn attempt_times_accumulate_geometrically() {
        // Connect attempts land at the cumulative sums of the schedule:
        // t = 0, 1, 3, 7, 15, 31, 61, ...
        let mut t = 0;
        let mut attempts = vec![t];

        for delay in GeometricBackoff::new().take(6) {
            t += delay.as_secs();
            attempts.push(t);
        }

        assert_eq!(attempts, vec![0, 1, 3, 7, 15, 31, 61]);
    }
}
