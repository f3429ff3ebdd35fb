use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the unix epoch.
///
/// Lease ages and idle time are measured against this, so tests swap in a
/// [`ManualClock`] to step time without sleeping.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Mutex<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Mutex::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by_ms = by.as_millis().min(u128::from(u64::MAX)) as u64;
        let mut now = match self.now_ms.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        *now = now.saturating_add(by_ms);
    }

    pub fn set(&self, now_ms: u64) {
        match self.now_ms.lock() {
            Ok(mut g) => *g = now_ms,
            Err(poison) => *poison.into_inner() = now_ms,
        }
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        match self.now_ms.lock() {
            Ok(g) => *g,
            Err(poison) => *poison.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
