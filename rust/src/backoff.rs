use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_secs(1);
const MAX_EXPONENT: u32 = 30;
const JITTER_MIN: f64 = 0.75;
const JITTER_MAX: f64 = 1.25;

/// `min(base * 2^attempts, cap)` with no jitter applied.
pub fn capped_delay(attempts: u32, cap: Duration) -> Duration {
    let exponent = attempts.min(MAX_EXPONENT);
    let delay = BASE.saturating_mul(1u32 << exponent);
    delay.min(cap)
}

/// Capped exponential delay scaled by a random factor in `[0.75, 1.25]` so
/// that many clients reconnecting together spread out.
pub fn exponential_backoff(attempts: u32, cap: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
    capped_delay(attempts, cap).mul_f64(jitter)
}
