//! Exponential backoff with jitter for reconnect attempts.

use std::time::Duration;

use rand::Rng;

/// Delay before connection attempt number `attempt` (zero-based).
///
/// The first attempt goes out immediately. After that the delay doubles
/// from `base_ms`, is capped at `max_ms`, and gets up to 10% jitter so
/// clients dropped together do not reconnect in lockstep.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(factor).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}
