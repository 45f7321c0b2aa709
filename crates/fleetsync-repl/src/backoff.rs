//! Retry backoff policy.
//!
//! Exponential with a hard cap: the base delay doubles per attempt up to the
//! configured ceiling (one hour by default), with up to 25% additive jitter
//! so a fleet of failing units doesn't retry in lockstep. The base is
//! monotonic non-decreasing in the attempt count and resets to zero on
//! success.

use rand::Rng;

/// Base delay in seconds before jitter, for the given attempt count.
pub fn base_delay_secs(retry_count: u32, cap_secs: u64) -> u64 {
    if retry_count == 0 {
        return 0;
    }
    // 2^retry_count, saturating well past any sensible cap.
    let exp = retry_count.min(32);
    (1u64 << exp).min(cap_secs)
}

/// Delay in microseconds for the given attempt count: capped exponential
/// base plus up to 25% random jitter (also capped).
pub fn next_retry_delay_us(retry_count: u32, cap_us: u64) -> u64 {
    let cap_secs = (cap_us / 1_000_000).max(1);
    let base = base_delay_secs(retry_count, cap_secs);
    let jitter = if base > 0 {
        rand::thread_rng().gen_range(0..=base / 4)
    } else {
        0
    };
    ((base + jitter) * 1_000_000).min(cap_us + cap_us / 4)
}

/// Absolute retry timestamp: `now + delay(retry_count)`.
pub fn next_retry_time_us(now_us: u64, retry_count: u32, cap_us: u64) -> u64 {
    now_us + next_retry_delay_us(retry_count, cap_us)
}
