//! Pure retry/backoff classification (§4.D). No I/O, no shared state —
//! every function here is a plain transform so the proxy handler's retry
//! loop can call them without touching a lock.

use crate::config::{BackoffKind, RetryConfig};
use rand::Rng;
use std::time::Duration;

/// A response status is retryable at all only if it's in the configured
/// `retry_on` list.
pub fn should_retry(status: u16, cfg: &RetryConfig) -> bool {
    cfg.retry_on.contains(&status)
}

/// 401/403 mean the credential itself is bad, not the channel — the
/// caller should rotate to another key on the *same* channel before
/// burning a channel failover.
pub fn is_key_failure(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// 502/503/504 mean the channel as a whole is the problem. 429 is a
/// rate limit on the credential, not the backend — it's classified as a
/// key failure (see `is_key_failure`'s caller in the proxy handler),
/// not a channel failure, so it never excludes the channel outright.
pub fn is_channel_failure(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

/// Computes the backoff delay before retry attempt `attempt` (1-based:
/// the delay before the *first* retry, i.e. after the first failure).
/// Exponential backoff doubles `base_delay_ms` per attempt with +/-25%
/// jitter; fixed backoff always waits `base_delay_ms`. Both are capped at
/// `max_delay_ms`.
pub fn delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    let base = match cfg.backoff {
        BackoffKind::Fixed => cfg.base_delay_ms,
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
            cfg.base_delay_ms.saturating_mul(factor)
        }
    };
    let jittered = match cfg.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Exponential => {
            let jitter_range = (base as f64 * 0.25) as i64;
            if jitter_range == 0 {
                base
            } else {
                let delta = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
                (base as i64 + delta).max(0) as u64
            }
        }
    };
    Duration::from_millis(jittered.min(cfg.max_delay_ms))
}

/// Parses a `Retry-After` header value (seconds, or an HTTP-date) into a
/// concrete delay. Returns `None` if the value is malformed — the caller
/// falls back to the computed backoff in that case.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let target = httpdate::parse_http_date(value.trim()).ok()?;
    let now = std::time::SystemTime::now();
    target.duration_since(now).ok()
}

/// The hard attempt cap: `maxRetries + 1` total attempts (the initial try
/// plus `maxRetries` retries).
pub fn max_attempts(cfg: &RetryConfig) -> u32 {
    cfg.max_retries + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;

    fn cfg() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_on: vec![401, 403, 429, 502, 503, 504],
            backoff: BackoffKind::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }

    #[test]
    fn classifies_key_vs_channel_failures() {
        assert!(is_key_failure(401));
        assert!(is_key_failure(403));
        assert!(!is_key_failure(429));
        assert!(!is_channel_failure(429));
        assert!(is_channel_failure(503));
        assert!(!is_channel_failure(401));
    }

    #[test]
    fn should_retry_respects_configured_list() {
        let c = cfg();
        assert!(should_retry(503, &c));
        assert!(!should_retry(404, &c));
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let c = RetryConfig {
            backoff: BackoffKind::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 300,
            ..cfg()
        };
        // attempt 1 -> ~100ms (+/-25%), attempt 3 -> would be 400ms, capped at 300.
        let d3 = delay(3, &c);
        assert!(d3.as_millis() <= 300);
    }

    #[test]
    fn fixed_delay_is_constant() {
        let c = RetryConfig {
            backoff: BackoffKind::Fixed,
            base_delay_ms: 250,
            max_delay_ms: 8000,
            ..cfg()
        };
        assert_eq!(delay(1, &c), Duration::from_millis(250));
        assert_eq!(delay(5, &c), Duration::from_millis(250));
    }

    #[test]
    fn max_attempts_is_retries_plus_one() {
        assert_eq!(max_attempts(&cfg()), 4);
    }

    #[test]
    fn parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_retry_after_rejects_garbage() {
        assert!(parse_retry_after("not-a-date").is_none());
    }
}
