//! Error taxonomy and retry policy.
//!
//! Pure functions only; the scheduler's state machine consumes the
//! categories produced here, never raw errors.

use serde::{Deserialize, Serialize};

/// What a failed operation means for retry and cooldown behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The work does not exist or was deleted. Never retried with backoff;
    /// becomes `permanent_failed` after enough consecutive failed rounds.
    Invalid,
    /// Upstream throttling or congestion. Backs the item off and puts the
    /// whole round into cooldown.
    RateLimit,
    /// Expired or rejected token. Handled by one in-flight refresh; a
    /// second failure is round-fatal.
    Auth,
    /// Connection, DNS, TLS, or timeout trouble.
    Network,
    Unknown,
}

/// Per-category backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_secs: u64,
    pub cap_secs: u64,
    pub max_retries: u32,
}

/// Consecutive failed rounds after which an `invalid` work stops being retried.
pub const INVALID_FAILED_ROUNDS_LIMIT: u32 = 3;

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Invalid => "invalid",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Network => "network",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Backoff parameters, or `None` for categories that never back off
    /// locally (`invalid` re-runs next round, `auth` bubbles up).
    pub fn retry_policy(self) -> Option<RetryPolicy> {
        match self {
            ErrorCategory::RateLimit => Some(RetryPolicy {
                base_secs: 300,
                cap_secs: 3600,
                max_retries: 8,
            }),
            ErrorCategory::Network => Some(RetryPolicy {
                base_secs: 30,
                cap_secs: 1800,
                max_retries: 10,
            }),
            ErrorCategory::Unknown => Some(RetryPolicy {
                base_secs: 60,
                cap_secs: 1200,
                max_retries: 6,
            }),
            ErrorCategory::Invalid | ErrorCategory::Auth => None,
        }
    }

    /// Exponential backoff in seconds for the given retry ordinal (1-based).
    pub fn backoff_secs(self, retry_count: u32) -> u64 {
        let Some(policy) = self.retry_policy() else {
            return 0;
        };
        let exp = retry_count.saturating_sub(1).min(16);
        policy
            .base_secs
            .saturating_mul(1u64 << exp)
            .min(policy.cap_secs)
    }
}

const RATE_LIMIT_MARKERS: [&str; 3] = ["rate limit", "too many requests", "temporarily unavailable"];

/// True when a response body reads like upstream throttling.
pub fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Map an HTTP status (plus body text, for the ambiguous 403) onto a category.
pub fn classify_status(status: u16, body: &str) -> ErrorCategory {
    match status {
        404 => ErrorCategory::Invalid,
        401 => ErrorCategory::Auth,
        429 | 500 | 502 | 503 | 504 => ErrorCategory::RateLimit,
        403 if is_rate_limit_text(body) => ErrorCategory::RateLimit,
        _ => ErrorCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_for_retry_policy() {
        assert_eq!(classify_status(404, ""), ErrorCategory::Invalid);
        assert_eq!(classify_status(401, ""), ErrorCategory::Auth);
        assert_eq!(classify_status(429, ""), ErrorCategory::RateLimit);
        assert_eq!(classify_status(503, ""), ErrorCategory::RateLimit);
        assert_eq!(
            classify_status(403, "Rate Limit exceeded"),
            ErrorCategory::RateLimit
        );
        assert_eq!(classify_status(403, "forbidden"), ErrorCategory::Unknown);
        assert_eq!(classify_status(400, ""), ErrorCategory::Unknown);
    }

    #[test]
    fn rate_limit_markers_are_case_insensitive() {
        assert!(is_rate_limit_text("Too Many Requests"));
        assert!(is_rate_limit_text("service temporarily unavailable, try later"));
        assert!(!is_rate_limit_text("not found"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(ErrorCategory::RateLimit.backoff_secs(1), 300);
        assert_eq!(ErrorCategory::RateLimit.backoff_secs(2), 600);
        assert_eq!(ErrorCategory::RateLimit.backoff_secs(10), 3600);
        assert_eq!(ErrorCategory::Network.backoff_secs(1), 30);
        assert_eq!(ErrorCategory::Network.backoff_secs(7), 1800);
        assert_eq!(ErrorCategory::Unknown.backoff_secs(3), 240);
        assert_eq!(ErrorCategory::Auth.backoff_secs(5), 0);
        assert_eq!(ErrorCategory::Invalid.backoff_secs(5), 0);
    }

    #[test]
    fn retry_caps_match_policy_table() {
        assert_eq!(ErrorCategory::RateLimit.retry_policy().unwrap().max_retries, 8);
        assert_eq!(ErrorCategory::Network.retry_policy().unwrap().max_retries, 10);
        assert_eq!(ErrorCategory::Unknown.retry_policy().unwrap().max_retries, 6);
        assert!(ErrorCategory::Auth.retry_policy().is_none());
    }
}
