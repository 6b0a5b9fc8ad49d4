//! Retry classification and exponential backoff for the transfer loop.

use std::time::Duration;

use geoupload_protocol::constants::{MAX_BACKOFF_SECS, MAX_RETRIES};

use crate::session::SessionError;

/// Backoff settings for consecutive failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive retriable failures that abort the transfer.
    pub max_retries: u32,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            max_delay: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following the `retries`-th failure:
    /// `min(2^retries, max_delay)` seconds.
    pub fn delay_for_retry(&self, retries: u32) -> Duration {
        let secs = 1u64.checked_shl(retries.min(63)).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_delay)
    }

    /// Whether `retries` consecutive failures exhaust the budget.
    pub fn exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}

impl SessionError {
    /// Whether the loop should refetch the offset and try again.
    ///
    /// Connection and timeout failures and 5xx responses are transient. A 4xx
    /// is transient only when its JSON body sets `debug_info.retriable`.
    pub fn is_retriable(&self) -> bool {
        match self {
            SessionError::Connection(_) | SessionError::Timeout(_) => true,
            SessionError::Http { status, body } => match status {
                400..=499 => body_flags_retriable(body),
                _ => *status >= 500,
            },
            _ => false,
        }
    }
}

fn body_flags_retriable(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/debug_info/retriable").and_then(|r| r.as_bool()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16, body: &str) -> SessionError {
        SessionError::Http {
            status,
            body: body.into(),
        }
    }

    #[test]
    fn default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 200);
        assert_eq!(policy.max_delay, Duration::from_secs(16));
    }

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=6)
            .map(|r| policy.delay_for_retry(r).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 16, 16]);
        assert_eq!(policy.delay_for_retry(199), Duration::from_secs(16));
    }

    #[test]
    fn exhausted_at_cap() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(199));
        assert!(policy.exhausted(200));
    }

    #[test]
    fn transport_errors_are_retriable() {
        assert!(SessionError::Connection("refused".into()).is_retriable());
        assert!(SessionError::Timeout("30s".into()).is_retriable());
    }

    #[test]
    fn server_errors_are_retriable() {
        assert!(http(500, "").is_retriable());
        assert!(http(503, "<html>").is_retriable());
    }

    #[test]
    fn client_errors_need_flag() {
        assert!(!http(400, "").is_retriable());
        assert!(!http(404, "not json").is_retriable());
        assert!(!http(412, r#"{"debug_info":{}}"#).is_retriable());
        assert!(!http(412, r#"{"debug_info":{"retriable":false}}"#).is_retriable());
        assert!(http(412, r#"{"debug_info":{"retriable":true}}"#).is_retriable());
    }

    #[test]
    fn other_errors_are_fatal() {
        assert!(!SessionError::Protocol("bad offset".into()).is_retriable());
        assert!(!http(302, "").is_retriable());
        let io = std::io::Error::other("disk");
        assert!(!SessionError::Io(io).is_retriable());
    }
}
