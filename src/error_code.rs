//! 错误分类：定义路由层统一的错误种类及其重试/回退语义。
//!
//! Error kinds for the relay.
//!
//! Every error surfaced by the relay maps onto exactly one [`ErrorKind`]. The kind
//! carries the metadata the resilience layer needs (is it worth retrying, may the
//! router move on to the next provider) and the presentation metadata a UI needs
//! (stable code and name).
//!
//! ## Kind Categories
//!
//! | Prefix | Category    | Description                          |
//! |--------|-------------|--------------------------------------|
//! | E1xxx  | credential  | Missing or rejected provider secrets |
//! | E2xxx  | rate        | Local budget or remote throttling    |
//! | E3xxx  | transport   | Network and timeout failures         |
//! | E4xxx  | client      | Validation and storage failures      |
//! | E5xxx  | routing     | Breaker, fallback and cancellation   |
//! | E9xxx  | unknown     | Catch-all / unclassified             |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay::error_code::ErrorKind;
//!
//! let kind = ErrorKind::from_http_status(429);
//! assert_eq!(kind.code(), "E2001");
//! assert!(kind.retryable());
//! assert_eq!(kind.category(), "rate");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// E1001: No credential configured for the provider
    CredentialMissing,
    /// E1002: Provider rejected the credential (401/403)
    CredentialInvalid,
    /// E2001: Local budget exceeded or provider throttled the call (429)
    RateLimited,
    /// E3001: Connection failure or upstream unavailable
    NetworkUnavailable,
    /// E3002: Call exceeded its deadline
    Timeout,
    /// E4001: Request rejected as malformed
    ValidationFailure,
    /// E4002: Persistence layer failure
    StorageFailure,
    /// E5001: Circuit breaker for the provider is open
    CircuitOpen,
    /// E5002: Every candidate provider failed
    AllProvidersFailed,
    /// E5003: Caller cancelled the request
    Cancelled,
    /// E9999: Error could not be classified
    Unknown,
}

impl ErrorKind {
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialMissing => "E1001",
            Self::CredentialInvalid => "E1002",
            Self::RateLimited => "E2001",
            Self::NetworkUnavailable => "E3001",
            Self::Timeout => "E3002",
            Self::ValidationFailure => "E4001",
            Self::StorageFailure => "E4002",
            Self::CircuitOpen => "E5001",
            Self::AllProvidersFailed => "E5002",
            Self::Cancelled => "E5003",
            Self::Unknown => "E9999",
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CredentialMissing => "credential_missing",
            Self::CredentialInvalid => "credential_invalid",
            Self::RateLimited => "rate_limited",
            Self::NetworkUnavailable => "network_unavailable",
            Self::Timeout => "timeout",
            Self::ValidationFailure => "validation_failure",
            Self::StorageFailure => "storage_failure",
            Self::CircuitOpen => "circuit_open",
            Self::AllProvidersFailed => "all_providers_failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the retry handler should try the same provider again by default.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::NetworkUnavailable | Self::Timeout
        )
    }

    /// Whether the router may move on to the next candidate after this error.
    ///
    /// Only cancellation stops the fallback chain; everything else is a
    /// per-provider fault as far as routing is concerned.
    #[inline]
    pub fn fallbackable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::CredentialMissing | Self::CredentialInvalid => "credential",
            Self::RateLimited => "rate",
            Self::NetworkUnavailable | Self::Timeout => "transport",
            Self::ValidationFailure | Self::StorageFailure => "client",
            Self::CircuitOpen | Self::AllProvidersFailed | Self::Cancelled => "routing",
            Self::Unknown => "unknown",
        }
    }

    /// Maps an HTTP status code to the most likely kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::ValidationFailure,
            401 | 403 => Self::CredentialInvalid,
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            500 | 502 | 503 | 529 => Self::NetworkUnavailable,
            _ => Self::Unknown,
        }
    }

    /// Classifies a free-form error message by well-known substrings.
    ///
    /// Rules are checked in priority order; the first match wins.
    pub fn classify_message(message: &str) -> Self {
        let m = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

        if has(&[
            "api key not set",
            "no api key found",
            "api key is required",
            "no credential",
        ]) {
            Self::CredentialMissing
        } else if has(&[
            "invalid api key",
            "incorrect api key",
            "unauthorized",
            "forbidden",
            "401",
            "403",
        ]) {
            Self::CredentialInvalid
        } else if has(&["rate limit", "too many requests", "429"]) {
            Self::RateLimited
        } else if has(&["network", "fetch failed", "connection", "offline"]) {
            Self::NetworkUnavailable
        } else if has(&["timeout", "timed out"]) {
            Self::Timeout
        } else if has(&["validation", "invalid"]) {
            Self::ValidationFailure
        } else if has(&["storage", "quota"]) {
            Self::StorageFailure
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_defaults() {
        let retryable = [
            ErrorKind::RateLimited,
            ErrorKind::NetworkUnavailable,
            ErrorKind::Timeout,
        ];
        for kind in retryable {
            assert!(kind.retryable(), "{} should be retryable", kind.name());
        }

        let fatal = [
            ErrorKind::CredentialMissing,
            ErrorKind::CredentialInvalid,
            ErrorKind::ValidationFailure,
            ErrorKind::StorageFailure,
            ErrorKind::CircuitOpen,
            ErrorKind::AllProvidersFailed,
            ErrorKind::Cancelled,
            ErrorKind::Unknown,
        ];
        for kind in fatal {
            assert!(!kind.retryable(), "{} should not be retryable", kind.name());
        }
    }

    #[test]
    fn test_only_cancellation_stops_fallback() {
        assert!(!ErrorKind::Cancelled.fallbackable());
        assert!(ErrorKind::CredentialMissing.fallbackable());
        assert!(ErrorKind::CircuitOpen.fallbackable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::from_http_status(401), ErrorKind::CredentialInvalid);
        assert_eq!(ErrorKind::from_http_status(403), ErrorKind::CredentialInvalid);
        assert_eq!(ErrorKind::from_http_status(429), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::from_http_status(504), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_http_status(503), ErrorKind::NetworkUnavailable);
        assert_eq!(ErrorKind::from_http_status(418), ErrorKind::Unknown);
    }

    #[test]
    fn test_message_classification() {
        let cases = [
            ("OpenAI API key not set", ErrorKind::CredentialMissing),
            ("Invalid API key (401)", ErrorKind::CredentialInvalid),
            ("rate limit exceeded (429)", ErrorKind::RateLimited),
            ("Too Many Requests", ErrorKind::RateLimited),
            ("fetch failed: connection reset", ErrorKind::NetworkUnavailable),
            ("Request timed out", ErrorKind::Timeout),
            ("validation error on field", ErrorKind::ValidationFailure),
            ("storage quota exceeded", ErrorKind::StorageFailure),
            ("something odd", ErrorKind::Unknown),
        ];
        for (msg, expected) in cases {
            assert_eq!(ErrorKind::classify_message(msg), expected, "message: {msg}");
        }
    }

    #[test]
    fn test_codes_are_unique() {
        use std::collections::HashSet;
        let all = [
            ErrorKind::CredentialMissing,
            ErrorKind::CredentialInvalid,
            ErrorKind::RateLimited,
            ErrorKind::NetworkUnavailable,
            ErrorKind::Timeout,
            ErrorKind::ValidationFailure,
            ErrorKind::StorageFailure,
            ErrorKind::CircuitOpen,
            ErrorKind::AllProvidersFailed,
            ErrorKind::Cancelled,
            ErrorKind::Unknown,
        ];
        let codes: HashSet<_> = all.iter().map(|k| k.code()).collect();
        assert_eq!(codes.len(), all.len());
    }
}
