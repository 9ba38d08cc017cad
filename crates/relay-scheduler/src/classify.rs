//! Failure classification from backend error text.
//!
//! Invokers that get structured status codes should map them directly. This
//! is the fallback for backends that only hand back a message.

use regex::Regex;
use relay_core::FailureClass;
use std::sync::OnceLock;
use std::time::Duration;

/// Pattern groups, checked in order. First group with a hit wins.
const PATTERN_GROUPS: &[(FailureClass, &[&str])] = &[
    (
        FailureClass::RateLimit,
        &[
            "429",
            "rate limit",
            "rate_limit",
            "too many requests",
            "quota",
            "resource exhausted",
            "resource_exhausted",
            "overloaded",
        ],
    ),
    (
        FailureClass::Auth,
        &[
            "401",
            "403",
            "unauthorized",
            "forbidden",
            "api key",
            "api_key",
            "authentication",
        ],
    ),
    (
        FailureClass::ContextOverflow,
        &[
            "context length",
            "context_length",
            "context window",
            "too long",
            "maximum context",
        ],
    ),
    (
        FailureClass::ModelUnavailable,
        &[
            "model not found",
            "404",
            "no such model",
            "model unavailable",
            "deprecated",
        ],
    ),
    (
        FailureClass::ServerError,
        &[
            "500",
            "502",
            "503",
            "504",
            "internal server error",
            "bad gateway",
            "service unavailable",
            "timeout",
            "timed out",
            "connection",
            "network",
        ],
    ),
];

/// Classify a backend error message into the closed failure taxonomy.
///
/// Unrecognized messages are `OtherFatal`: the chain stops rather than
/// burning attempts on an error nobody understands.
pub fn classify_failure_text(message: &str) -> FailureClass {
    let lowered = message.to_lowercase();
    PATTERN_GROUPS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lowered.contains(p)))
        .map_or(FailureClass::OtherFatal, |(class, _)| *class)
}

fn retry_after_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)retry[\s_-]*after[\s:=]*(\d+(?:\.\d+)?)\s*(milliseconds?|ms|seconds?|secs?|s)?",
            )
            .ok()
        })
        .as_ref()
}

/// Extract a `retry after N` hint from an error message.
///
/// Units default to seconds; `ms`/`milliseconds` are honored.
pub fn parse_retry_after_hint(message: &str) -> Option<Duration> {
    let captures = retry_after_pattern()?.captures(message)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let is_millis = captures
        .get(2)
        .is_some_and(|unit| unit.as_str().to_lowercase().starts_with('m'));
    let seconds = if is_millis { value / 1000.0 } else { value };
    Duration::try_from_secs_f64(seconds).ok()
}
