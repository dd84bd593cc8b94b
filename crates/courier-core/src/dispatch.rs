//! Dispatch request/outcome value objects and the dispatch error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{SessionId, Target};

/// Iterations used when a request does not carry a usable count.
pub const DEFAULT_ITERATIONS: u32 = 10;

// ============================================================================
// Iteration Count
// ============================================================================

/// Iteration count as supplied by a caller.
///
/// Control-plane callers send either a number or free text; both are
/// coerced with [`IterationSpec::coerce`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IterationSpec {
    Count(i64),
    Decimal(f64),
    Text(String),
}

impl IterationSpec {
    /// Coerces an optional spec into a positive iteration count.
    ///
    /// Text is read like a permissive integer parse: leading whitespace,
    /// an optional sign and the longest run of digits ("3abc" is 3).
    /// Decimals are truncated. Absent, unparsable, zero or negative
    /// values fall back to `default`; counts past `u32::MAX` saturate.
    #[must_use]
    pub fn coerce(spec: Option<&IterationSpec>, default: u32) -> u32 {
        let parsed = match spec {
            Some(Self::Count(n)) => Some(*n),
            Some(Self::Decimal(f)) if f.is_finite() => Some(f.trunc() as i64),
            Some(Self::Decimal(_)) => None,
            Some(Self::Text(s)) => parse_leading_int(s),
            None => None,
        };

        match parsed {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => default.max(1),
        }
    }
}

impl From<u32> for IterationSpec {
    fn from(n: u32) -> Self {
        Self::Count(i64::from(n))
    }
}

impl From<&str> for IterationSpec {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

fn parse_leading_int(s: &str) -> Option<i64> {
    let trimmed = s.trim_start();
    let (negative, rest) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, trimmed.get(1..)?),
        Some(b'+') => (false, trimmed.get(1..)?),
        _ => (false, trimmed),
    };

    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    // Saturate on overflow.
    let value = digits.parse::<i64>().unwrap_or(i64::MAX);
    Some(if negative { -value } else { value })
}

// ============================================================================
// Dispatch Request
// ============================================================================

/// "Run unit U on session S against target T, N times."
///
/// Exists only for the duration of one dispatch call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub session_id: SessionId,
    /// Raw target as supplied; normalized by the engine.
    pub target: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<IterationSpec>,
}

impl DispatchRequest {
    pub fn new(
        session_id: SessionId,
        target: impl Into<String>,
        unit: impl Into<String>,
        iterations: Option<IterationSpec>,
    ) -> Self {
        Self {
            session_id,
            target: target.into(),
            unit: unit.into(),
            iterations,
        }
    }
}

// ============================================================================
// Dispatch Errors
// ============================================================================

/// Error taxonomy of the dispatch core.
///
/// Only `EngineFault`, `UnitNotFound` and `SessionDeath` ever reach a
/// [`DispatchOutcome`]; verification and per-iteration transport failures
/// are contained and logged where they occur.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    /// Session handle missing or never authenticated; reconnect first.
    #[error("engine fault: {reason}")]
    EngineFault { reason: String },

    /// Neither pool nor the default unit resolves the name.
    #[error("unit not found: {name}")]
    UnitNotFound { name: String },

    /// A unit candidate lacks required manifest fields.
    #[error("verification failure for {name}: {reason}")]
    VerificationFailure { name: String, reason: String },

    /// A single send/encode operation failed.
    #[error("transport failure: {reason}")]
    TransportFailure { reason: String },

    /// The session handle is no longer usable.
    #[error("session died: {reason}")]
    SessionDeath { reason: String },
}

impl DispatchError {
    pub fn engine_fault(reason: impl Into<String>) -> Self {
        Self::EngineFault {
            reason: reason.into(),
        }
    }

    pub fn session_death(reason: impl Into<String>) -> Self {
        Self::SessionDeath {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Dispatch Outcome
// ============================================================================

/// Aggregate result of one dispatch call.
///
/// `success` is true whenever the loop ran to completion, even if
/// individual iterations failed (see `failed`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DispatchError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,

    /// Iterations whose unit execution returned successfully.
    #[serde(default)]
    pub completed: u32,

    /// Iterations whose unit execution failed and was contained.
    #[serde(default)]
    pub failed: u32,
}

impl DispatchOutcome {
    /// A guard-condition rejection; nothing was sent.
    #[must_use]
    pub fn rejected(error: DispatchError) -> Self {
        Self {
            success: false,
            error: Some(error),
            target: None,
            completed: 0,
            failed: 0,
        }
    }

    /// The loop ran all iterations.
    #[must_use]
    pub fn finished(target: Target, completed: u32, failed: u32) -> Self {
        Self {
            success: true,
            error: None,
            target: Some(target),
            completed,
            failed,
        }
    }

    /// The loop stopped early because the session died.
    #[must_use]
    pub fn aborted(target: Target, error: DispatchError, completed: u32, failed: u32) -> Self {
        Self {
            success: false,
            error: Some(error),
            target: Some(target),
            completed,
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coerce(spec: Option<IterationSpec>) -> u32 {
        IterationSpec::coerce(spec.as_ref(), DEFAULT_ITERATIONS)
    }

    #[test]
    fn test_coerce_defaults_when_absent() {
        assert_eq!(coerce(None), 10);
    }

    #[test]
    fn test_coerce_non_numeric_text_uses_default() {
        assert_eq!(coerce(Some("abc".into())), 10);
        assert_eq!(coerce(Some("".into())), 10);
    }

    #[test]
    fn test_coerce_numbers_and_numeric_text() {
        assert_eq!(coerce(Some(3u32.into())), 3);
        assert_eq!(coerce(Some("7".into())), 7);
        assert_eq!(coerce(Some(" 12 times".into())), 12);
        assert_eq!(coerce(Some(IterationSpec::Decimal(4.9))), 4);
    }

    #[test]
    fn test_coerce_non_positive_uses_default() {
        assert_eq!(coerce(Some(IterationSpec::Count(0))), 10);
        assert_eq!(coerce(Some(IterationSpec::Count(-5))), 10);
        assert_eq!(coerce(Some("-2".into())), 10);
        assert_eq!(coerce(Some(IterationSpec::Decimal(f64::NAN))), 10);
    }

    #[test]
    fn test_coerce_keeps_large_counts() {
        assert_eq!(coerce(Some(IterationSpec::Count(5_000))), 5_000);
        assert_eq!(coerce(Some("99999999999999999999999".into())), u32::MAX);
        assert_eq!(coerce(Some(IterationSpec::Count(i64::MAX))), u32::MAX);
    }

    #[test]
    fn test_iteration_spec_deserializes_number_or_text() {
        let spec: IterationSpec = serde_json::from_str("3").unwrap();
        assert_eq!(spec, IterationSpec::Count(3));
        let spec: IterationSpec = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(spec, IterationSpec::Text("abc".to_string()));
    }

    #[test]
    fn test_dispatch_error_display() {
        let err = DispatchError::engine_fault("no session");
        assert_eq!(err.to_string(), "engine fault: no session");

        let err = DispatchError::UnitNotFound {
            name: "ping".to_string(),
        };
        assert_eq!(err.to_string(), "unit not found: ping");
    }

    #[test]
    fn test_outcome_shape_serialization() {
        let outcome = DispatchOutcome::rejected(DispatchError::engine_fault("missing"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["kind"], "engine_fault");
        assert!(json.get("target").is_none());

        let outcome = DispatchOutcome::finished(Target::new("1@s.direct"), 3, 0);
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["target"], "1@s.direct");
        assert!(json.get("error").is_none());
    }
}
