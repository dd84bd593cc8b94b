//! Dispatch target addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DomainError, DomainResult};

/// Suffix appended to bare numeric targets for direct (non-group) addressing.
pub const DEFAULT_DIRECT_SUFFIX: &str = "@s.direct";

/// A fully-qualified recipient address (`<id>@<domain>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(String);

impl Target {
    /// Normalizes operator input into a target address.
    ///
    /// Input that already carries a domain (contains `@`) is passed through
    /// unchanged. Anything else is treated as a bare numeric identifier:
    /// non-digits are dropped and `direct_suffix` is appended.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidTarget` for bare input with no digits.
    pub fn normalize(raw: &str, direct_suffix: &str) -> DomainResult<Self> {
        if raw.contains('@') {
            return Ok(Self(raw.to_string()));
        }

        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(DomainError::InvalidTarget {
                input: raw.to_string(),
            });
        }

        Ok(Self(format!("{digits}{direct_suffix}")))
    }

    /// Wraps an already-qualified address.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Target {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_number_gets_direct_suffix() {
        let target = Target::normalize("628123456789", DEFAULT_DIRECT_SUFFIX).unwrap();
        assert_eq!(target.as_str(), "628123456789@s.direct");
    }

    #[test]
    fn test_bare_input_is_cleaned_before_suffixing() {
        let target = Target::normalize("+62 812-3456", "@example.net").unwrap();
        assert_eq!(target.as_str(), "628123456@example.net");
    }

    #[test]
    fn test_qualified_target_passes_through() {
        let target = Target::normalize("1203630@g.group", DEFAULT_DIRECT_SUFFIX).unwrap();
        assert_eq!(target.as_str(), "1203630@g.group");
    }

    #[test]
    fn test_bare_input_without_digits_is_rejected() {
        let err = Target::normalize("nobody", DEFAULT_DIRECT_SUFFIX).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTarget { .. }));
    }
}
