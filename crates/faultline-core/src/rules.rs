//! Error-code rules table.
//!
//! Maps error codes to severity and retry policy. Loaded once at startup
//! from configuration and read-only afterwards; swapping rules means
//! swapping the whole table.

use std::collections::HashMap;

use crate::types::Severity;

/// The rule entry for one error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    /// Severity assigned to incidents grouped under this code.
    pub severity: Severity,
    /// Name of the retry policy applied to remediation.
    pub retry_policy: String,
    /// Whether the error class is retryable at all. `false` here overrides
    /// the policy's own flag.
    pub retryable: bool,
}

impl RuleEntry {
    /// The documented default for unknown codes: medium severity, the
    /// `default` policy, retryable.
    #[must_use]
    pub fn unknown_default() -> Self {
        Self {
            severity: Severity::Medium,
            retry_policy: "default".to_string(),
            retryable: true,
        }
    }
}

/// Read-only lookup table from error code to rule entry.
#[derive(Debug, Clone)]
pub struct RulesTable {
    entries: HashMap<String, RuleEntry>,
    default: RuleEntry,
}

impl RulesTable {
    /// Builds a table from explicit entries.
    #[must_use]
    pub fn new(entries: HashMap<String, RuleEntry>) -> Self {
        Self {
            entries,
            default: RuleEntry::unknown_default(),
        }
    }

    /// Looks up the rule for an error code; unknown codes get the default.
    #[must_use]
    pub fn lookup(&self, error_code: &str) -> &RuleEntry {
        self.entries.get(error_code).unwrap_or(&self.default)
    }

    /// Returns `true` if the code is explicitly configured.
    #[must_use]
    pub fn contains(&self, error_code: &str) -> bool {
        self.entries.contains_key(error_code)
    }

    /// Number of explicitly configured codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no codes are explicitly configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RulesTable {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RulesTable {
        let mut entries = HashMap::new();
        entries.insert(
            "timeout".to_string(),
            RuleEntry {
                severity: Severity::High,
                retry_policy: "aggressive".to_string(),
                retryable: true,
            },
        );
        entries.insert(
            "invalid_credentials".to_string(),
            RuleEntry {
                severity: Severity::Critical,
                retry_policy: "none".to_string(),
                retryable: false,
            },
        );
        RulesTable::new(entries)
    }

    #[test]
    fn known_codes_resolve() {
        let table = table();
        let rule = table.lookup("timeout");
        assert_eq!(rule.severity, Severity::High);
        assert_eq!(rule.retry_policy, "aggressive");
        assert!(rule.retryable);
    }

    #[test]
    fn unknown_codes_get_the_documented_default() {
        let table = table();
        let rule = table.lookup("never_seen_before");
        assert_eq!(rule.severity, Severity::Medium);
        assert_eq!(rule.retry_policy, "default");
        assert!(rule.retryable);
    }

    #[test]
    fn non_retryable_codes_stay_non_retryable() {
        let table = table();
        assert!(!table.lookup("invalid_credentials").retryable);
    }
}
