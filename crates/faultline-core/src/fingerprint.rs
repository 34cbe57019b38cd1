//! Canonical failure fingerprints for incident grouping.
//!
//! A fingerprint groups morally-equivalent failures:
//!
//! ```text
//! fingerprint = lower(event_type) ":" normalize(error_code) ":" workflow_id
//! ```
//!
//! `normalize` lowercases, trims, and strips volatile substrings by
//! token-class substitution (UUIDs, long hex runs, digit runs). The
//! substitution set is fixed at construction and its description forms part
//! of the audit record, so a stored signature can always be traced back to
//! the exact normalization that produced it.
//!
//! Fingerprinting is pure and total: same event in, same signature out,
//! no side effects.

use regex::Regex;
use sha2::{Digest, Sha256};

/// Error code used when the payload carries none.
pub const UNKNOWN_ERROR_CODE: &str = "unknown";

/// Length of the short stable digest carried in incident metadata.
pub const DIGEST_LEN: usize = 16;

/// One token-class substitution: matched spans are replaced wholesale.
#[derive(Debug)]
struct Substitution {
    pattern: Regex,
    replacement: &'static str,
}

/// Derives canonical failure signatures.
///
/// Construct once and share; the substitution set is compiled at
/// construction and never changes afterwards.
#[derive(Debug)]
pub struct Fingerprinter {
    substitutions: Vec<Substitution>,
    description: String,
}

impl Fingerprinter {
    /// Builds a fingerprinter with the standard substitution set:
    /// UUIDs → `U`, hex runs of 8+ → `H`, digit runs of 3+ → `N`.
    ///
    /// # Panics
    ///
    /// Panics if a built-in pattern fails to compile, which would be a
    /// programming error caught by the unit tests.
    #[must_use]
    pub fn new() -> Self {
        let specs: &[(&str, &str, &str)] = &[
            (
                r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                "U",
                "uuid->U",
            ),
            (r"\b[0-9a-f]{8,}\b", "H", "hex8+->H"),
            (r"\b[0-9]{3,}\b", "N", "digits3+->N"),
        ];

        let substitutions = specs
            .iter()
            .map(|(pattern, replacement, _)| Substitution {
                pattern: Regex::new(pattern).expect("built-in substitution pattern"),
                replacement,
            })
            .collect();

        let description = specs
            .iter()
            .map(|(_, _, label)| *label)
            .collect::<Vec<_>>()
            .join(",");

        Self {
            substitutions,
            description,
        }
    }

    /// Returns the audit description of the substitution set, e.g.
    /// `uuid->U,hex8+->H,digits3+->N`.
    #[must_use]
    pub fn substitution_set(&self) -> &str {
        &self.description
    }

    /// Derives the signature for an event.
    ///
    /// `error_code` is the payload's error code; when absent the literal
    /// `unknown` is used.
    #[must_use]
    pub fn fingerprint(
        &self,
        event_type: &str,
        error_code: Option<&str>,
        workflow_id: &str,
    ) -> String {
        let code = error_code
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(UNKNOWN_ERROR_CODE);
        format!(
            "{}:{}:{}",
            event_type.to_lowercase(),
            self.normalize(code),
            workflow_id
        )
    }

    /// Normalizes an error code: lowercase, trim, substitute volatile
    /// token classes.
    #[must_use]
    pub fn normalize(&self, raw: &str) -> String {
        let mut out = raw.trim().to_lowercase();
        for sub in &self.substitutions {
            out = sub.pattern.replace_all(&out, sub.replacement).into_owned();
        }
        out
    }

    /// Short stable digest of a signature, suitable for display and for
    /// cross-referencing incidents in external systems.
    #[must_use]
    pub fn digest(&self, signature: &str) -> String {
        let hash = Sha256::digest(signature.as_bytes());
        hex::encode(hash)[..DIGEST_LEN].to_string()
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_shape() {
        let fp = Fingerprinter::new();
        assert_eq!(
            fp.fingerprint("Payment.Failed", Some("timeout"), "w1"),
            "payment.failed:timeout:w1"
        );
    }

    #[test]
    fn missing_error_code_maps_to_unknown() {
        let fp = Fingerprinter::new();
        assert_eq!(
            fp.fingerprint("payment.failed", None, "w1"),
            "payment.failed:unknown:w1"
        );
        assert_eq!(
            fp.fingerprint("payment.failed", Some("   "), "w1"),
            "payment.failed:unknown:w1"
        );
    }

    #[test]
    fn normalize_strips_digit_runs() {
        let fp = Fingerprinter::new();
        assert_eq!(fp.normalize("Timeout after 3000 ms"), "timeout after N ms");
        // runs shorter than 3 digits are kept
        assert_eq!(fp.normalize("http 5xx at try 2"), "http 5xx at try 2");
    }

    #[test]
    fn normalize_strips_uuids_and_hex() {
        let fp = Fingerprinter::new();
        assert_eq!(
            fp.normalize("order 9f1c2d3e-0a1b-4c5d-8e9f-012345678901 lost"),
            "order U lost"
        );
        assert_eq!(fp.normalize("trace deadbeefcafe failed"), "trace H failed");
    }

    #[test]
    fn short_hex_is_not_substituted() {
        let fp = Fingerprinter::new();
        assert_eq!(fp.normalize("code dead"), "code dead");
    }

    #[test]
    fn fingerprint_is_pure() {
        let fp = Fingerprinter::new();
        let a = fp.fingerprint("step.failed", Some("db error id 123456"), "w2");
        let b = fp.fingerprint("step.failed", Some("db error id 123456"), "w2");
        assert_eq!(a, b);
        // volatile ids collapse to the same signature
        let c = fp.fingerprint("step.failed", Some("db error id 999999"), "w2");
        assert_eq!(a, c);
    }

    #[test]
    fn digest_is_stable_and_short() {
        let fp = Fingerprinter::new();
        let sig = "payment.failed:timeout:w1";
        let d1 = fp.digest(sig);
        let d2 = fp.digest(sig);
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), DIGEST_LEN);
    }

    #[test]
    fn substitution_set_is_described() {
        let fp = Fingerprinter::new();
        assert_eq!(fp.substitution_set(), "uuid->U,hex8+->H,digits3+->N");
    }
}
