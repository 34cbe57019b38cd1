//! # faultline-core
//!
//! Core domain library for faultline, a multi-tenant workflow failure
//! detection and remediation system.
//!
//! This crate contains the pure, storage-free parts of the system:
//!
//! - **Entities and lifecycles**: events, incidents, decisions, actions,
//!   with validated state transitions
//! - **Fingerprinting**: canonical failure signatures for incident grouping
//! - **Safety fabric math**: circuit breaker state machine, sliding-window
//!   admission, retry backoff, retry budgets (the distributed state itself
//!   lives in `faultline-daemon`)
//! - **Rules**: the read-only error-code table driving severity and retry
//!   policy selection
//! - **Configuration**: TOML-loaded settings for rules, policies, vendors,
//!   and global limits
//! - **Injected effects**: `Clock` and `Jitter` traits so every time- and
//!   randomness-dependent computation can be pinned in tests
//!
//! Nothing in this crate performs I/O. All state mutation happens through
//! explicit snapshots passed in and out, so every transition is unit-testable
//! without a runtime.
//!
//! ## Example
//!
//! ```rust
//! use faultline_core::fingerprint::Fingerprinter;
//!
//! let fp = Fingerprinter::new();
//! let sig = fp.fingerprint("payment.failed", Some("Timeout after 3000 ms"), "wf-1");
//! assert_eq!(sig, "payment.failed:timeout after N ms:wf-1");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod breaker;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod decision;
pub mod event;
pub mod fingerprint;
pub mod incident;
pub mod ratelimit;
pub mod reject;
pub mod retry;
pub mod rules;
pub mod types;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action::{Action, ActionKind, ActionStatus};
    pub use crate::breaker::{Admission, BreakerConfig, BreakerSnapshot, BreakerState};
    pub use crate::classifier::{Classification, Classifier, Recommendation};
    pub use crate::clock::{Clock, Jitter, SystemClock};
    pub use crate::config::FaultlineConfig;
    pub use crate::decision::{Decision, DecisionKind};
    pub use crate::event::{EventSubmission, StoredEvent};
    pub use crate::fingerprint::Fingerprinter;
    pub use crate::incident::{Incident, IncidentStatus};
    pub use crate::types::{CorrelationId, Severity};
}

pub use config::FaultlineConfig;
pub use fingerprint::Fingerprinter;
pub use types::{CorrelationId, Severity};
