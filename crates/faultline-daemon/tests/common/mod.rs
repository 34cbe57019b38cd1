//! Shared test harness: a fully wired daemon over an in-memory store,
//! a pinned clock, pinned jitter, and a scriptable executor, so every
//! scenario is deterministic and driven by hand.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use faultline_core::classifier::BoxFuture;
use faultline_core::clock::{Clock, FixedJitter, ManualClock};
use faultline_core::config::{
    ErrorCodeConfig, FaultlineConfig, RetryPolicyConfig, VendorBreakerConfig, VendorConfig,
    VendorRateLimitConfig,
};
use faultline_core::event::EventSubmission;
use faultline_core::fingerprint::Fingerprinter;
use faultline_core::incident::Incident;
use faultline_core::types::{CorrelationId, Severity, Tenant, Vendor, Workflow};
use faultline_daemon::cache::InMemoryCache;
use faultline_daemon::classifier::RuleClassifier;
use faultline_daemon::coordinator::ActionCoordinator;
use faultline_daemon::detector::IncidentDetector;
use faultline_daemon::metrics::MetricsRegistry;
use faultline_daemon::pipeline::{IngestError, IngestReceipt, IngestionPipeline};
use faultline_daemon::recorder::DecisionRecorder;
use faultline_daemon::safety::{BreakerManager, RateLimiter, RetryBudget};
use faultline_daemon::scheduler::{ActionExecutor, ActionScheduler, ExecutorError};
use faultline_daemon::store::Store;
use serde_json::{Value, json};
use tokio::sync::Notify;

/// The pinned start of test time.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

/// Test configuration: tight, deterministic limits.
///
/// - workflow retry budget: 2
/// - vendor `stripe`: breaker threshold 3, cooldown 60s, probe cap 1
/// - error code `timeout`: medium severity, `steady` policy (10s initial,
///   doubling, jitter pinned to 0 by the harness)
pub fn test_config() -> FaultlineConfig {
    let mut config = FaultlineConfig::default();
    config.safety.max_retries_per_workflow = 2;
    config.safety.max_retries_per_vendor_per_hour = 100;
    config.pipeline.tenant_rate_limit_per_minute = 1000;

    config.retry_policies.insert(
        "steady".to_string(),
        RetryPolicyConfig {
            retryable: true,
            max_retries: 5,
            initial_delay_secs: 10.0,
            max_delay_secs: 300.0,
            multiplier: 2.0,
            jitter: 0.2,
        },
    );
    config.error_codes.insert(
        "timeout".to_string(),
        ErrorCodeConfig {
            severity: Severity::Medium,
            retry_policy: "steady".to_string(),
            retryable: true,
        },
    );
    config.error_codes.insert(
        "invalid_credentials".to_string(),
        ErrorCodeConfig {
            severity: Severity::High,
            retry_policy: "steady".to_string(),
            retryable: false,
        },
    );
    config.vendors.insert(
        "stripe".to_string(),
        VendorConfig {
            breaker: VendorBreakerConfig {
                failure_threshold: 3,
                cooldown_secs: 60,
                probe_cap: 1,
                failure_window_secs: 300,
            },
            rate_limit: VendorRateLimitConfig { per_minute: 1000 },
        },
    );
    config
}

/// Executor with a scripted outcome queue; drained front-first, and an
/// empty queue acknowledges success.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<Value, String>>>,
}

impl ScriptedExecutor {
    pub fn push_success(&self, result: Value) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Ok(result));
    }

    pub fn push_failure(&self, message: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }
}

impl ActionExecutor for ScriptedExecutor {
    fn execute<'a>(
        &'a self,
        _action: &'a faultline_core::action::Action,
        _incident: &'a Incident,
    ) -> BoxFuture<'a, Result<Value, ExecutorError>> {
        Box::pin(async move {
            match self.outcomes.lock().unwrap().pop_front() {
                Some(Ok(result)) => Ok(result),
                Some(Err(message)) => Err(ExecutorError::Dispatch { message }),
                None => Ok(json!({"acknowledged": true})),
            }
        })
    }
}

/// A fully wired daemon for tests.
pub struct Harness {
    pub store: Store,
    pub cache: Arc<InMemoryCache>,
    pub clock: Arc<ManualClock>,
    pub config: Arc<FaultlineConfig>,
    pub pipeline: IngestionPipeline,
    pub detector: IncidentDetector,
    pub scheduler: ActionScheduler,
    pub coordinator: Arc<ActionCoordinator>,
    pub executor: Arc<ScriptedExecutor>,
    pub wakeup: Arc<Notify>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: FaultlineConfig) -> Self {
        let config = Arc::new(config);
        let store = Store::open_in_memory().unwrap();
        let cache = Arc::new(InMemoryCache::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let jitter = Arc::new(FixedJitter(0.0));
        let rules = Arc::new(config.rules_table());
        let metrics = MetricsRegistry::new().unwrap().metrics();
        let wakeup = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let breaker = Arc::new(BreakerManager::new(
            cache.clone(),
            store.admin(),
            Arc::clone(&config),
            clock_dyn.clone(),
        ));
        let ratelimit = Arc::new(RateLimiter::new(
            cache.clone(),
            Arc::clone(&config),
            clock_dyn.clone(),
        ));
        let budget = Arc::new(RetryBudget::new(
            cache.clone(),
            Arc::clone(&config),
            clock_dyn.clone(),
        ));
        let recorder = Arc::new(DecisionRecorder::new(store.decisions(), clock_dyn.clone()));
        let coordinator = Arc::new(ActionCoordinator::new(
            store.actions(),
            store.incidents(),
            Arc::clone(&recorder),
            budget,
            Arc::clone(&rules),
            Arc::clone(&config),
            clock_dyn.clone(),
            jitter.clone(),
        ));

        let pipeline = IngestionPipeline::new(
            store.events(),
            store.admin(),
            RateLimiter::new(cache.clone(), Arc::clone(&config), clock_dyn.clone()),
            Arc::clone(&breaker),
            clock_dyn.clone(),
            Arc::clone(&wakeup),
            metrics.clone(),
        );

        let detector = IncidentDetector::new(
            store.clone(),
            Arc::clone(&recorder),
            Arc::clone(&coordinator),
            Arc::new(RuleClassifier::new(Arc::clone(&rules))),
            Arc::new(Fingerprinter::new()),
            rules,
            Arc::clone(&config),
            clock_dyn.clone(),
            jitter.clone(),
            Arc::clone(&wakeup),
            Arc::clone(&shutdown),
            metrics.clone(),
        );

        let executor = Arc::new(ScriptedExecutor::default());
        let scheduler = ActionScheduler::new(
            store.actions(),
            store.incidents(),
            Arc::clone(&coordinator),
            executor.clone(),
            breaker,
            ratelimit,
            Arc::clone(&config),
            clock_dyn,
            jitter,
            shutdown,
            metrics,
        );

        let harness = Self {
            store,
            cache,
            clock,
            config,
            pipeline,
            detector,
            scheduler,
            coordinator,
            executor,
            wakeup,
        };
        harness.seed_defaults();
        harness
    }

    /// Seeds tenant `t1`, workflow `w1`, and vendor `stripe`.
    pub fn seed_defaults(&self) {
        let admin = self.store.admin();
        admin
            .upsert_tenant(&Tenant {
                id: "t1".to_string(),
                name: "Acme".to_string(),
                active: true,
            })
            .unwrap();
        admin
            .upsert_workflow(&Workflow {
                id: "w1".to_string(),
                tenant_id: "t1".to_string(),
                name: "payments".to_string(),
                active: true,
            })
            .unwrap();
        admin
            .upsert_vendor(&Vendor {
                id: "v-stripe".to_string(),
                name: "stripe".to_string(),
                rate_limit_per_minute: 1000,
            })
            .unwrap();
    }

    /// A failure submission on `(t1, w1)` with the given key.
    pub fn failure_submission(&self, key: &str) -> EventSubmission {
        EventSubmission {
            tenant_id: "t1".to_string(),
            workflow_id: "w1".to_string(),
            event_type: "payment.failed".to_string(),
            payload: json!({"error_code": "timeout"}),
            idempotency_key: key.to_string(),
            occurred_at: self.clock.now(),
            schema_version: "1.0.0".to_string(),
        }
    }

    /// A failure submission naming the `stripe` vendor.
    pub fn vendor_failure_submission(&self, key: &str) -> EventSubmission {
        EventSubmission {
            payload: json!({"error_code": "timeout", "vendor": "stripe"}),
            ..self.failure_submission(key)
        }
    }

    /// A success-shaped submission naming the `stripe` vendor.
    pub fn vendor_success_submission(&self, key: &str) -> EventSubmission {
        EventSubmission {
            event_type: "payment.completed".to_string(),
            payload: json!({"vendor": "stripe", "status": "ok"}),
            ..self.failure_submission(key)
        }
    }

    /// Ingests with a fresh correlation id and a 5s deadline.
    pub async fn ingest(
        &self,
        submission: &EventSubmission,
    ) -> Result<IngestReceipt, IngestError> {
        self.pipeline
            .ingest(
                submission,
                CorrelationId::generate(),
                self.clock.now() + chrono::Duration::seconds(5),
            )
            .await
    }

    /// Drains detection until no events remain. Returns total processed.
    pub async fn detect(&self) -> usize {
        let mut total = 0;
        loop {
            let processed = self.detector.drain_once().await.unwrap();
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }

    /// Runs one scheduler tick.
    pub async fn tick(&self) -> usize {
        self.scheduler.tick_once().await.unwrap()
    }

    /// The single open incident for the default `(t1, w1)` timeout
    /// signature.
    pub fn open_timeout_incident(&self) -> Option<Incident> {
        self.store
            .incidents()
            .find_open("t1", "w1", "payment.failed:timeout:w1")
            .unwrap()
    }
}
