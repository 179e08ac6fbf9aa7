//! Shared fixtures for the integration tests: a wired engine on a manual
//! clock, plus scriptable stand-ins for every collaborator.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use remit_core::{
    claim::ClaimEvent,
    clock::ManualClock,
    collaborators::{
        AssignmentError, ComposeError, ComposedFile, DeliveryRequest, DeliveryTransport,
        FileComposer, InstrumentAllocator, PartyRegistry, StaticPartyDirectory, TransportError,
    },
    config::{BucketingRule, CommitCriteria, EngineConfig, GenerationThreshold, PolicySet, RuleType},
    engine::{BucketEngine, EngineBuilder},
    model::{Bucket, ClaimLogEntry},
    store::Store,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const PAYER: &str = "PAYER-1";
pub const PAYEE: &str = "PAYEE-1";
pub const RULE: &str = "payer-payee";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn claim(claim_id: &str, amount: &str) -> ClaimEvent {
    ClaimEvent::new(claim_id, PAYER, PAYEE, amount)
}

/// One PAYER_PAYEE rule with the given threshold and criteria attached.
pub fn policy(threshold: GenerationThreshold, criteria: CommitCriteria) -> PolicySet {
    PolicySet::default()
        .with_rule(BucketingRule::new(RULE, RuleType::PayerPayee, 10))
        .with_threshold(threshold.for_rule(RULE))
        .with_criteria(criteria)
}

pub fn temp_db_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("remit-{tag}-{}.db", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

// ── Collaborator doubles ───────────────────────────────────────────

/// Renders one line per claim and remembers every call.
#[derive(Default)]
pub struct RecordingComposer {
    calls: Mutex<Vec<(String, usize)>>,
    fail: AtomicBool,
    lock_on_compose: Mutex<Option<String>>,
    writer: Mutex<Option<rusqlite::Connection>>,
}

impl RecordingComposer {
    pub fn fail_from_now_on(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// On the next compose, a second connection to `db_path` takes the
    /// write lock and keeps it until `release_write_lock`.
    pub fn hold_write_lock_once(&self, db_path: &str) {
        *self.lock_on_compose.lock().unwrap() = Some(db_path.to_string());
    }

    pub fn release_write_lock(&self) {
        self.writer.lock().unwrap().take();
    }

    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

impl FileComposer for RecordingComposer {
    fn compose(&self, bucket: &Bucket, claims: &[ClaimLogEntry]) -> Result<ComposedFile, ComposeError> {
        self.calls
            .lock()
            .unwrap()
            .push((bucket.bucket_id.clone(), claims.len()));
        if let Some(path) = self.lock_on_compose.lock().unwrap().take() {
            let conn = rusqlite::Connection::open(path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            *self.writer.lock().unwrap() = Some(conn);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ComposeError("template missing for payee".into()));
        }
        let content = claims
            .iter()
            .map(|c| format!("{},{}", c.claim_id, c.amount.map(|a| a.to_string()).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ComposedFile {
            file_name: format!("{}.835", bucket.bucket_id),
            destination: format!("outbox/{}", bucket.payee_id),
            content: content.into_bytes(),
        })
    }
}

/// Plays back queued results, then succeeds.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    uploads: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn fail_next(&self, times: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..times {
            script.push_back(Err(TransportError::Connection("connection reset by peer".into())));
        }
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

impl DeliveryTransport for ScriptedTransport {
    fn upload(&self, request: &DeliveryRequest<'_>) -> Result<(), TransportError> {
        self.uploads.lock().unwrap().push(request.file_name.to_string());
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// A finite pool of payment instruments.
pub struct InstrumentPool {
    available: Mutex<Vec<String>>,
    broken: bool,
    released: Mutex<Vec<String>>,
}

impl InstrumentPool {
    pub fn with(instruments: &[&str]) -> Self {
        Self {
            available: Mutex::new(instruments.iter().map(|s| s.to_string()).collect()),
            broken: false,
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::with(&[])
        }
    }

    pub fn remaining(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

impl InstrumentAllocator for InstrumentPool {
    fn requires_instrument(&self, _bucket: &Bucket) -> bool {
        true
    }

    fn assign(&self, _bucket: &Bucket) -> Result<String, AssignmentError> {
        if self.broken {
            return Err(AssignmentError::Failed("card issuer unreachable".into()));
        }
        self.available.lock().unwrap().pop().ok_or(AssignmentError::NoneAvailable)
    }

    fn release(&self, _bucket: &Bucket, instrument_id: &str) {
        self.released.lock().unwrap().push(instrument_id.to_string());
        self.available.lock().unwrap().push(instrument_id.to_string());
    }
}

// ── Harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub engine: BucketEngine,
    pub clock: Arc<ManualClock>,
    pub composer: Arc<RecordingComposer>,
    pub transport: Arc<ScriptedTransport>,
    pub directory: Arc<StaticPartyDirectory>,
}

pub struct HarnessOptions {
    pub config: EngineConfig,
    pub allocator: Option<Arc<dyn InstrumentAllocator>>,
    pub db_path: Option<String>,
    pub configured_parties: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            config: EngineConfig::default_test(),
            allocator: None,
            db_path: None,
            configured_parties: true,
        }
    }
}

impl Harness {
    pub fn new(policy: PolicySet) -> Self {
        Self::with(policy, HarnessOptions::default())
    }

    pub fn with(policy: PolicySet, options: HarnessOptions) -> Self {
        init_logging();
        let store = match &options.db_path {
            Some(path) => Store::open_with(path, &options.config.store).expect("file store"),
            None => Store::in_memory().expect("in-memory store"),
        };
        let registry = if options.configured_parties {
            PartyRegistry {
                payers: vec![PAYER.into(), "PAYER-2".into()],
                payees: vec![PAYEE.into(), "PAYEE-2".into()],
            }
        } else {
            PartyRegistry::default()
        };

        let clock = Arc::new(ManualClock::new(t0()));
        let composer = Arc::new(RecordingComposer::default());
        let transport = Arc::new(ScriptedTransport::default());
        let directory = Arc::new(StaticPartyDirectory::new(registry));

        let mut builder = EngineBuilder::new(store, policy)
            .config(options.config)
            .clock(clock.clone())
            .composer(composer.clone())
            .transport(transport.clone())
            .directory(directory.clone());
        if let Some(allocator) = options.allocator {
            builder = builder.allocator(allocator);
        }
        let engine = builder.build().expect("engine builds");

        Self {
            engine,
            clock,
            composer,
            transport,
            directory,
        }
    }

    /// Apply claims `{prefix}-1 ..= {prefix}-n`, each for `amount`.
    pub fn apply_n(&self, prefix: &str, n: usize, amount: &str) {
        for i in 1..=n {
            self.engine
                .apply_claim(&claim(&format!("{prefix}-{i}"), amount))
                .expect("claim applies");
        }
    }

    pub fn only_bucket(&self) -> Bucket {
        let count = self.engine.store().bucket_count(None).expect("count");
        assert_eq!(count, 1, "expected exactly one bucket");
        let key = format!("{PAYER}|{PAYEE}");
        let mut all = self.engine.store().buckets_for_key(RULE, &key).expect("buckets");
        all.pop().expect("one bucket")
    }
}
