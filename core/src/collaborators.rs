//! Collaborator seams: everything the engine consumes but does not own.
//!
//! RULE: the engine reaches the outside world only through these traits.
//! Implementations are injected once at startup (see `EngineBuilder`) and
//! shared across worker threads, so every trait is `Send + Sync`.

use crate::model::{Bucket, ClaimLogEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

// ── File composer ──────────────────────────────────────────────────

/// A rendered remittance file, ready to be recorded and delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedFile {
    pub file_name: String,
    pub destination: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("file composition failed: {0}")]
pub struct ComposeError(pub String);

/// Renders a bucket's claims into the remittance wire format.
pub trait FileComposer: Send + Sync {
    /// Called exactly once per GENERATING transition.
    fn compose(&self, bucket: &Bucket, claims: &[ClaimLogEntry]) -> Result<ComposedFile, ComposeError>;
}

// ── Delivery transport ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryRequest<'a> {
    pub file_name: &'a str,
    pub destination: &'a str,
    pub content: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("upload timed out after {0} ms")]
    Timeout(u64),
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Physically moves a generated file to its destination. Owns its own
/// connection and operation timeouts; a timeout is just another failure.
pub trait DeliveryTransport: Send + Sync {
    fn upload(&self, request: &DeliveryRequest<'_>) -> Result<(), TransportError>;
}

// ── Payer / payee configuration ────────────────────────────────────

/// Answers whether a payer/payee pair has what generation needs
/// (sender identifiers and the like).
pub trait PartyDirectory: Send + Sync {
    fn is_configured(&self, payer_id: &str, payee_id: &str) -> bool;
}

/// Parties file as stored under the data directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRegistry {
    #[serde(default)]
    pub payers: Vec<String>,
    #[serde(default)]
    pub payees: Vec<String>,
}

impl PartyRegistry {
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let path = format!("{data_dir}/parties.json");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// In-memory directory of configured payers and payees. Updatable at
/// runtime so operators can supply missing configuration.
#[derive(Debug, Default)]
pub struct StaticPartyDirectory {
    payers: RwLock<HashSet<String>>,
    payees: RwLock<HashSet<String>>,
}

impl StaticPartyDirectory {
    pub fn new(registry: PartyRegistry) -> Self {
        Self {
            payers: RwLock::new(registry.payers.into_iter().collect()),
            payees: RwLock::new(registry.payees.into_iter().collect()),
        }
    }

    pub fn configure_payer(&self, payer_id: &str) {
        self.payers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payer_id.to_string());
    }

    pub fn configure_payee(&self, payee_id: &str) {
        self.payees
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(payee_id.to_string());
    }
}

impl PartyDirectory for StaticPartyDirectory {
    fn is_configured(&self, payer_id: &str, payee_id: &str) -> bool {
        let payers = self.payers.read().unwrap_or_else(PoisonError::into_inner);
        let payees = self.payees.read().unwrap_or_else(PoisonError::into_inner);
        payers.contains(payer_id) && payees.contains(payee_id)
    }
}

/// Treats every party as configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPartiesConfigured;

impl PartyDirectory for AllPartiesConfigured {
    fn is_configured(&self, _payer_id: &str, _payee_id: &str) -> bool {
        true
    }
}

// ── Payment instruments ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignmentError {
    /// The pool is empty; waiting for restock is the right reaction.
    #[error("no payment instrument available")]
    NoneAvailable,
    #[error("{0}")]
    Failed(String),
}

/// Resolves the payment instrument a bucket is paid with before it may
/// be generated.
///
/// `assign` runs inside the approval unit of work. If the approval is
/// rolled back afterwards the engine calls `release` with what it got.
pub trait InstrumentAllocator: Send + Sync {
    fn requires_instrument(&self, bucket: &Bucket) -> bool;
    fn assign(&self, bucket: &Bucket) -> Result<String, AssignmentError>;
    fn release(&self, _bucket: &Bucket, _instrument_id: &str) {}
}

/// No bucket needs an instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInstrumentRequired;

impl InstrumentAllocator for NoInstrumentRequired {
    fn requires_instrument(&self, _bucket: &Bucket) -> bool {
        false
    }

    fn assign(&self, _bucket: &Bucket) -> Result<String, AssignmentError> {
        Err(AssignmentError::Failed("no allocator configured".into()))
    }
}
