//! Configuration: the read-only policy set and the engine tuning knobs.
//!
//! Both load from JSON files under a data directory:
//!   {data_dir}/engine.json
//!   {data_dir}/policy/bucketing_rules.json
//!   {data_dir}/policy/thresholds.json
//!   {data_dir}/policy/commit_criteria.json
//!
//! The policy set is consulted per evaluation and never written by the
//! engine. `PolicyCache::replace` swaps it whole; staleness only affects
//! which policy the next trigger sees.

use crate::error::{EngineError, EngineResult};
use crate::types::{Money, RuleId, ThresholdId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

fn default_true() -> bool {
    true
}

fn read_json<T: DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let content =
        std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
    serde_json::from_str(&content).map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))
}

// ── Bucketing rules ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    PayerPayee,
    BinPcn,
    Custom,
}

/// A claim attribute a CUSTOM rule may group on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingField {
    Payer,
    Payee,
    Bin,
    Pcn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketingRule {
    pub rule_id: RuleId,
    #[serde(default)]
    pub name: String,
    pub rule_type: RuleType,
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Restricts the rule to one payer when set.
    #[serde(default)]
    pub payer_id: Option<String>,
    /// Restricts the rule to one payee when set.
    #[serde(default)]
    pub payee_id: Option<String>,
    #[serde(default)]
    pub custom_fields: Vec<GroupingField>,
}

impl BucketingRule {
    pub fn new(rule_id: &str, rule_type: RuleType, priority: i32) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            name: rule_id.to_string(),
            rule_type,
            priority,
            active: true,
            payer_id: None,
            payee_id: None,
            custom_fields: Vec::new(),
        }
    }

    pub fn linked_to(mut self, payer_id: Option<&str>, payee_id: Option<&str>) -> Self {
        self.payer_id = payer_id.map(str::to_string);
        self.payee_id = payee_id.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    rules: Vec<BucketingRule>,
}

// ── Generation thresholds ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdType {
    ClaimCount,
    Amount,
    Time,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeDuration {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationThreshold {
    pub threshold_id: ThresholdId,
    /// None makes the threshold global.
    #[serde(default)]
    pub rule_id: Option<RuleId>,
    pub threshold_type: ThresholdType,
    #[serde(default)]
    pub max_claims: Option<u64>,
    #[serde(default)]
    pub max_amount: Option<Money>,
    #[serde(default)]
    pub time_duration: Option<TimeDuration>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl GenerationThreshold {
    fn base(threshold_id: &str, threshold_type: ThresholdType) -> Self {
        Self {
            threshold_id: threshold_id.to_string(),
            rule_id: None,
            threshold_type,
            max_claims: None,
            max_amount: None,
            time_duration: None,
            active: true,
        }
    }

    pub fn claim_count(threshold_id: &str, max_claims: u64) -> Self {
        Self {
            max_claims: Some(max_claims),
            ..Self::base(threshold_id, ThresholdType::ClaimCount)
        }
    }

    pub fn amount(threshold_id: &str, max_amount: Money) -> Self {
        Self {
            max_amount: Some(max_amount),
            ..Self::base(threshold_id, ThresholdType::Amount)
        }
    }

    pub fn time(threshold_id: &str, duration: TimeDuration) -> Self {
        Self {
            time_duration: Some(duration),
            ..Self::base(threshold_id, ThresholdType::Time)
        }
    }

    pub fn hybrid(
        threshold_id: &str,
        max_claims: Option<u64>,
        max_amount: Option<Money>,
        time_duration: Option<TimeDuration>,
    ) -> Self {
        Self {
            max_claims,
            max_amount,
            time_duration,
            ..Self::base(threshold_id, ThresholdType::Hybrid)
        }
    }

    pub fn for_rule(mut self, rule_id: &str) -> Self {
        self.rule_id = Some(rule_id.to_string());
        self
    }

    fn validate(&self) -> Result<(), String> {
        let id = &self.threshold_id;
        match self.threshold_type {
            ThresholdType::ClaimCount if !matches!(self.max_claims, Some(n) if n > 0) => {
                Err(format!("threshold {id}: CLAIM_COUNT needs max_claims > 0"))
            }
            ThresholdType::Amount if !matches!(self.max_amount, Some(a) if a > Money::ZERO) => {
                Err(format!("threshold {id}: AMOUNT needs max_amount > 0"))
            }
            ThresholdType::Time if self.time_duration.is_none() => {
                Err(format!("threshold {id}: TIME needs time_duration"))
            }
            ThresholdType::Hybrid
                if self.max_claims.is_none()
                    && self.max_amount.is_none()
                    && self.time_duration.is_none() =>
            {
                Err(format!(
                    "threshold {id}: HYBRID needs at least one of max_claims, max_amount, time_duration"
                ))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ThresholdsFile {
    thresholds: Vec<GenerationThreshold>,
}

// ── Commit criteria ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitMode {
    Auto,
    Manual,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitCriteria {
    pub criteria_id: String,
    #[serde(default)]
    pub rule_id: Option<RuleId>,
    pub mode: CommitMode,
    /// HYBRID: buckets at or above this amount need approval.
    #[serde(default)]
    pub auto_commit_threshold: Option<Money>,
    /// HYBRID: buckets at or above this many claims need approval.
    #[serde(default)]
    pub manual_approval_threshold: Option<u64>,
    /// Any one of these roles may approve. Empty means anyone.
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl CommitCriteria {
    pub fn new(criteria_id: &str, mode: CommitMode) -> Self {
        Self {
            criteria_id: criteria_id.to_string(),
            rule_id: None,
            mode,
            auto_commit_threshold: None,
            manual_approval_threshold: None,
            required_roles: Vec::new(),
            active: true,
        }
    }

    pub fn hybrid(criteria_id: &str, auto_commit_threshold: Money, manual_approval_threshold: u64) -> Self {
        Self {
            auto_commit_threshold: Some(auto_commit_threshold),
            manual_approval_threshold: Some(manual_approval_threshold),
            ..Self::new(criteria_id, CommitMode::Hybrid)
        }
    }

    pub fn for_rule(mut self, rule_id: &str) -> Self {
        self.rule_id = Some(rule_id.to_string());
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.required_roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CriteriaFile {
    criteria: Vec<CommitCriteria>,
}

// ── Policy set ─────────────────────────────────────────────────────

/// Everything the engine consults to bucket, trigger, and gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    pub rules: Vec<BucketingRule>,
    pub thresholds: Vec<GenerationThreshold>,
    pub criteria: Vec<CommitCriteria>,
}

impl PolicySet {
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        let rules: RulesFile = read_json(&format!("{data_dir}/policy/bucketing_rules.json"))?;
        let thresholds: ThresholdsFile = read_json(&format!("{data_dir}/policy/thresholds.json"))?;
        let criteria: CriteriaFile = read_json(&format!("{data_dir}/policy/commit_criteria.json"))?;
        let policy = Self {
            rules: rules.rules,
            thresholds: thresholds.thresholds,
            criteria: criteria.criteria,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_rule(mut self, rule: BucketingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_threshold(mut self, threshold: GenerationThreshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn with_criteria(mut self, criteria: CommitCriteria) -> Self {
        self.criteria.push(criteria);
        self
    }

    /// Rejects policy sets the evaluators could not apply unambiguously.
    pub fn validate(&self) -> EngineResult<()> {
        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(rule.rule_id.as_str()) {
                return Err(EngineError::Config(format!("duplicate rule id {}", rule.rule_id)));
            }
            if rule.rule_type == RuleType::Custom && rule.custom_fields.is_empty() {
                return Err(EngineError::Config(format!(
                    "rule {}: CUSTOM needs custom_fields",
                    rule.rule_id
                )));
            }
        }

        let known_rule = |rule_id: &Option<RuleId>, owner: &str| match rule_id {
            Some(id) if !rule_ids.contains(id.as_str()) => {
                Err(EngineError::Config(format!("{owner}: unknown rule {id}")))
            }
            _ => Ok(()),
        };

        let mut threshold_ids = HashSet::new();
        for threshold in &self.thresholds {
            if !threshold_ids.insert(threshold.threshold_id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate threshold id {}",
                    threshold.threshold_id
                )));
            }
            threshold.validate().map_err(EngineError::Config)?;
            known_rule(&threshold.rule_id, &format!("threshold {}", threshold.threshold_id))?;
        }

        let mut criteria_scopes = HashSet::new();
        for criteria in &self.criteria {
            known_rule(&criteria.rule_id, &format!("criteria {}", criteria.criteria_id))?;
            if criteria.mode == CommitMode::Hybrid
                && criteria.auto_commit_threshold.is_none()
                && criteria.manual_approval_threshold.is_none()
            {
                return Err(EngineError::Config(format!(
                    "criteria {}: HYBRID needs auto_commit_threshold or manual_approval_threshold",
                    criteria.criteria_id
                )));
            }
            if criteria.active && !criteria_scopes.insert(criteria.rule_id.clone()) {
                return Err(EngineError::Config(format!(
                    "criteria {}: more than one active criteria for the same scope",
                    criteria.criteria_id
                )));
            }
        }
        Ok(())
    }

    /// Active thresholds linked to the rule, or the active global ones when
    /// the rule has none. Declared order is evaluation order.
    pub fn thresholds_for_rule(&self, rule_id: &str) -> Vec<&GenerationThreshold> {
        let linked: Vec<_> = self
            .thresholds
            .iter()
            .filter(|t| t.active && t.rule_id.as_deref() == Some(rule_id))
            .collect();
        if !linked.is_empty() {
            return linked;
        }
        self.thresholds
            .iter()
            .filter(|t| t.active && t.rule_id.is_none())
            .collect()
    }

    /// The active criteria linked to the rule, else the active global one.
    pub fn criteria_for_rule(&self, rule_id: &str) -> Option<&CommitCriteria> {
        self.criteria
            .iter()
            .find(|c| c.active && c.rule_id.as_deref() == Some(rule_id))
            .or_else(|| self.criteria.iter().find(|c| c.active && c.rule_id.is_none()))
    }
}

/// Shared handle to the current policy set.
#[derive(Debug, Clone)]
pub struct PolicyCache {
    inner: Arc<RwLock<Arc<PolicySet>>>,
}

impl PolicyCache {
    pub fn new(policy: PolicySet) -> EngineResult<Self> {
        policy.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        })
    }

    pub fn current(&self) -> Arc<PolicySet> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and swap in a new policy set. Readers holding the previous
    /// snapshot finish their evaluation against it.
    pub fn replace(&self, policy: PolicySet) -> EngineResult<()> {
        policy.validate()?;
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
        log::info!("policy: replaced policy set");
        Ok(())
    }
}

// ── Engine config ──────────────────────────────────────────────────

/// What a rejected PENDING_APPROVAL bucket becomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// Keep its claims and keep collecting.
    #[default]
    ReturnToAccumulating,
    /// Terminal FAILED; an operator reset brings it back.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sweep_interval_secs: u64,
    /// How long a bucket may sit in GENERATING without a file record before
    /// the sweep runs its generation again.
    pub generation_grace_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            generation_grace_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delay before the first retry; doubles for each later retry.
    pub base_delay_ms: u64,
    /// Retries allowed after the initial upload before the file is FAILED.
    #[serde(alias = "max_attempts")]
    pub max_retries: u32,
    /// Attempt delivery straight after a file is generated.
    pub deliver_on_generation: bool,
    /// Cadence of the delivery sweep in the monitor thread.
    pub sweep_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_retries: 3,
            deliver_on_generation: true,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub reject_policy: RejectPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a unit of work waits for the SQLite write lock.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub monitor: MonitorConfig,
    pub delivery: DeliveryConfig,
    pub approval: ApprovalConfig,
    pub store: StoreConfig,
}

impl EngineConfig {
    pub fn load(data_dir: &str) -> anyhow::Result<Self> {
        read_json(&format!("{data_dir}/engine.json"))
    }

    /// Config with hardcoded defaults for use in tests: no delivery on
    /// generation, so tests drive delivery explicitly.
    pub fn default_test() -> Self {
        Self {
            delivery: DeliveryConfig {
                deliver_on_generation: false,
                ..DeliveryConfig::default()
            },
            ..Self::default()
        }
    }
}
