//! Bucketing resolver: picks the one rule that owns a claim and derives
//! the grouping key the claim is bucketed under.
//!
//! Candidates are the active rules whose payer/payee linkage matches and
//! whose rule type can build a key from the claim (BIN_PCN needs both
//! numbers, CUSTOM needs every listed field). Highest priority wins; equal
//! priorities fall back to rule id ascending.

use crate::claim::Claim;
use crate::config::{BucketingRule, GroupingField, PolicySet, RuleType};

/// The rule a claim resolved to and the key it groups under.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'p> {
    pub rule: &'p BucketingRule,
    pub grouping_key: String,
}

pub fn resolve<'p>(policy: &'p PolicySet, claim: &Claim) -> Option<Resolution<'p>> {
    let mut candidates: Vec<(&BucketingRule, String)> = policy
        .rules
        .iter()
        .filter(|rule| rule.active && linkage_matches(rule, claim))
        .filter_map(|rule| grouping_key(rule, claim).map(|key| (rule, key)))
        .collect();

    candidates.sort_by(|(a, _), (b, _)| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });

    candidates
        .into_iter()
        .next()
        .map(|(rule, grouping_key)| Resolution { rule, grouping_key })
}

fn linkage_matches(rule: &BucketingRule, claim: &Claim) -> bool {
    let payer_ok = rule.payer_id.as_deref().map_or(true, |p| p == claim.payer_id);
    let payee_ok = rule.payee_id.as_deref().map_or(true, |p| p == claim.payee_id);
    payer_ok && payee_ok
}

fn field_value<'c>(claim: &'c Claim, field: GroupingField) -> Option<&'c str> {
    match field {
        GroupingField::Payer => Some(claim.payer_id.as_str()),
        GroupingField::Payee => Some(claim.payee_id.as_str()),
        GroupingField::Bin => claim.bin_number.as_deref(),
        GroupingField::Pcn => claim.pcn_number.as_deref(),
    }
}

fn field_name(field: GroupingField) -> &'static str {
    match field {
        GroupingField::Payer => "payer",
        GroupingField::Payee => "payee",
        GroupingField::Bin => "bin",
        GroupingField::Pcn => "pcn",
    }
}

/// The key string for `claim` under `rule`, or None when the claim lacks a
/// field the rule groups on.
pub fn grouping_key(rule: &BucketingRule, claim: &Claim) -> Option<String> {
    match rule.rule_type {
        RuleType::PayerPayee => Some(format!("{}|{}", claim.payer_id, claim.payee_id)),
        RuleType::BinPcn => {
            let bin = claim.bin_number.as_deref()?;
            let pcn = claim.pcn_number.as_deref()?;
            Some(format!("{bin}|{pcn}"))
        }
        RuleType::Custom => {
            if rule.custom_fields.is_empty() {
                return None;
            }
            let parts = rule
                .custom_fields
                .iter()
                .map(|&field| field_value(claim, field).map(|v| format!("{}={v}", field_name(field))))
                .collect::<Option<Vec<_>>>()?;
            Some(parts.join("|"))
        }
    }
}
