//! Claim change events and their structural validation.
//!
//! The engine never looks inside a claim beyond what bucketing needs:
//! the parties, the optional BIN/PCN, and the charge amount.

use crate::types::{AmountRepr, ClaimId, Money};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// One claim insert/update as delivered by the change-event source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimEvent {
    #[serde(default)]
    pub claim_id: String,
    #[serde(default)]
    pub payer_id: Option<String>,
    #[serde(default)]
    pub payee_id: Option<String>,
    #[serde(default, deserialize_with = "amount_text")]
    pub total_charge_amount: Option<String>,
    #[serde(default, deserialize_with = "amount_text")]
    pub paid_amount: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub bin_number: Option<String>,
    #[serde(default)]
    pub pcn_number: Option<String>,
}

fn amount_text<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<AmountRepr>::deserialize(de)?.map(AmountRepr::into_text))
}

/// A claim that passed structural checks and may be bucketed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Claim {
    pub claim_id: ClaimId,
    pub payer_id: String,
    pub payee_id: String,
    pub charge_amount: Money,
    pub paid_amount: Option<Money>,
    pub status: Option<String>,
    pub bin_number: Option<String>,
    pub pcn_number: Option<String>,
}

/// Why a claim was never bucketed. The display text is the logged reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimRejection {
    #[error("missing claim id")]
    MissingClaimId,
    #[error("missing payer id")]
    MissingPayer,
    #[error("missing payee id")]
    MissingPayee,
    #[error("missing total charge amount")]
    MissingAmount,
    #[error("unparseable amount: {0}")]
    UnparseableAmount(String),
    #[error("negative amount: {0}")]
    NegativeAmount(Money),
    #[error("no matching rule")]
    NoMatchingRule,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl ClaimEvent {
    pub fn new(claim_id: &str, payer_id: &str, payee_id: &str, amount: &str) -> Self {
        Self {
            claim_id: claim_id.to_string(),
            payer_id: Some(payer_id.to_string()),
            payee_id: Some(payee_id.to_string()),
            total_charge_amount: Some(amount.to_string()),
            ..Self::default()
        }
    }

    pub fn with_bin_pcn(mut self, bin: &str, pcn: &str) -> Self {
        self.bin_number = Some(bin.to_string());
        self.pcn_number = Some(pcn.to_string());
        self
    }

    /// Structural checks only. Runs before any bucket is touched.
    pub fn validate(&self) -> Result<Claim, ClaimRejection> {
        let claim_id = self.claim_id.trim();
        if claim_id.is_empty() {
            return Err(ClaimRejection::MissingClaimId);
        }
        let payer_id = non_blank(&self.payer_id).ok_or(ClaimRejection::MissingPayer)?;
        let payee_id = non_blank(&self.payee_id).ok_or(ClaimRejection::MissingPayee)?;

        let raw = non_blank(&self.total_charge_amount).ok_or(ClaimRejection::MissingAmount)?;
        let charge_amount: Money = raw
            .parse()
            .map_err(|_| ClaimRejection::UnparseableAmount(raw.clone()))?;
        if charge_amount.is_negative() {
            return Err(ClaimRejection::NegativeAmount(charge_amount));
        }

        let paid_amount = match non_blank(&self.paid_amount) {
            Some(raw) => Some(
                raw.parse::<Money>()
                    .map_err(|_| ClaimRejection::UnparseableAmount(raw.clone()))?,
            ),
            None => None,
        };

        Ok(Claim {
            claim_id: claim_id.to_string(),
            payer_id,
            payee_id,
            charge_amount,
            paid_amount,
            status: self.status.clone(),
            bin_number: non_blank(&self.bin_number),
            pcn_number: non_blank(&self.pcn_number),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_change_event_with_numeric_amounts() {
        let json = r#"{
            "claimId": "C-1", "payerId": "P1", "payeeId": "E1",
            "totalChargeAmount": 125.5, "paidAmount": "100.00",
            "status": "PAID", "binNumber": "610014", "pcnNumber": "MEDDPRIME"
        }"#;
        let event: ClaimEvent = serde_json::from_str(json).unwrap();
        let claim = event.validate().unwrap();
        assert_eq!(claim.charge_amount, Money::from_cents(12_550));
        assert_eq!(claim.paid_amount, Some(Money::from_cents(10_000)));
        assert_eq!(claim.bin_number.as_deref(), Some("610014"));
    }

    #[test]
    fn structural_failures_are_typed() {
        let ok = ClaimEvent::new("C-1", "P1", "E1", "10.00");
        assert!(ok.validate().is_ok());

        let mut missing_payer = ok.clone();
        missing_payer.payer_id = Some("  ".into());
        assert_eq!(missing_payer.validate(), Err(ClaimRejection::MissingPayer));

        let mut bad_amount = ok.clone();
        bad_amount.total_charge_amount = Some("ten".into());
        assert_eq!(
            bad_amount.validate(),
            Err(ClaimRejection::UnparseableAmount("ten".into()))
        );

        let mut negative = ok;
        negative.total_charge_amount = Some("-1.00".into());
        assert!(matches!(negative.validate(), Err(ClaimRejection::NegativeAmount(_))));
    }
}
