//! Ledger entities and the per-kind update rules.
//!
//! Every rule is written against the *set* of facts an entity has seen
//! rather than a transition from its previous status, so applying the same
//! events in any order converges on the same entity.

use super::canonical::{CanonicalEvent, EntityKind, EntityRef, EventKind, NaturalKey};
use super::context::TrustedContext;
use super::money::MinorUnits;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Applied in the expected order.
    Applied,
    /// Arrived ahead of a fact it depends on; the commutative rule absorbed it.
    Reconciled,
    /// Contradicts facts already recorded; the entity is flagged for review.
    Conflict { reason: String },
}

/// Proof that a canonical event has been durably applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEventRecord {
    pub natural_key: NaturalKey,
    pub org_id: String,
    pub kind: EventKind,
    pub entity: EntityRef,
    pub applied_at: DateTime<Utc>,
    pub outcome: ApplyOutcome,
    /// Principal of the context the commit ran under.
    #[serde(default)]
    pub applied_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Settled,
    PartiallyRefunded,
    Refunded,
    Failed,
    Conflicted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub amount: MinorUnits,
    pub occurred_at: DateTime<Utc>,
    /// Charge that settled the payment.
    #[serde(default)]
    pub attempt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub org_id: String,
    pub provider: String,
    pub payment_id: String,
    pub currency: String,
    pub settlement: Option<Settlement>,
    /// Failed charge attempts and when each first failed.
    #[serde(default)]
    pub failed_attempts: BTreeMap<String, DateTime<Utc>>,
    /// Refunds keyed by their natural key, so re-applying one is a no-op.
    pub refunds: BTreeMap<NaturalKey, MinorUnits>,
    pub order_ref: Option<String>,
    pub conflict: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    fn empty(event: &CanonicalEvent) -> Self {
        Self {
            org_id: event.org_id.clone(),
            provider: event.provider.clone(),
            payment_id: event.entity_id.clone(),
            currency: event.currency.clone(),
            settlement: None,
            failed_attempts: BTreeMap::new(),
            refunds: BTreeMap::new(),
            order_ref: None,
            conflict: None,
            updated_at: event.occurred_at,
        }
    }

    pub fn refunded(&self) -> MinorUnits {
        self.refunds.values().copied().sum()
    }

    pub fn settled_amount(&self) -> MinorUnits {
        self.settlement
            .as_ref()
            .map(|s| s.amount)
            .unwrap_or(MinorUnits::ZERO)
    }

    /// Earliest recorded failure across all attempts.
    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_attempts.values().min().copied()
    }

    /// Settled minus refunded.
    pub fn net_amount(&self) -> MinorUnits {
        self.settled_amount() - self.refunded()
    }

    pub fn status(&self) -> PaymentStatus {
        if self.conflict.is_some() {
            return PaymentStatus::Conflicted;
        }
        match (&self.settlement, self.failed_at()) {
            (Some(s), _) => {
                let refunded = self.refunded();
                if refunded == MinorUnits::ZERO {
                    PaymentStatus::Settled
                } else if refunded >= s.amount {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                }
            }
            (None, Some(_)) => PaymentStatus::Failed,
            (None, None) => PaymentStatus::Pending,
        }
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    fn apply(&mut self, event: &CanonicalEvent) -> Result<ApplyOutcome> {
        if self.order_ref.is_none() {
            self.order_ref = event.detail_str("order_id").map(str::to_string);
        }
        self.touch(event.occurred_at);

        let ahead_of_settlement = match event.kind {
            EventKind::PaymentSettled => {
                let attempt = event.attempt_id();
                let replace = self.settlement.as_ref().is_none_or(|s| {
                    (event.occurred_at, attempt) >= (s.occurred_at, s.attempt.as_str())
                });
                if replace {
                    self.settlement = Some(Settlement {
                        amount: event.amount,
                        occurred_at: event.occurred_at,
                        attempt: attempt.to_string(),
                    });
                }
                false
            }
            EventKind::PaymentRefunded => {
                self.refunds.insert(event.natural_key.clone(), event.amount);
                self.settlement.is_none()
            }
            EventKind::PaymentFailed => {
                self.failed_attempts
                    .entry(event.attempt_id().to_string())
                    .and_modify(|t| *t = (*t).min(event.occurred_at))
                    .or_insert(event.occurred_at);
                false
            }
            other => {
                return Err(PaymentError::ValidationError(format!(
                    "{other} cannot be applied to a payment"
                )));
            }
        };

        // Derived from the accumulated facts, never carried over.
        self.conflict = self.conflict_reason().map(str::to_string);
        if let Some(reason) = &self.conflict {
            return Ok(ApplyOutcome::Conflict {
                reason: reason.clone(),
            });
        }
        let settled_with_prior_refunds =
            event.kind == EventKind::PaymentSettled && !self.refunds.is_empty();
        if ahead_of_settlement || settled_with_prior_refunds {
            Ok(ApplyOutcome::Reconciled)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    /// A settlement supersedes failed attempts on other charges; only the
    /// settling charge itself failing is a contradiction.
    fn conflict_reason(&self) -> Option<&'static str> {
        let settlement = self.settlement.as_ref()?;
        if self.failed_attempts.contains_key(&settlement.attempt) {
            Some("payment both settled and failed")
        } else if self.refunded() > settlement.amount {
            Some("refunds exceed settled amount")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub org_id: String,
    pub provider: String,
    pub order_id: String,
    pub currency: String,
    pub amount: Option<MinorUnits>,
    pub created_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Order {
    fn empty(event: &CanonicalEvent) -> Self {
        Self {
            org_id: event.org_id.clone(),
            provider: event.provider.clone(),
            order_id: event.entity_id.clone(),
            currency: event.currency.clone(),
            amount: None,
            created_at: None,
            cancelled_at: None,
        }
    }

    pub fn status(&self) -> OrderStatus {
        match (self.created_at, self.cancelled_at) {
            (_, Some(_)) => OrderStatus::Cancelled,
            (Some(_), None) => OrderStatus::Open,
            (None, None) => OrderStatus::Pending,
        }
    }

    fn apply(&mut self, event: &CanonicalEvent) -> Result<ApplyOutcome> {
        match event.kind {
            EventKind::OrderCreated => {
                if self.created_at.is_none_or(|t| event.occurred_at >= t) {
                    self.created_at = Some(event.occurred_at);
                    self.amount = Some(event.amount);
                    self.currency = event.currency.clone();
                }
                if self.cancelled_at.is_some() {
                    Ok(ApplyOutcome::Reconciled)
                } else {
                    Ok(ApplyOutcome::Applied)
                }
            }
            EventKind::OrderCancelled => {
                self.cancelled_at = Some(
                    self.cancelled_at
                        .map_or(event.occurred_at, |t| t.min(event.occurred_at)),
                );
                if self.created_at.is_none() {
                    Ok(ApplyOutcome::Reconciled)
                } else {
                    Ok(ApplyOutcome::Applied)
                }
            }
            other => Err(PaymentError::ValidationError(format!(
                "{other} cannot be applied to an order"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub org_id: String,
    pub provider: String,
    pub payout_id: String,
    pub currency: String,
    pub amount: MinorUnits,
    /// Provider payment ids this payout settles.
    pub payment_refs: Vec<String>,
    pub issued_at: DateTime<Utc>,
}

impl Payout {
    fn from_event(event: &CanonicalEvent) -> Self {
        let mut payment_refs: Vec<String> = event
            .details
            .get("payment_ids")
            .and_then(|v| v.as_array())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        payment_refs.sort();
        payment_refs.dedup();
        Self {
            org_id: event.org_id.clone(),
            provider: event.provider.clone(),
            payout_id: event.entity_id.clone(),
            currency: event.currency.clone(),
            amount: event.amount,
            payment_refs,
            issued_at: event.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum LedgerEntity {
    Payment(Payment),
    Order(Order),
    Payout(Payout),
}

impl LedgerEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            LedgerEntity::Payment(_) => EntityKind::Payment,
            LedgerEntity::Order(_) => EntityKind::Order,
            LedgerEntity::Payout(_) => EntityKind::Payout,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        match self {
            LedgerEntity::Payment(p) => {
                EntityRef::new(EntityKind::Payment, p.provider.clone(), p.payment_id.clone())
            }
            LedgerEntity::Order(o) => {
                EntityRef::new(EntityKind::Order, o.provider.clone(), o.order_id.clone())
            }
            LedgerEntity::Payout(p) => {
                EntityRef::new(EntityKind::Payout, p.provider.clone(), p.payout_id.clone())
            }
        }
    }

    pub fn org_id(&self) -> &str {
        match self {
            LedgerEntity::Payment(p) => &p.org_id,
            LedgerEntity::Order(o) => &o.org_id,
            LedgerEntity::Payout(p) => &p.org_id,
        }
    }

    pub fn as_payment(&self) -> Option<&Payment> {
        match self {
            LedgerEntity::Payment(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_order(&self) -> Option<&Order> {
        match self {
            LedgerEntity::Order(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_payout(&self) -> Option<&Payout> {
        match self {
            LedgerEntity::Payout(p) => Some(p),
            _ => None,
        }
    }
}

/// Applies one canonical event to the current state of its entity.
///
/// Pure: storage adapters call this inside the same atomic unit that inserts
/// the [`AppliedEventRecord`].
pub fn apply_event(
    current: Option<LedgerEntity>,
    event: &CanonicalEvent,
) -> Result<(LedgerEntity, ApplyOutcome)> {
    match event.kind.entity_kind() {
        EntityKind::Payment => {
            let mut payment = match current {
                Some(LedgerEntity::Payment(p)) => p,
                None => Payment::empty(event),
                Some(other) => return Err(entity_mismatch(&other, event)),
            };
            let outcome = payment.apply(event)?;
            Ok((LedgerEntity::Payment(payment), outcome))
        }
        EntityKind::Order => {
            let mut order = match current {
                Some(LedgerEntity::Order(o)) => o,
                None => Order::empty(event),
                Some(other) => return Err(entity_mismatch(&other, event)),
            };
            let outcome = order.apply(event)?;
            Ok((LedgerEntity::Order(order), outcome))
        }
        EntityKind::Payout => {
            let incoming = Payout::from_event(event);
            match current {
                Some(LedgerEntity::Payout(existing)) if existing.issued_at > incoming.issued_at => {
                    Ok((LedgerEntity::Payout(existing), ApplyOutcome::Reconciled))
                }
                Some(LedgerEntity::Payout(_)) | None => {
                    Ok((LedgerEntity::Payout(incoming), ApplyOutcome::Applied))
                }
                Some(other) => Err(entity_mismatch(&other, event)),
            }
        }
    }
}

fn entity_mismatch(existing: &LedgerEntity, event: &CanonicalEvent) -> PaymentError {
    PaymentError::ValidationError(format!(
        "event {} targets {} but the stored entity is a {}",
        event.natural_key,
        event.entity_ref(),
        existing.kind().as_str()
    ))
}

/// Builds the applied record for an event that was just committed.
pub fn applied_record(
    ctx: &TrustedContext,
    event: &CanonicalEvent,
    outcome: ApplyOutcome,
    now: DateTime<Utc>,
) -> AppliedEventRecord {
    AppliedEventRecord {
        natural_key: event.natural_key.clone(),
        org_id: event.org_id.clone(),
        kind: event.kind,
        entity: event.entity_ref(),
        applied_at: now,
        outcome,
        applied_by: ctx.principal().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::canonical::fixtures::event;
    use chrono::Duration;

    fn apply_all(events: &[CanonicalEvent]) -> LedgerEntity {
        let mut current = None;
        for ev in events {
            let (entity, _) = apply_event(current, ev).unwrap();
            current = Some(entity);
        }
        current.unwrap()
    }

    #[test]
    fn test_settle_then_refund_in_either_order_converges() {
        let settled = event(EventKind::PaymentSettled, "pi_1", "pi_1", 10000);
        let mut refund = event(EventKind::PaymentRefunded, "pi_1", "re_1", 2500);
        refund.occurred_at = settled.occurred_at + Duration::minutes(5);

        let in_order = apply_all(&[settled.clone(), refund.clone()]);
        let reversed = apply_all(&[refund, settled]);

        let a = in_order.as_payment().unwrap();
        let b = reversed.as_payment().unwrap();
        assert_eq!(a.status(), PaymentStatus::PartiallyRefunded);
        assert_eq!(a.status(), b.status());
        assert_eq!(a.net_amount(), MinorUnits::new(7500));
        assert_eq!(a.net_amount(), b.net_amount());
        assert_eq!(a.refunds, b.refunds);
    }

    #[test]
    fn test_refund_before_settlement_is_reconciled() {
        let refund = event(EventKind::PaymentRefunded, "pi_1", "re_1", 100);
        let (_, outcome) = apply_event(None, &refund).unwrap();
        assert_eq!(outcome, ApplyOutcome::Reconciled);
    }

    #[test]
    fn test_same_refund_twice_counts_once() {
        let settled = event(EventKind::PaymentSettled, "pi_1", "pi_1", 10000);
        let refund = event(EventKind::PaymentRefunded, "pi_1", "re_1", 10000);
        let entity = apply_all(&[settled, refund.clone(), refund]);
        let payment = entity.as_payment().unwrap();
        assert_eq!(payment.refunded(), MinorUnits::new(10000));
        assert_eq!(payment.status(), PaymentStatus::Refunded);
    }

    #[test]
    fn test_settled_and_failed_is_a_conflict() {
        let settled = event(EventKind::PaymentSettled, "pi_1", "pi_1", 10000);
        let failed = event(EventKind::PaymentFailed, "pi_1", "pi_1", 10000);

        let (entity, _) = apply_event(None, &settled).unwrap();
        let (entity, outcome) = apply_event(Some(entity), &failed).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Conflict { .. }));
        assert_eq!(
            entity.as_payment().unwrap().status(),
            PaymentStatus::Conflicted
        );
    }

    fn on_charge(mut ev: CanonicalEvent, charge: &str) -> CanonicalEvent {
        ev.natural_key = NaturalKey::from_object("stripe", ev.kind, charge);
        ev.details = serde_json::json!({ "charge_id": charge });
        ev
    }

    #[test]
    fn test_declined_charge_then_successful_retry_is_settled() {
        let failed = on_charge(event(EventKind::PaymentFailed, "pi_1", "ch_1", 10000), "ch_1");
        let mut settled = event(EventKind::PaymentSettled, "pi_1", "pi_1", 10000);
        settled.details = serde_json::json!({ "charge_id": "ch_2" });
        settled.occurred_at = failed.occurred_at + Duration::minutes(2);

        let a = apply_all(&[failed.clone(), settled.clone()]);
        let b = apply_all(&[settled.clone(), failed.clone()]);
        let payment = a.as_payment().unwrap();
        assert_eq!(payment.status(), PaymentStatus::Settled);
        assert_eq!(payment.conflict, None);
        assert_eq!(payment.failed_at(), Some(failed.occurred_at));
        assert_eq!(a, b);

        let (_, outcome) = apply_event(Some(apply_all(&[failed])), &settled).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_failure_of_the_settling_charge_is_a_conflict() {
        let settled = on_charge(event(EventKind::PaymentSettled, "pi_1", "pi_1", 10000), "ch_2");
        let failed = on_charge(event(EventKind::PaymentFailed, "pi_1", "ch_2", 10000), "ch_2");
        let entity = apply_all(&[settled, failed]);
        assert_eq!(
            entity.as_payment().unwrap().status(),
            PaymentStatus::Conflicted
        );
    }

    #[test]
    fn test_failed_attempts_without_settlement_fail_the_payment() {
        let first = on_charge(event(EventKind::PaymentFailed, "pi_1", "ch_1", 500), "ch_1");
        let mut second = on_charge(event(EventKind::PaymentFailed, "pi_1", "ch_2", 500), "ch_2");
        second.occurred_at = first.occurred_at + Duration::minutes(1);
        let entity = apply_all(&[second, first.clone()]);
        let payment = entity.as_payment().unwrap();
        assert_eq!(payment.status(), PaymentStatus::Failed);
        assert_eq!(payment.failed_attempts.len(), 2);
        assert_eq!(payment.failed_at(), Some(first.occurred_at));
    }

    #[test]
    fn test_applied_record_names_the_principal() {
        let ev = event(EventKind::PaymentSettled, "pi_1", "pi_1", 100);
        let ctx = TrustedContext::internal("worker");
        let record = applied_record(&ctx, &ev, ApplyOutcome::Applied, ev.occurred_at);
        assert_eq!(record.applied_by, "internal:worker");
    }

    #[test]
    fn test_conflict_clears_when_later_settlement_covers_refunds() {
        let first = event(EventKind::PaymentSettled, "pi_1", "pi_1", 100);
        let mut second = first.clone();
        second.natural_key = NaturalKey::from_object("stripe", EventKind::PaymentSettled, "ch_1");
        second.amount = MinorUnits::new(200);
        second.occurred_at = first.occurred_at + Duration::minutes(1);
        let refund = event(EventKind::PaymentRefunded, "pi_1", "re_1", 150);

        let a = apply_all(&[first.clone(), refund.clone(), second.clone()]);
        let b = apply_all(&[first, second, refund]);
        assert_eq!(a.as_payment().unwrap().conflict, None);
        assert_eq!(a.as_payment().unwrap().status(), b.as_payment().unwrap().status());
    }

    #[test]
    fn test_order_cancel_before_create_converges() {
        let created = event(EventKind::OrderCreated, "1001", "1001", 5000);
        let mut cancelled = event(EventKind::OrderCancelled, "1001", "1001", 0);
        cancelled.occurred_at = created.occurred_at + Duration::hours(1);

        let a = apply_all(&[created.clone(), cancelled.clone()]);
        let b = apply_all(&[cancelled, created]);
        assert_eq!(a, b);
        assert_eq!(a.as_order().unwrap().status(), OrderStatus::Cancelled);
    }

    #[test]
    fn test_payout_keeps_latest_issue() {
        let mut first = event(EventKind::PayoutIssued, "po_1", "po_1", 1000);
        first.details = serde_json::json!({ "payment_ids": ["pi_2", "pi_1"] });
        let mut later = first.clone();
        later.natural_key = NaturalKey::from_object("stripe", EventKind::PayoutIssued, "po_1:v2");
        later.amount = MinorUnits::new(1200);
        later.occurred_at = first.occurred_at + Duration::days(1);

        let a = apply_all(&[first.clone(), later.clone()]);
        let b = apply_all(&[later, first]);
        assert_eq!(a, b);
        let payout = a.as_payout().unwrap();
        assert_eq!(payout.amount, MinorUnits::new(1200));
        assert_eq!(payout.payment_refs, vec!["pi_1".to_string(), "pi_2".to_string()]);
    }

    #[test]
    fn test_wrong_entity_kind_is_rejected() {
        let order = event(EventKind::OrderCreated, "x", "x", 1);
        let (entity, _) = apply_event(None, &order).unwrap();
        let payment = event(EventKind::PaymentSettled, "x", "x", 1);
        assert!(apply_event(Some(entity), &payment).is_err());
    }
}
