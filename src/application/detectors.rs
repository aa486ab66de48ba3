use super::consistency::{Detector, DetectorContext, DetectorRunner};
use crate::connectors::ProviderKey;
use crate::domain::anomaly::Severity;
use crate::domain::canonical::{EntityKind, EntityRef};
use crate::domain::ledger::LedgerEntity;
use crate::domain::money::MinorUnits;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

pub const PAYMENT_WITHOUT_ORDER: &str = "payment-without-order";
pub const PAYOUT_MISMATCH: &str = "payout-mismatch";
pub const ORDERING_CONFLICT: &str = "ordering-conflict";

impl DetectorRunner {
    /// Registers the built-in detectors.
    pub fn with_default_detectors(self, order_grace: Duration) -> Self {
        self.with_detector(Arc::new(PaymentWithoutOrderDetector::new(order_grace)))
            .with_detector(Arc::new(PayoutMismatchDetector))
            .with_detector(Arc::new(OrderingConflictDetector))
    }
}

/// Settled payments that reference an order the ledger has never seen.
///
/// Payments settled within `grace` of the run are skipped, since the order
/// webhook may still be in flight. Payments carrying no order reference are
/// standalone charges and are not flagged.
#[derive(Debug, Clone)]
pub struct PaymentWithoutOrderDetector {
    grace: Duration,
}

impl PaymentWithoutOrderDetector {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl Detector for PaymentWithoutOrderDetector {
    fn name(&self) -> &'static str {
        PAYMENT_WITHOUT_ORDER
    }

    async fn run(&self, cx: &mut DetectorContext<'_>) -> Result<()> {
        let ledger = cx.ledger();
        let org_id = cx.org_id();
        let cutoff = cx.now() - self.grace;
        let mut pages = cx.pages(EntityKind::Payment);

        while let Some(payments) = pages.next_page().await? {
            for entity in payments {
                let LedgerEntity::Payment(payment) = &entity else {
                    continue;
                };
                let Some(settlement) = &payment.settlement else {
                    continue;
                };
                if settlement.occurred_at > cutoff {
                    continue;
                }
                let payment_ref = entity.entity_ref();
                let Some(order_id) = &payment.order_ref else {
                    cx.mark_checked(payment_ref);
                    continue;
                };

                // The order may come from a different provider than the
                // payment (gateway charge for a checkout-platform order).
                let mut found = false;
                for provider in ProviderKey::ALL {
                    let order_ref =
                        EntityRef::new(EntityKind::Order, provider.as_str(), order_id.clone());
                    if ledger.get_entity(org_id, &order_ref).await?.is_some() {
                        found = true;
                        break;
                    }
                }

                if found {
                    cx.mark_checked(payment_ref);
                } else {
                    let description = format!(
                        "payment {} settled {} {} at {} but order {} was never received",
                        payment.payment_id,
                        payment.settled_amount(),
                        payment.currency,
                        settlement.occurred_at.to_rfc3339(),
                        order_id
                    );
                    cx.raise(payment_ref, Severity::Medium, description).await?;
                }
            }
        }
        Ok(())
    }
}

/// Payouts whose amount differs from the net (settled minus refunded)
/// total of the payments they list. Payouts listing no payments are not
/// checked.
#[derive(Debug, Clone, Default)]
pub struct PayoutMismatchDetector;

#[async_trait]
impl Detector for PayoutMismatchDetector {
    fn name(&self) -> &'static str {
        PAYOUT_MISMATCH
    }

    async fn run(&self, cx: &mut DetectorContext<'_>) -> Result<()> {
        let ledger = cx.ledger();
        let org_id = cx.org_id();
        let mut pages = cx.pages(EntityKind::Payout);

        while let Some(payouts) = pages.next_page().await? {
            for entity in payouts {
                let LedgerEntity::Payout(payout) = &entity else {
                    continue;
                };
                if payout.payment_refs.is_empty() {
                    continue;
                }

                let mut total = MinorUnits::ZERO;
                let mut missing = Vec::new();
                for payment_id in &payout.payment_refs {
                    let payment_ref = EntityRef::new(
                        EntityKind::Payment,
                        payout.provider.clone(),
                        payment_id.clone(),
                    );
                    match ledger.get_entity(org_id, &payment_ref).await? {
                        Some(LedgerEntity::Payment(payment)) => total += payment.net_amount(),
                        _ => missing.push(payment_id.as_str()),
                    }
                }

                if total == payout.amount {
                    cx.mark_checked(entity.entity_ref());
                    continue;
                }
                let mut description = format!(
                    "payout {} of {} {} does not match settled payments total {}",
                    payout.payout_id, payout.amount, payout.currency, total
                );
                if !missing.is_empty() {
                    description.push_str(&format!(" (missing payments: {})", missing.join(", ")));
                }
                cx.raise(entity.entity_ref(), Severity::High, description)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Payments whose recorded facts contradict each other, e.g. both settled
/// and failed.
#[derive(Debug, Clone, Default)]
pub struct OrderingConflictDetector;

#[async_trait]
impl Detector for OrderingConflictDetector {
    fn name(&self) -> &'static str {
        ORDERING_CONFLICT
    }

    async fn run(&self, cx: &mut DetectorContext<'_>) -> Result<()> {
        let mut pages = cx.pages(EntityKind::Payment);

        while let Some(payments) = pages.next_page().await? {
            for entity in payments {
                let LedgerEntity::Payment(payment) = &entity else {
                    continue;
                };
                match &payment.conflict {
                    Some(reason) => {
                        let description = format!("payment {}: {}", payment.payment_id, reason);
                        cx.raise(entity.entity_ref(), Severity::High, description)
                            .await?;
                    }
                    None => cx.mark_checked(entity.entity_ref()),
                }
            }
        }
        Ok(())
    }
}
