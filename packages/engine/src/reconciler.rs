//! Reconciliation worker: drains DLQ entries that are ready for another
//! attempt and records each outcome.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common::{Clock, DlqConfig, ErrorCategory, PaymentError, PaymentPayload, ReconcilerConfig};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::dlq::{AttemptReport, DlqService, RetryApplied, dlq_service};
use crate::entity::payment_dlq;
use crate::ledger::Ledger;

/// A payment confirmed by the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPayment {
    pub transaction_id: String,
}

/// Re-runs the reconciliation of one payment.
#[async_trait]
pub trait PaymentVerifier: Send + Sync {
    async fn verify(&self, payment: &PaymentPayload) -> Result<VerifiedPayment, PaymentError>;
}

/// Checks that the ledger holds the deposit credit for the payment.
pub struct LedgerVerifier {
    ledger: Arc<dyn Ledger>,
}

impl LedgerVerifier {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Reference under which deposits are credited.
    pub fn deposit_reference(tx_hash: &str) -> String {
        format!("deposit:{tx_hash}")
    }
}

#[async_trait]
impl PaymentVerifier for LedgerVerifier {
    async fn verify(&self, payment: &PaymentPayload) -> Result<VerifiedPayment, PaymentError> {
        let reference = Self::deposit_reference(&payment.tx_hash);
        let entry = self
            .ledger
            .find_by_reference(&reference)
            .await
            .map_err(|e| PaymentError::database(e.to_string()))?
            .ok_or_else(|| {
                PaymentError::new(
                    ErrorCategory::Blockchain,
                    "TX_NOT_FOUND",
                    format!("no deposit recorded for {}", payment.tx_hash),
                )
            })?;

        if entry.amount != payment.amount || entry.currency != payment.currency {
            return Err(PaymentError::new(
                ErrorCategory::BusinessLogic,
                "AMOUNT_MISMATCH",
                format!(
                    "expected {} {}, ledger has {} {}",
                    payment.amount, payment.currency, entry.amount, entry.currency
                ),
            )
            .with_detail(serde_json::json!({
                "expected_amount": payment.amount.to_string(),
                "ledger_amount": entry.amount.to_string(),
                "ledger_transaction_id": entry.id,
            })));
        }

        Ok(VerifiedPayment {
            transaction_id: entry.id.to_string(),
        })
    }
}

/// Counters from one reconciler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale claims returned to `pending`.
    pub released: u64,
    /// Entries moved to manual review for age.
    pub expired: u64,
    pub attempted: usize,
    pub resolved: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
    /// Lost claims and fenced results.
    pub skipped: usize,
    pub errors: usize,
}

pub struct ReconciliationWorker {
    db: DatabaseConnection,
    verifier: Arc<dyn PaymentVerifier>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    dlq: DlqConfig,
}

impl ReconciliationWorker {
    pub fn new(
        db: DatabaseConnection,
        verifier: Arc<dyn PaymentVerifier>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
        dlq: DlqConfig,
    ) -> Self {
        Self {
            db,
            verifier,
            clock,
            config,
            dlq,
        }
    }

    fn service(&self) -> DlqService<'_, DatabaseConnection> {
        dlq_service(&self.db, self.clock.as_ref(), &self.dlq)
    }

    /// Sweep, surface expired entries, then attempt every ready entry once.
    pub async fn tick(&self) -> Result<ReconcileReport, DbErr> {
        let service = self.service();
        let mut report = ReconcileReport::default();

        let claimed_before = self.clock.now() - self.config.stale_claim_timeout();
        report.released = service.release_stale_claims(claimed_before).await?;
        report.expired = service.surface_expired().await?;

        let ready = service.ready_for_retry(self.config.batch_size).await?;

        for entry in ready {
            match self.attempt(&service, &entry).await {
                Ok(None) => report.skipped += 1,
                Ok(Some(applied)) => {
                    report.attempted += 1;
                    match applied {
                        RetryApplied::Resolved => report.resolved += 1,
                        RetryApplied::Rescheduled { .. } => report.rescheduled += 1,
                        RetryApplied::Exhausted => report.exhausted += 1,
                        RetryApplied::Fenced => report.skipped += 1,
                    }
                }
                Err(e) => {
                    error!(
                        dlq_id = entry.id,
                        tx_hash = %entry.tx_hash,
                        error = %e,
                        "Reconciliation attempt could not be recorded"
                    );
                    report.errors += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                released = report.released,
                expired = report.expired,
                attempted = report.attempted,
                resolved = report.resolved,
                rescheduled = report.rescheduled,
                exhausted = report.exhausted,
                skipped = report.skipped,
                errors = report.errors,
                "Reconciler tick finished"
            );
        }

        Ok(report)
    }

    /// Claim one entry, verify it, and record the outcome. `None` when the claim
    /// was lost.
    async fn attempt(
        &self,
        service: &DlqService<'_, DatabaseConnection>,
        entry: &payment_dlq::Model,
    ) -> Result<Option<RetryApplied>, DbErr> {
        let token = Uuid::new_v4();
        if !service.claim(entry, token).await? {
            debug!(dlq_id = entry.id, "DLQ entry already claimed");
            return Ok(None);
        }

        let payload = entry.payload();
        let started = Instant::now();
        let outcome =
            match tokio::time::timeout(self.config.attempt_timeout(), self.verifier.verify(&payload))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PaymentError::timeout(format!(
                    "verification exceeded {}s",
                    self.config.attempt_timeout_secs
                ))),
            };
        let duration_ms = started.elapsed().as_millis() as u64;

        let report = match outcome {
            Ok(verified) => AttemptReport::success(duration_ms, verified.transaction_id),
            Err(e) => AttemptReport::failure(duration_ms, e),
        };

        service.record_retry_attempt(entry, token, report).await.map(Some)
    }

    /// Spawn the periodic loop.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                tick_interval_secs = self.config.tick_interval_secs,
                batch_size = self.config.batch_size,
                max_attempts = self.dlq.max_attempts,
                "Starting reconciliation worker"
            );

            let mut interval = tokio::time::interval(self.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.tick().await {
                    error!(error = %e, "Reconciler tick failed");
                }
            }

            info!("Reconciliation worker stopped");
        })
    }
}
