use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{
    AttemptOutcome, Clock, DlqConfig, DlqPriority, DlqStatus, FailureSource, PaymentError,
    PaymentPayload, ResolutionMethod, RetryDecision, RetryPolicy, RetryRecord,
};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::entity::payment_dlq;
use crate::error::{EngineError, EngineResult};

/// Name recorded in `resolved_by` for automatic resolutions.
pub const AUTO_RESOLVER: &str = "reconciliation-worker";

/// Result of attempting to resolve a DLQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveResult {
    /// Entry was successfully resolved.
    Resolved,
    /// Entry was not found.
    NotFound,
    /// Entry was already resolved.
    AlreadyResolved,
}

/// Outcome of [`DlqService::record_failure`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFailure {
    pub entry: payment_dlq::Model,
    /// `false` when the hash was already queued and only bookkeeping changed.
    pub created: bool,
}

/// What a reconciliation attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub outcome: AttemptOutcome,
    pub error: Option<PaymentError>,
    pub duration_ms: u64,
    /// Transaction that settled the payment, on success.
    pub transaction_id: Option<String>,
}

impl AttemptReport {
    pub fn success(duration_ms: u64, transaction_id: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Success,
            error: None,
            duration_ms,
            transaction_id: Some(transaction_id.into()),
        }
    }

    pub fn failure(duration_ms: u64, error: PaymentError) -> Self {
        Self {
            outcome: AttemptOutcome::Failure,
            error: Some(error),
            duration_ms,
            transaction_id: None,
        }
    }
}

/// State an entry ends up in after a recorded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryApplied {
    Resolved,
    Rescheduled { next_retry_at: DateTime<Utc> },
    /// Out of attempts: `failed_permanently` and flagged for an operator.
    Exhausted,
    /// The claim token no longer matches; nothing was written.
    Fenced,
}

/// Statistics about the payment DLQ.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqStats {
    pub by_status: HashMap<DlqStatus, u64>,
    pub requires_attention: u64,
    pub high_value_open: u64,
}

impl DlqStats {
    pub fn count(&self, status: DlqStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

pub struct DlqService<'a, C: ConnectionTrait> {
    conn: &'a C,
    clock: &'a dyn Clock,
    config: &'a DlqConfig,
}

impl<'a, C: ConnectionTrait> DlqService<'a, C> {
    pub fn new(conn: &'a C, clock: &'a dyn Clock, config: &'a DlqConfig) -> Self {
        Self {
            conn,
            clock,
            config,
        }
    }

    /// Queue a failed reconciliation, at most once per transaction hash.
    ///
    /// A repeated report for a queued hash bumps `report_count` and refreshes the
    /// last error, unless the entry is already resolved.
    pub async fn record_failure(
        &self,
        payload: &PaymentPayload,
        error: &PaymentError,
        source: FailureSource,
    ) -> Result<RecordedFailure, DbErr> {
        if let Some(existing) = self.get_by_tx_hash(&payload.tx_hash).await? {
            let entry = self.record_duplicate(&existing, error).await?;
            return Ok(RecordedFailure {
                entry,
                created: false,
            });
        }

        let now = self.clock.now();
        let high_value = payload.amount >= self.config.high_value_threshold;
        let priority = if high_value {
            DlqPriority::High
        } else {
            DlqPriority::Normal
        };

        let model = payment_dlq::ActiveModel {
            tx_hash: Set(payload.tx_hash.clone()),
            user_id: Set(payload.user_id),
            purchase_id: Set(payload.purchase_id),
            amount: Set(payload.amount),
            currency: Set(payload.currency.clone()),
            network: Set(payload.network.clone()),
            token: Set(payload.token.clone()),
            expected_address: Set(payload.expected_address.clone()),
            source: Set(source),
            error_message: Set(error.message.clone()),
            error_code: Set(error.code.clone()),
            error_category: Set(error.category),
            error_detail: Set(error.detail.clone()),
            attempts: Set(0),
            max_attempts: Set(self.config.max_attempts as i32),
            next_retry_at: Set(Some(now)),
            backoff_multiplier: Set(self.config.backoff_multiplier),
            base_delay_ms: Set(self.config.base_delay_ms as i64),
            status: Set(DlqStatus::Pending),
            retry_history: Set(serde_json::json!([])),
            priority: Set(priority),
            requires_attention: Set(false),
            high_value: Set(high_value),
            suspicious: Set(false),
            report_count: Set(1),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        match model.insert(self.conn).await {
            Ok(entry) => {
                info!(
                    dlq_id = entry.id,
                    tx_hash = %entry.tx_hash,
                    user_id = entry.user_id,
                    amount = %entry.amount,
                    code = %entry.error_code,
                    high_value,
                    "Payment failure queued for reconciliation"
                );
                Ok(RecordedFailure {
                    entry,
                    created: true,
                })
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                let existing = self.get_by_tx_hash(&payload.tx_hash).await?.ok_or_else(|| {
                    DbErr::Custom("UniqueConstraintViolation but existing row not found".to_string())
                })?;
                let entry = self.record_duplicate(&existing, error).await?;
                Ok(RecordedFailure {
                    entry,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn record_duplicate(
        &self,
        existing: &payment_dlq::Model,
        error: &PaymentError,
    ) -> Result<payment_dlq::Model, DbErr> {
        let mut update = payment_dlq::Entity::update_many()
            .col_expr(
                payment_dlq::Column::ReportCount,
                Expr::cust("report_count + 1"),
            )
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(payment_dlq::Column::Id.eq(existing.id));

        if existing.status != DlqStatus::Resolved {
            update = update
                .col_expr(
                    payment_dlq::Column::ErrorMessage,
                    Expr::value(error.message.clone()),
                )
                .col_expr(payment_dlq::Column::ErrorCode, Expr::value(error.code.clone()))
                .col_expr(payment_dlq::Column::ErrorCategory, Expr::value(error.category))
                .col_expr(
                    payment_dlq::Column::ErrorDetail,
                    Expr::value(error.detail.clone()),
                );
        }

        update.exec(self.conn).await?;

        warn!(
            dlq_id = existing.id,
            tx_hash = %existing.tx_hash,
            status = %existing.status,
            code = %error.code,
            "Duplicate payment failure report"
        );

        self.get(existing.id)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("payment_dlq {}", existing.id)))
    }

    pub async fn get(&self, id: i32) -> Result<Option<payment_dlq::Model>, DbErr> {
        payment_dlq::Entity::find_by_id(id).one(self.conn).await
    }

    pub async fn get_by_tx_hash(&self, tx_hash: &str) -> Result<Option<payment_dlq::Model>, DbErr> {
        payment_dlq::Entity::find()
            .filter(payment_dlq::Column::TxHash.eq(tx_hash))
            .one(self.conn)
            .await
    }

    /// Entries eligible for an automatic attempt, highest priority first and
    /// oldest first within a priority.
    pub async fn ready_for_retry(&self, limit: u64) -> Result<Vec<payment_dlq::Model>, DbErr> {
        let now = self.clock.now();

        let entries = payment_dlq::Entity::find()
            .filter(payment_dlq::Column::Status.eq(DlqStatus::Pending))
            .filter(
                Condition::any()
                    .add(payment_dlq::Column::NextRetryAt.is_null())
                    .add(payment_dlq::Column::NextRetryAt.lte(now)),
            )
            .filter(Expr::cust("attempts < max_attempts"))
            .order_by_desc(payment_dlq::Column::Priority)
            .order_by_asc(payment_dlq::Column::CreatedAt)
            .order_by_asc(payment_dlq::Column::Id)
            .limit(limit)
            .all(self.conn)
            .await?;

        Ok(entries.into_iter().filter(|e| e.can_retry(now)).collect())
    }

    /// Move a ready entry to `retrying` under `token`.
    ///
    /// Conditional on the status and attempt count observed in `entry`; returns
    /// `false` when another worker got there first.
    pub async fn claim(&self, entry: &payment_dlq::Model, token: Uuid) -> Result<bool, DbErr> {
        let now = self.clock.now();

        let result = payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::Status, Expr::value(DlqStatus::Retrying))
            .col_expr(payment_dlq::Column::ClaimToken, Expr::value(Some(token)))
            .col_expr(payment_dlq::Column::ClaimedAt, Expr::value(Some(now)))
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(now))
            .filter(payment_dlq::Column::Id.eq(entry.id))
            .filter(payment_dlq::Column::Status.eq(DlqStatus::Pending))
            .filter(payment_dlq::Column::Attempts.eq(entry.attempts))
            .exec(self.conn)
            .await?;

        Ok(result.rows_affected == 1)
    }

    /// Record the outcome of an attempt made under `token`.
    ///
    /// Success resolves the entry. Failure schedules the next retry with the
    /// entry's own backoff policy, or marks it `failed_permanently` once the
    /// attempt budget is spent.
    pub async fn record_retry_attempt(
        &self,
        entry: &payment_dlq::Model,
        token: Uuid,
        report: AttemptReport,
    ) -> Result<RetryApplied, DbErr> {
        let now = self.clock.now();
        let attempts = entry.attempts + 1;

        let mut history = entry.history()?;
        history.push(RetryRecord::new(
            attempts as u32,
            now,
            report.error.clone(),
            report.duration_ms,
            report.outcome,
        ));

        let mut active = payment_dlq::ActiveModel {
            attempts: Set(attempts),
            retry_history: Set(
                serde_json::to_value(&history).map_err(|e| DbErr::Json(e.to_string()))?,
            ),
            claim_token: Set(None),
            claimed_at: Set(None),
            updated_at: Set(now),
            ..Default::default()
        };

        let applied = match report.outcome {
            AttemptOutcome::Success => {
                active.status = Set(DlqStatus::Resolved);
                active.resolved_at = Set(Some(now));
                active.resolved_by = Set(Some(AUTO_RESOLVER.to_string()));
                active.resolution_method = Set(Some(ResolutionMethod::AutoRetry));
                active.final_transaction_id = Set(report.transaction_id.clone());
                active.next_retry_at = Set(None);
                active.requires_attention = Set(false);
                RetryApplied::Resolved
            }
            AttemptOutcome::Failure => {
                let error = report
                    .error
                    .clone()
                    .unwrap_or_else(|| PaymentError::unknown("attempt failed without error"));
                active.error_message = Set(error.message);
                active.error_code = Set(error.code);
                active.error_category = Set(error.category);
                active.error_detail = Set(error.detail);

                if attempts as u32 >= self.config.escalate_after_attempts
                    && entry.priority < DlqPriority::High
                {
                    active.priority = Set(DlqPriority::High);
                }

                apply_decision(&mut active, entry_policy(entry).decide(attempts as u32, now))
            }
        };

        let result = payment_dlq::Entity::update_many()
            .set(active)
            .filter(payment_dlq::Column::Id.eq(entry.id))
            .filter(payment_dlq::Column::Status.eq(DlqStatus::Retrying))
            .filter(payment_dlq::Column::ClaimToken.eq(token))
            .exec(self.conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(
                dlq_id = entry.id,
                tx_hash = %entry.tx_hash,
                "Retry attempt fenced, entry no longer held by this claim"
            );
            return Ok(RetryApplied::Fenced);
        }

        match &applied {
            RetryApplied::Resolved => info!(
                dlq_id = entry.id,
                tx_hash = %entry.tx_hash,
                attempt = attempts,
                "Payment reconciled"
            ),
            RetryApplied::Rescheduled { next_retry_at } => warn!(
                dlq_id = entry.id,
                tx_hash = %entry.tx_hash,
                attempt = attempts,
                next_retry_at = %next_retry_at,
                "Reconciliation attempt failed, retry scheduled"
            ),
            RetryApplied::Exhausted => warn!(
                dlq_id = entry.id,
                tx_hash = %entry.tx_hash,
                attempt = attempts,
                "Reconciliation retries exhausted, entry needs attention"
            ),
            RetryApplied::Fenced => {}
        }

        Ok(applied)
    }

    /// Recompute the next retry of a `pending` entry from its attempt count.
    pub async fn schedule_retry(&self, id: i32) -> EngineResult<RetryApplied> {
        let now = self.clock.now();
        let entry = self.require(id).await?;
        if entry.status != DlqStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "cannot schedule retry of DLQ entry {id} in status {}",
                entry.status
            )));
        }

        let mut active = payment_dlq::ActiveModel {
            updated_at: Set(now),
            ..Default::default()
        };
        let applied = apply_decision(
            &mut active,
            entry_policy(&entry).decide(entry.attempts as u32, now),
        );

        let result = payment_dlq::Entity::update_many()
            .set(active)
            .filter(payment_dlq::Column::Id.eq(id))
            .filter(payment_dlq::Column::Status.eq(DlqStatus::Pending))
            .filter(payment_dlq::Column::Attempts.eq(entry.attempts))
            .exec(self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Ok(RetryApplied::Fenced);
        }
        Ok(applied)
    }

    /// Manually close an entry. Any status other than `resolved` may be closed;
    /// a claimed entry's in-flight attempt is then fenced off.
    pub async fn mark_as_resolved(
        &self,
        id: i32,
        resolved_by: &str,
        method: ResolutionMethod,
        notes: Option<&str>,
        transaction_id: Option<&str>,
    ) -> Result<ResolveResult, DbErr> {
        let now = self.clock.now();

        let result = payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::Status, Expr::value(DlqStatus::Resolved))
            .col_expr(payment_dlq::Column::ResolvedAt, Expr::value(Some(now)))
            .col_expr(
                payment_dlq::Column::ResolvedBy,
                Expr::value(Some(resolved_by.to_string())),
            )
            .col_expr(payment_dlq::Column::ResolutionMethod, Expr::value(Some(method)))
            .col_expr(
                payment_dlq::Column::ResolutionNotes,
                Expr::value(notes.map(str::to_string)),
            )
            .col_expr(
                payment_dlq::Column::FinalTransactionId,
                Expr::value(transaction_id.map(str::to_string)),
            )
            .col_expr(payment_dlq::Column::RequiresAttention, Expr::value(false))
            .col_expr(
                payment_dlq::Column::NextRetryAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(payment_dlq::Column::ClaimToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                payment_dlq::Column::ClaimedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(now))
            .filter(payment_dlq::Column::Id.eq(id))
            .filter(payment_dlq::Column::Status.ne(DlqStatus::Resolved))
            .exec(self.conn)
            .await?;

        if result.rows_affected > 0 {
            info!(dlq_id = id, resolved_by, method = ?method, "DLQ entry resolved manually");
            return Ok(ResolveResult::Resolved);
        }

        let exists = self.get(id).await?.is_some();
        if exists {
            Ok(ResolveResult::AlreadyResolved)
        } else {
            Ok(ResolveResult::NotFound)
        }
    }

    /// Raise an entry to at least `high` priority and flag it for an operator.
    pub async fn escalate(&self, id: i32, reason: &str) -> EngineResult<payment_dlq::Model> {
        let entry = self.require(id).await?;
        let priority = entry.priority.max(DlqPriority::High);
        self.flag(&entry, priority, false, reason).await?;
        warn!(dlq_id = id, tx_hash = %entry.tx_hash, reason, "DLQ entry escalated");
        self.require(id).await
    }

    /// Mark an entry as suspicious. Suspicious entries sort first.
    pub async fn flag_suspicious(&self, id: i32, reason: &str) -> EngineResult<payment_dlq::Model> {
        let entry = self.require(id).await?;
        self.flag(&entry, DlqPriority::Critical, true, reason).await?;
        warn!(dlq_id = id, tx_hash = %entry.tx_hash, reason, "DLQ entry flagged as suspicious");
        self.require(id).await
    }

    async fn flag(
        &self,
        entry: &payment_dlq::Model,
        priority: DlqPriority,
        suspicious: bool,
        reason: &str,
    ) -> EngineResult<()> {
        let mut update = payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::Priority, Expr::value(priority))
            .col_expr(payment_dlq::Column::RequiresAttention, Expr::value(true))
            .col_expr(
                payment_dlq::Column::EscalationReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(self.clock.now()))
            .filter(payment_dlq::Column::Id.eq(entry.id))
            .filter(payment_dlq::Column::Status.ne(DlqStatus::Resolved));
        if suspicious {
            update = update.col_expr(payment_dlq::Column::Suspicious, Expr::value(true));
        }

        if update.exec(self.conn).await?.rows_affected == 0 {
            return Err(EngineError::InvalidState(format!(
                "DLQ entry {} is already resolved",
                entry.id
            )));
        }
        Ok(())
    }

    /// Park an entry for a human. No automatic retries until it is reopened.
    pub async fn send_to_manual_review(
        &self,
        id: i32,
        reason: &str,
    ) -> EngineResult<payment_dlq::Model> {
        let now = self.clock.now();

        let result = payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::Status, Expr::value(DlqStatus::ManualReview))
            .col_expr(payment_dlq::Column::RequiresAttention, Expr::value(true))
            .col_expr(
                payment_dlq::Column::EscalationReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(
                payment_dlq::Column::NextRetryAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(now))
            .filter(payment_dlq::Column::Id.eq(id))
            .filter(
                payment_dlq::Column::Status
                    .is_in([DlqStatus::Pending, DlqStatus::FailedPermanently]),
            )
            .exec(self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.transition_error(id, "send to manual review").await);
        }

        info!(dlq_id = id, reason, "DLQ entry sent to manual review");
        self.require(id).await
    }

    /// Give a `failed_permanently` or `manual_review` entry a fresh attempt
    /// budget, eligible immediately.
    pub async fn reopen(&self, id: i32) -> EngineResult<payment_dlq::Model> {
        let now = self.clock.now();

        let result = payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::Status, Expr::value(DlqStatus::Pending))
            .col_expr(payment_dlq::Column::Attempts, Expr::value(0))
            .col_expr(payment_dlq::Column::NextRetryAt, Expr::value(Some(now)))
            .col_expr(payment_dlq::Column::RequiresAttention, Expr::value(false))
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(now))
            .filter(payment_dlq::Column::Id.eq(id))
            .filter(
                payment_dlq::Column::Status
                    .is_in([DlqStatus::FailedPermanently, DlqStatus::ManualReview]),
            )
            .exec(self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.transition_error(id, "reopen").await);
        }

        info!(dlq_id = id, "DLQ entry reopened");
        self.require(id).await
    }

    /// Move `pending` entries older than the retention window to manual review.
    pub async fn surface_expired(&self) -> Result<u64, DbErr> {
        let now = self.clock.now();
        let created_before = now - self.config.retention();

        let result = payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::Status, Expr::value(DlqStatus::ManualReview))
            .col_expr(payment_dlq::Column::RequiresAttention, Expr::value(true))
            .col_expr(
                payment_dlq::Column::EscalationReason,
                Expr::value(Some("unresolved past retention window".to_string())),
            )
            .col_expr(
                payment_dlq::Column::NextRetryAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(now))
            .filter(payment_dlq::Column::Status.eq(DlqStatus::Pending))
            .filter(payment_dlq::Column::CreatedAt.lt(created_before))
            .exec(self.conn)
            .await?;

        if result.rows_affected > 0 {
            warn!(
                count = result.rows_affected,
                retention_days = self.config.retention_days,
                "Expired DLQ entries moved to manual review"
            );
        }

        Ok(result.rows_affected)
    }

    /// Return entries stuck in `retrying` since before `claimed_before` to
    /// `pending`. Each release is fenced on the observed claim token.
    pub async fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64, DbErr> {
        let stale = payment_dlq::Entity::find()
            .filter(payment_dlq::Column::Status.eq(DlqStatus::Retrying))
            .filter(payment_dlq::Column::ClaimedAt.lt(claimed_before))
            .all(self.conn)
            .await?;

        let mut released = 0;
        for entry in stale {
            let Some(token) = entry.claim_token else {
                continue;
            };
            let now = self.clock.now();

            let result = payment_dlq::Entity::update_many()
                .col_expr(payment_dlq::Column::Status, Expr::value(DlqStatus::Pending))
                .col_expr(payment_dlq::Column::NextRetryAt, Expr::value(Some(now)))
                .col_expr(payment_dlq::Column::ClaimToken, Expr::value(Option::<Uuid>::None))
                .col_expr(
                    payment_dlq::Column::ClaimedAt,
                    Expr::value(Option::<DateTime<Utc>>::None),
                )
                .col_expr(payment_dlq::Column::UpdatedAt, Expr::value(now))
                .filter(payment_dlq::Column::Id.eq(entry.id))
                .filter(payment_dlq::Column::Status.eq(DlqStatus::Retrying))
                .filter(payment_dlq::Column::ClaimToken.eq(token))
                .exec(self.conn)
                .await?;

            if result.rows_affected > 0 {
                warn!(
                    dlq_id = entry.id,
                    tx_hash = %entry.tx_hash,
                    claimed_at = ?entry.claimed_at,
                    "Released stale DLQ claim"
                );
                released += 1;
            }
        }

        Ok(released)
    }

    /// Entries an operator has to look at, most urgent first.
    pub async fn needing_attention(&self, limit: u64) -> Result<Vec<payment_dlq::Model>, DbErr> {
        payment_dlq::Entity::find()
            .filter(
                Condition::any()
                    .add(payment_dlq::Column::RequiresAttention.eq(true))
                    .add(
                        payment_dlq::Column::Status
                            .is_in([DlqStatus::FailedPermanently, DlqStatus::ManualReview]),
                    ),
            )
            .filter(payment_dlq::Column::Status.ne(DlqStatus::Resolved))
            .order_by_desc(payment_dlq::Column::Priority)
            .order_by_asc(payment_dlq::Column::CreatedAt)
            .limit(limit)
            .all(self.conn)
            .await
    }

    /// Get DLQ statistics.
    pub async fn stats(&self) -> Result<DlqStats, DbErr> {
        let rows: Vec<(DlqStatus, bool, bool)> = payment_dlq::Entity::find()
            .select_only()
            .column(payment_dlq::Column::Status)
            .column(payment_dlq::Column::RequiresAttention)
            .column(payment_dlq::Column::HighValue)
            .into_tuple()
            .all(self.conn)
            .await?;

        let mut stats = DlqStats::default();
        for (status, requires_attention, high_value) in rows {
            *stats.by_status.entry(status).or_insert(0) += 1;
            if requires_attention {
                stats.requires_attention += 1;
            }
            if high_value && status != DlqStatus::Resolved {
                stats.high_value_open += 1;
            }
        }

        Ok(stats)
    }

    /// Number of entries in `status`.
    pub async fn count(&self, status: DlqStatus) -> Result<u64, DbErr> {
        payment_dlq::Entity::find()
            .filter(payment_dlq::Column::Status.eq(status))
            .count(self.conn)
            .await
    }

    async fn require(&self, id: i32) -> EngineResult<payment_dlq::Model> {
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("DLQ entry {id}")))
    }

    async fn transition_error(&self, id: i32, action: &str) -> EngineError {
        match self.get(id).await {
            Ok(Some(entry)) => EngineError::InvalidState(format!(
                "cannot {action} DLQ entry {id} in status {}",
                entry.status
            )),
            Ok(None) => EngineError::NotFound(format!("DLQ entry {id}")),
            Err(e) => e.into(),
        }
    }
}

fn entry_policy(entry: &payment_dlq::Model) -> RetryPolicy {
    RetryPolicy {
        max_attempts: entry.max_attempts.max(0) as u32,
        base_delay_ms: entry.base_delay_ms.max(0) as u64,
        backoff_multiplier: entry.backoff_multiplier,
    }
}

fn apply_decision(active: &mut payment_dlq::ActiveModel, decision: RetryDecision) -> RetryApplied {
    match decision {
        RetryDecision::Retry { next_retry_at, .. } => {
            active.status = Set(DlqStatus::Pending);
            active.next_retry_at = Set(Some(next_retry_at));
            RetryApplied::Rescheduled { next_retry_at }
        }
        RetryDecision::Exhausted => {
            active.status = Set(DlqStatus::FailedPermanently);
            active.next_retry_at = Set(None);
            active.requires_attention = Set(true);
            RetryApplied::Exhausted
        }
    }
}

/// Create a DlqService with a DatabaseConnection.
pub fn dlq_service<'a>(
    db: &'a DatabaseConnection,
    clock: &'a dyn Clock,
    config: &'a DlqConfig,
) -> DlqService<'a, DatabaseConnection> {
    DlqService::new(db, clock, config)
}
