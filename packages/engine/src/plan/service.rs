use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use common::{Clock, ItemStatus, PlanStatus, ScheduleParams, build_schedule};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, TransactionSession, TransactionTrait,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::entity::benefit_schedule_item::ItemError;
use crate::entity::{benefit_plan, benefit_schedule_item};
use crate::error::{EngineError, EngineResult};

/// Confirmed purchase, as supplied by the purchase flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRecord {
    pub purchase_id: i32,
    pub user_id: i32,
    pub amount: Decimal,
    pub currency: String,
    pub confirmed_at: DateTime<Utc>,
}

/// Payout parameters of the purchased package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageConfig {
    pub package_id: i32,
    pub daily_rate: Decimal,
    pub cycles_total: u32,
    pub days_per_cycle: u32,
    pub pause_days: u32,
}

/// Result of finishing a claimed item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemCompletion {
    /// The item was updated; carries the plan after the update.
    Applied(benefit_plan::Model),
    /// The claim token no longer matches. Someone else owns the item now.
    Fenced,
}

/// A plan an operator should look at.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanAttention {
    pub plan: benefit_plan::Model,
    pub failed_items: u64,
    /// Items in `processing` since before the staleness threshold.
    pub stale_items: u64,
}

/// Changes applied to plan counters together with a progress refresh.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlanDelta {
    pub executed: i32,
    pub amount: Decimal,
    pub failed: i32,
    pub executed_at: Option<DateTime<Utc>>,
}

pub struct PlanService<'a, C: ConnectionTrait + TransactionTrait> {
    conn: &'a C,
    clock: &'a dyn Clock,
}

impl<'a, C: ConnectionTrait + TransactionTrait> PlanService<'a, C> {
    pub fn new(conn: &'a C, clock: &'a dyn Clock) -> Self {
        Self { conn, clock }
    }

    /// Create the plan and its full schedule for a confirmed purchase.
    ///
    /// Invalid parameters are rejected before anything is written. A second call
    /// for the same purchase returns the plan created by the first.
    pub async fn create_plan(
        &self,
        purchase: &PurchaseRecord,
        package: &PackageConfig,
        start_grace: Duration,
    ) -> EngineResult<benefit_plan::Model> {
        let now = self.clock.now();
        let params = ScheduleParams {
            principal: purchase.amount,
            daily_rate: package.daily_rate,
            cycles_total: package.cycles_total,
            days_per_cycle: package.days_per_cycle,
            pause_days: package.pause_days,
            start_date: purchase.confirmed_at,
        };
        let schedule = build_schedule(&params, now, start_grace)?;

        if let Some(existing) = self.find_by_purchase(purchase.purchase_id).await? {
            warn!(
                purchase_id = purchase.purchase_id,
                plan_id = existing.id,
                "Plan already exists for purchase"
            );
            return Ok(existing);
        }

        let txn = self.conn.begin().await?;

        let plan = benefit_plan::ActiveModel {
            user_id: Set(purchase.user_id),
            purchase_id: Set(purchase.purchase_id),
            package_id: Set(package.package_id),
            status: Set(PlanStatus::Active),
            principal: Set(purchase.amount),
            currency: Set(purchase.currency.clone()),
            cycles_total: Set(package.cycles_total as i32),
            days_per_cycle: Set(package.days_per_cycle as i32),
            pause_days: Set(package.pause_days as i32),
            daily_rate: Set(package.daily_rate),
            total_potential: Set(schedule.total_potential),
            starts_at: Set(purchase.confirmed_at),
            ends_at: Set(schedule.ends_at),
            next_run_at: Set(schedule.items.first().map(|i| i.scheduled_at)),
            total_executed: Set(0),
            total_amount: Set(Decimal::ZERO),
            total_failed: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let plan = match plan.insert(&txn).await {
            Ok(plan) => plan,
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await?;
                return self
                    .find_by_purchase(purchase.purchase_id)
                    .await?
                    .ok_or_else(|| {
                        DbErr::Custom(
                            "UniqueConstraintViolation but existing plan not found".to_string(),
                        )
                        .into()
                    });
            }
            Err(e) => return Err(e.into()),
        };

        let items: Vec<benefit_schedule_item::ActiveModel> = schedule
            .items
            .iter()
            .map(|p| benefit_schedule_item::ActiveModel {
                plan_id: Set(plan.id),
                day_index: Set(p.day_index as i32),
                cycle_number: Set(p.cycle_number as i32),
                percent: Set(p.percent),
                amount: Set(p.amount),
                status: Set(ItemStatus::Pending),
                scheduled_at: Set(p.scheduled_at),
                retry_count: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            })
            .collect();
        let item_count = items.len();

        benefit_schedule_item::Entity::insert_many(items)
            .exec(&txn)
            .await?;
        txn.commit().await?;

        info!(
            plan_id = plan.id,
            purchase_id = plan.purchase_id,
            user_id = plan.user_id,
            items = item_count,
            total_amount = %schedule.total_amount,
            "Created benefit plan"
        );

        Ok(plan)
    }

    pub async fn get(&self, plan_id: i32) -> Result<Option<benefit_plan::Model>, DbErr> {
        benefit_plan::Entity::find_by_id(plan_id).one(self.conn).await
    }

    pub async fn find_by_purchase(
        &self,
        purchase_id: i32,
    ) -> Result<Option<benefit_plan::Model>, DbErr> {
        benefit_plan::Entity::find()
            .filter(benefit_plan::Column::PurchaseId.eq(purchase_id))
            .one(self.conn)
            .await
    }

    /// All items of a plan in day order.
    pub async fn items(&self, plan_id: i32) -> Result<Vec<benefit_schedule_item::Model>, DbErr> {
        benefit_schedule_item::Entity::find()
            .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
            .order_by_asc(benefit_schedule_item::Column::DayIndex)
            .all(self.conn)
            .await
    }

    /// Active plans with an item due at or before `now`.
    pub async fn due_plans(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<benefit_plan::Model>, DbErr> {
        benefit_plan::Entity::find()
            .filter(benefit_plan::Column::Status.eq(PlanStatus::Active))
            .filter(benefit_plan::Column::NextRunAt.lte(now))
            .order_by_asc(benefit_plan::Column::NextRunAt)
            .limit(limit)
            .all(self.conn)
            .await
    }

    /// Earliest pending item of a plan whose time has come.
    pub async fn earliest_due_item(
        &self,
        plan_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<benefit_schedule_item::Model>, DbErr> {
        benefit_schedule_item::Entity::find()
            .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Pending))
            .filter(benefit_schedule_item::Column::ScheduledAt.lte(now))
            .order_by_asc(benefit_schedule_item::Column::ScheduledAt)
            .order_by_asc(benefit_schedule_item::Column::DayIndex)
            .one(self.conn)
            .await
    }

    /// Move an item from `pending` to `processing` under `token`.
    ///
    /// Returns `false` when the item was no longer pending or another item of
    /// the same plan is still in flight. Items of one plan run strictly in day
    /// order, one at a time.
    pub async fn claim_item(
        &self,
        item: &benefit_schedule_item::Model,
        token: Uuid,
    ) -> Result<bool, DbErr> {
        let now = self.clock.now();
        let txn = self.conn.begin().await?;

        let claimed = benefit_schedule_item::Entity::update_many()
            .col_expr(
                benefit_schedule_item::Column::Status,
                Expr::value(ItemStatus::Processing),
            )
            .col_expr(benefit_schedule_item::Column::ClaimToken, Expr::value(Some(token)))
            .col_expr(benefit_schedule_item::Column::ClaimedAt, Expr::value(Some(now)))
            .col_expr(benefit_schedule_item::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_schedule_item::Column::Id.eq(item.id))
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Pending))
            .filter(Expr::cust(format!(
                "NOT EXISTS (SELECT 1 FROM benefit_schedule_item AS sibling \
                 WHERE sibling.plan_id = {} AND sibling.status = 'processing')",
                item.plan_id
            )))
            .exec(&txn)
            .await?;

        if claimed.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        refresh_progress(&txn, item.plan_id, now, PlanDelta::default()).await?;
        txn.commit().await?;
        Ok(true)
    }

    /// Mark a claimed item `done` and account for it on the plan.
    pub async fn complete_item(
        &self,
        item: &benefit_schedule_item::Model,
        token: Uuid,
        transaction_id: Uuid,
    ) -> Result<ItemCompletion, DbErr> {
        let now = self.clock.now();
        let txn = self.conn.begin().await?;

        let updated = benefit_schedule_item::Entity::update_many()
            .col_expr(
                benefit_schedule_item::Column::Status,
                Expr::value(ItemStatus::Done),
            )
            .col_expr(benefit_schedule_item::Column::ExecutedAt, Expr::value(Some(now)))
            .col_expr(
                benefit_schedule_item::Column::TransactionId,
                Expr::value(Some(transaction_id)),
            )
            .col_expr(
                benefit_schedule_item::Column::ClaimToken,
                Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                benefit_schedule_item::Column::ClaimedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(benefit_schedule_item::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_schedule_item::Column::Id.eq(item.id))
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Processing))
            .filter(benefit_schedule_item::Column::ClaimToken.eq(token))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(ItemCompletion::Fenced);
        }

        let delta = PlanDelta {
            executed: 1,
            amount: item.amount,
            executed_at: Some(now),
            ..Default::default()
        };
        let plan = refresh_progress(&txn, item.plan_id, now, delta).await?;
        txn.commit().await?;

        Ok(ItemCompletion::Applied(plan))
    }

    /// Record a payout failure on a claimed item.
    ///
    /// With `requeue` the item goes back to `pending` for a later tick, otherwise
    /// it stays `failed` until an operator requeues it.
    pub async fn fail_item(
        &self,
        item: &benefit_schedule_item::Model,
        token: Uuid,
        error: &ItemError,
        requeue: bool,
    ) -> Result<ItemCompletion, DbErr> {
        let now = self.clock.now();
        let status = if requeue {
            ItemStatus::Pending
        } else {
            ItemStatus::Failed
        };
        let error_json = serde_json::to_value(error).map_err(|e| DbErr::Json(e.to_string()))?;

        let txn = self.conn.begin().await?;

        let updated = benefit_schedule_item::Entity::update_many()
            .col_expr(benefit_schedule_item::Column::Status, Expr::value(status))
            .col_expr(
                benefit_schedule_item::Column::LastError,
                Expr::value(Some(error_json)),
            )
            .col_expr(
                benefit_schedule_item::Column::RetryCount,
                Expr::value(item.retry_count + 1),
            )
            .col_expr(
                benefit_schedule_item::Column::ClaimToken,
                Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                benefit_schedule_item::Column::ClaimedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(benefit_schedule_item::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_schedule_item::Column::Id.eq(item.id))
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Processing))
            .filter(benefit_schedule_item::Column::ClaimToken.eq(token))
            .exec(&txn)
            .await?;

        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(ItemCompletion::Fenced);
        }

        let delta = PlanDelta {
            failed: 1,
            ..Default::default()
        };
        let plan = refresh_progress(&txn, item.plan_id, now, delta).await?;
        txn.commit().await?;

        Ok(ItemCompletion::Applied(plan))
    }

    /// Requeue items stuck in `processing` since before `claimed_before`.
    ///
    /// Each release is conditional on the claim token observed here, so a claim
    /// that completes concurrently is left alone.
    pub async fn release_stale_items(&self, claimed_before: DateTime<Utc>) -> Result<u64, DbErr> {
        let stale = benefit_schedule_item::Entity::find()
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Processing))
            .filter(benefit_schedule_item::Column::ClaimedAt.lt(claimed_before))
            .all(self.conn)
            .await?;

        let mut released = 0;
        for item in stale {
            let Some(token) = item.claim_token else {
                continue;
            };
            let now = self.clock.now();
            let txn = self.conn.begin().await?;

            let result = benefit_schedule_item::Entity::update_many()
                .col_expr(
                    benefit_schedule_item::Column::Status,
                    Expr::value(ItemStatus::Pending),
                )
                .col_expr(
                    benefit_schedule_item::Column::ClaimToken,
                    Expr::value(Option::<Uuid>::None),
                )
                .col_expr(
                    benefit_schedule_item::Column::ClaimedAt,
                    Expr::value(Option::<DateTime<Utc>>::None),
                )
                .col_expr(benefit_schedule_item::Column::UpdatedAt, Expr::value(now))
                .filter(benefit_schedule_item::Column::Id.eq(item.id))
                .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Processing))
                .filter(benefit_schedule_item::Column::ClaimToken.eq(token))
                .exec(&txn)
                .await?;

            if result.rows_affected == 0 {
                txn.rollback().await?;
                continue;
            }

            refresh_progress(&txn, item.plan_id, now, PlanDelta::default()).await?;
            txn.commit().await?;

            warn!(
                plan_id = item.plan_id,
                item_id = item.id,
                day_index = item.day_index,
                claimed_at = ?item.claimed_at,
                "Requeued stale schedule item"
            );
            released += 1;
        }

        Ok(released)
    }

    /// Stop executing a plan until [`resume`](Self::resume).
    pub async fn pause(&self, plan_id: i32, reason: &str) -> EngineResult<benefit_plan::Model> {
        let now = self.clock.now();

        let result = benefit_plan::Entity::update_many()
            .col_expr(benefit_plan::Column::Status, Expr::value(PlanStatus::Paused))
            .col_expr(benefit_plan::Column::PausedAt, Expr::value(Some(now)))
            .col_expr(
                benefit_plan::Column::StatusReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(benefit_plan::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_plan::Column::Id.eq(plan_id))
            .filter(benefit_plan::Column::Status.eq(PlanStatus::Active))
            .exec(self.conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(self.transition_error(plan_id, "pause").await);
        }

        info!(plan_id, reason, "Paused benefit plan");
        self.require(plan_id).await
    }

    /// Make a paused plan eligible again and point `next_run_at` at its next
    /// pending item.
    pub async fn resume(&self, plan_id: i32) -> EngineResult<benefit_plan::Model> {
        let now = self.clock.now();
        let txn = self.conn.begin().await?;

        let result = benefit_plan::Entity::update_many()
            .col_expr(benefit_plan::Column::Status, Expr::value(PlanStatus::Active))
            .col_expr(
                benefit_plan::Column::PausedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(
                benefit_plan::Column::StatusReason,
                Expr::value(Option::<String>::None),
            )
            .col_expr(benefit_plan::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_plan::Column::Id.eq(plan_id))
            .filter(benefit_plan::Column::Status.eq(PlanStatus::Paused))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(self.transition_error(plan_id, "resume").await);
        }

        let plan = refresh_progress(&txn, plan_id, now, PlanDelta::default()).await?;
        txn.commit().await?;

        info!(plan_id, next_run_at = ?plan.next_run_at, "Resumed benefit plan");
        Ok(plan)
    }

    /// Terminate a plan. Pending items become `skipped`; in-flight items finish.
    pub async fn cancel(&self, plan_id: i32, reason: &str) -> EngineResult<benefit_plan::Model> {
        let now = self.clock.now();
        let cancellable = [PlanStatus::Active, PlanStatus::Paused, PlanStatus::Failed];

        let plan = self.require(plan_id).await?;
        if !cancellable.contains(&plan.status) {
            return Err(EngineError::InvalidState(format!(
                "cannot cancel plan {plan_id} in status {}",
                plan.status
            )));
        }

        let txn = self.conn.begin().await?;

        let skipped = benefit_schedule_item::Entity::update_many()
            .col_expr(
                benefit_schedule_item::Column::Status,
                Expr::value(ItemStatus::Skipped),
            )
            .col_expr(benefit_schedule_item::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Pending))
            .exec(&txn)
            .await?;

        let result = benefit_plan::Entity::update_many()
            .col_expr(benefit_plan::Column::Status, Expr::value(PlanStatus::Cancelled))
            .col_expr(benefit_plan::Column::CancelledAt, Expr::value(Some(now)))
            .col_expr(
                benefit_plan::Column::NextRunAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(
                benefit_plan::Column::StatusReason,
                Expr::value(Some(reason.to_string())),
            )
            .col_expr(benefit_plan::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_plan::Column::Id.eq(plan_id))
            .filter(benefit_plan::Column::Status.is_in(cancellable))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            txn.rollback().await?;
            return Err(self.transition_error(plan_id, "cancel").await);
        }

        txn.commit().await?;

        info!(
            plan_id,
            reason,
            skipped_items = skipped.rows_affected,
            "Cancelled benefit plan"
        );
        self.require(plan_id).await
    }

    /// Operator recovery: put every `failed` item back to `pending` and
    /// re-activate a `failed` plan. Returns the number of items requeued.
    pub async fn requeue_failed_items(&self, plan_id: i32) -> EngineResult<u64> {
        let now = self.clock.now();
        let plan = self.require(plan_id).await?;
        if plan.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "cannot requeue items of plan {plan_id} in status {}",
                plan.status
            )));
        }

        let txn = self.conn.begin().await?;

        let requeued = benefit_schedule_item::Entity::update_many()
            .col_expr(
                benefit_schedule_item::Column::Status,
                Expr::value(ItemStatus::Pending),
            )
            .col_expr(benefit_schedule_item::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
            .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Failed))
            .exec(&txn)
            .await?;

        benefit_plan::Entity::update_many()
            .col_expr(benefit_plan::Column::Status, Expr::value(PlanStatus::Active))
            .col_expr(benefit_plan::Column::UpdatedAt, Expr::value(now))
            .filter(benefit_plan::Column::Id.eq(plan_id))
            .filter(benefit_plan::Column::Status.eq(PlanStatus::Failed))
            .exec(&txn)
            .await?;

        refresh_progress(&txn, plan_id, now, PlanDelta::default()).await?;
        txn.commit().await?;

        info!(plan_id, requeued = requeued.rows_affected, "Requeued failed schedule items");
        Ok(requeued.rows_affected)
    }

    /// Plans that are `failed`, hold failed items, or hold items stuck in
    /// `processing` since before `stale_before`.
    pub async fn needing_attention(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<PlanAttention>, DbErr> {
        let flagged: Vec<(i32, ItemStatus, Option<DateTime<Utc>>)> =
            benefit_schedule_item::Entity::find()
                .select_only()
                .column(benefit_schedule_item::Column::PlanId)
                .column(benefit_schedule_item::Column::Status)
                .column(benefit_schedule_item::Column::ClaimedAt)
                .filter(
                    benefit_schedule_item::Column::Status
                        .is_in([ItemStatus::Failed, ItemStatus::Processing]),
                )
                .into_tuple()
                .all(self.conn)
                .await?;

        let mut counts: BTreeMap<i32, (u64, u64)> = BTreeMap::new();
        for (plan_id, status, claimed_at) in flagged {
            match status {
                ItemStatus::Failed => counts.entry(plan_id).or_default().0 += 1,
                ItemStatus::Processing if claimed_at.is_some_and(|at| at < stale_before) => {
                    counts.entry(plan_id).or_default().1 += 1
                }
                _ => {}
            }
        }

        let failed_plans = benefit_plan::Entity::find()
            .select_only()
            .column(benefit_plan::Column::Id)
            .filter(benefit_plan::Column::Status.eq(PlanStatus::Failed))
            .into_tuple::<i32>()
            .all(self.conn)
            .await?;
        for plan_id in failed_plans {
            counts.entry(plan_id).or_default();
        }

        if counts.is_empty() {
            return Ok(Vec::new());
        }

        let plans = benefit_plan::Entity::find()
            .filter(benefit_plan::Column::Id.is_in(counts.keys().copied().collect::<Vec<_>>()))
            .order_by_asc(benefit_plan::Column::Id)
            .all(self.conn)
            .await?;

        Ok(plans
            .into_iter()
            .map(|plan| {
                let (failed_items, stale_items) = counts.get(&plan.id).copied().unwrap_or_default();
                PlanAttention {
                    plan,
                    failed_items,
                    stale_items,
                }
            })
            .collect())
    }

    async fn require(&self, plan_id: i32) -> EngineResult<benefit_plan::Model> {
        self.get(plan_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("plan {plan_id}")))
    }

    async fn transition_error(&self, plan_id: i32, action: &str) -> EngineError {
        match self.get(plan_id).await {
            Ok(Some(plan)) => EngineError::InvalidState(format!(
                "cannot {action} plan {plan_id} in status {}",
                plan.status
            )),
            Ok(None) => EngineError::NotFound(format!("plan {plan_id}")),
            Err(e) => e.into(),
        }
    }
}

/// Apply `delta` to a plan's counters and recompute `next_run_at` and status
/// from its items. Locks the plan row for the rest of the transaction.
pub(crate) async fn refresh_progress<C: ConnectionTrait>(
    conn: &C,
    plan_id: i32,
    now: DateTime<Utc>,
    delta: PlanDelta,
) -> Result<benefit_plan::Model, DbErr> {
    let plan = benefit_plan::Entity::find_by_id(plan_id)
        .lock(LockType::Update)
        .one(conn)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("benefit_plan {plan_id}")))?;

    let next_pending = benefit_schedule_item::Entity::find()
        .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
        .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Pending))
        .order_by_asc(benefit_schedule_item::Column::ScheduledAt)
        .one(conn)
        .await?;

    let not_done = benefit_schedule_item::Entity::find()
        .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
        .filter(benefit_schedule_item::Column::Status.ne(ItemStatus::Done))
        .count(conn)
        .await?;

    let in_flight = benefit_schedule_item::Entity::find()
        .filter(benefit_schedule_item::Column::PlanId.eq(plan_id))
        .filter(benefit_schedule_item::Column::Status.eq(ItemStatus::Processing))
        .count(conn)
        .await?;

    let next_run_at = next_pending.map(|item| item.scheduled_at);

    let mut active: benefit_plan::ActiveModel = plan.clone().into();
    active.next_run_at = Set(next_run_at);
    active.updated_at = Set(now);

    if delta.executed != 0 || delta.failed != 0 {
        active.total_executed = Set(plan.total_executed + delta.executed);
        active.total_amount = Set(plan.total_amount + delta.amount);
        active.total_failed = Set(plan.total_failed + delta.failed);
    }
    if let Some(at) = delta.executed_at {
        active.last_execution_at = Set(Some(at));
    }

    if not_done == 0 && plan.status != PlanStatus::Cancelled {
        active.status = Set(PlanStatus::Completed);
        if plan.completed_at.is_none() {
            active.completed_at = Set(Some(now));
        }
    } else if plan.status == PlanStatus::Active && next_run_at.is_none() && in_flight == 0 {
        // Nothing left to run, yet not everything is done: some items failed.
        active.status = Set(PlanStatus::Failed);
    }

    let updated = active.update(conn).await?;

    if updated.status != plan.status {
        info!(
            plan_id,
            from = %plan.status,
            to = %updated.status,
            "Benefit plan status changed"
        );
    }

    Ok(updated)
}
