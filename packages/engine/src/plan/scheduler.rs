use std::sync::Arc;

use common::{Clock, SchedulerConfig};
use sea_orm::{DatabaseConnection, DbErr};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entity::benefit_schedule_item::ItemError;
use crate::entity::{benefit_plan, benefit_schedule_item};
use crate::ledger::{CreditRequest, Ledger, LedgerError};

use super::service::{ItemCompletion, PlanService};

/// Counters from one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due_plans: usize,
    pub executed: usize,
    pub failed: usize,
    /// Plans with nothing runnable, a lost claim or a fenced completion.
    pub skipped: usize,
    /// Plans whose processing hit a storage error.
    pub errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.due_plans == 0 && self.errors == 0
    }
}

/// What happened to a plan during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRun {
    Executed {
        item_id: i32,
        transaction_id: Uuid,
    },
    Failed {
        item_id: i32,
        code: String,
    },
    NothingDue,
    /// Another tick claimed the item first.
    ClaimLost,
    /// The claim was swept and re-issued before this run finished.
    Fenced,
}

/// Executes due schedule items, at most one per plan per tick.
pub struct BenefitScheduler {
    db: DatabaseConnection,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl BenefitScheduler {
    pub fn new(
        db: DatabaseConnection,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            ledger,
            clock,
            config,
        }
    }

    pub fn plans(&self) -> PlanService<'_, DatabaseConnection> {
        PlanService::new(&self.db, self.clock.as_ref())
    }

    /// Run every due plan once. One plan's failure never stops the others.
    pub async fn tick(&self) -> Result<TickReport, DbErr> {
        let now = self.clock.now();
        let due = self.plans().due_plans(now, self.config.batch_size).await?;

        let mut report = TickReport {
            due_plans: due.len(),
            ..Default::default()
        };

        for plan in due {
            match self.run_plan(&plan).await {
                Ok(ItemRun::Executed { .. }) => report.executed += 1,
                Ok(ItemRun::Failed { .. }) => report.failed += 1,
                Ok(ItemRun::NothingDue | ItemRun::ClaimLost | ItemRun::Fenced) => {
                    report.skipped += 1
                }
                Err(e) => {
                    error!(plan_id = plan.id, error = %e, "Failed to run benefit plan");
                    report.errors += 1;
                }
            }
        }

        if !report.is_idle() {
            info!(
                due_plans = report.due_plans,
                executed = report.executed,
                failed = report.failed,
                skipped = report.skipped,
                errors = report.errors,
                "Scheduler tick finished"
            );
        }

        Ok(report)
    }

    /// Claim and pay the earliest due item of `plan`.
    pub async fn run_plan(&self, plan: &benefit_plan::Model) -> Result<ItemRun, DbErr> {
        let service = self.plans();
        let now = self.clock.now();

        let Some(item) = service.earliest_due_item(plan.id, now).await? else {
            return Ok(ItemRun::NothingDue);
        };

        let token = Uuid::new_v4();
        if !service.claim_item(&item, token).await? {
            debug!(plan_id = plan.id, item_id = item.id, "Schedule item already claimed");
            return Ok(ItemRun::ClaimLost);
        }

        let credited = match item.transaction_id {
            Some(transaction_id) => Ok(transaction_id),
            None => self.credit(plan, &item).await,
        };

        match credited {
            Ok(transaction_id) => match service.complete_item(&item, token, transaction_id).await? {
                ItemCompletion::Applied(updated) => {
                    info!(
                        plan_id = plan.id,
                        item_id = item.id,
                        day_index = item.day_index,
                        amount = %item.amount,
                        transaction_id = %transaction_id,
                        plan_status = %updated.status,
                        "Executed benefit payout"
                    );
                    Ok(ItemRun::Executed {
                        item_id: item.id,
                        transaction_id,
                    })
                }
                ItemCompletion::Fenced => {
                    warn!(
                        plan_id = plan.id,
                        item_id = item.id,
                        "Completion fenced, item was reclaimed"
                    );
                    Ok(ItemRun::Fenced)
                }
            },
            Err(e) => {
                let requeue = self.config.retry_failed_items
                    && item.retry_count < self.config.max_item_retries as i32;
                let item_error = ItemError {
                    message: e.to_string(),
                    code: e.code().to_string(),
                    timestamp: self.clock.now(),
                };

                match service.fail_item(&item, token, &item_error, requeue).await? {
                    ItemCompletion::Applied(_) => {
                        error!(
                            plan_id = plan.id,
                            item_id = item.id,
                            day_index = item.day_index,
                            code = %item_error.code,
                            error = %e,
                            requeued = requeue,
                            "Benefit payout failed"
                        );
                        Ok(ItemRun::Failed {
                            item_id: item.id,
                            code: item_error.code,
                        })
                    }
                    ItemCompletion::Fenced => {
                        warn!(
                            plan_id = plan.id,
                            item_id = item.id,
                            "Failure record fenced, item was reclaimed"
                        );
                        Ok(ItemRun::Fenced)
                    }
                }
            }
        }
    }

    async fn credit(
        &self,
        plan: &benefit_plan::Model,
        item: &benefit_schedule_item::Model,
    ) -> Result<Uuid, LedgerError> {
        let request = CreditRequest {
            user_id: plan.user_id,
            amount: item.amount,
            currency: plan.currency.clone(),
            reason: format!(
                "Benefit payout: plan {} day {} (cycle {})",
                plan.id,
                item.day_index + 1,
                item.cycle_number
            ),
            reference: item.ledger_reference(),
        };

        match tokio::time::timeout(self.config.execution_timeout(), self.ledger.credit(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout),
        }
    }

    /// Requeue items left in `processing` past the stale-claim timeout.
    pub async fn sweep_stale_claims(&self) -> Result<u64, DbErr> {
        let claimed_before = self.clock.now() - self.config.stale_claim_timeout();
        self.plans().release_stale_items(claimed_before).await
    }

    /// Spawn the periodic loop. Each round sweeps stale claims, then ticks.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                tick_interval_secs = self.config.tick_interval_secs,
                batch_size = self.config.batch_size,
                retry_failed_items = self.config.retry_failed_items,
                "Starting benefit scheduler"
            );

            let mut interval = tokio::time::interval(self.config.tick_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.sweep_stale_claims().await {
                    error!(error = %e, "Stale schedule item sweep failed");
                }
                if let Err(e) = self.tick().await {
                    error!(error = %e, "Scheduler tick failed");
                }
            }

            info!("Benefit scheduler stopped");
        })
    }
}
