use sea_orm::sea_query::{Index, IndexCreateStatement, PostgresQueryBuilder};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr};
use tracing::{info, warn};

use crate::entity::{benefit_plan, benefit_schedule_item, payment_dlq};

/// Ensure required database indexes exist.
///
/// SeaORM's schema-sync doesn't support composite indexes,
/// so we create them manually on startup.
pub async fn ensure_indexes(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Scheduler tick: active plans whose next_run_at <= now
    create(
        db,
        "idx_benefit_plan_status_next_run",
        Index::create()
            .if_not_exists()
            .name("idx_benefit_plan_status_next_run")
            .table(benefit_plan::Entity)
            .col(benefit_plan::Column::Status)
            .col(benefit_plan::Column::NextRunAt)
            .to_owned(),
    )
    .await;

    // Earliest pending item of a plan
    create(
        db,
        "idx_schedule_item_plan_status_scheduled",
        Index::create()
            .if_not_exists()
            .name("idx_schedule_item_plan_status_scheduled")
            .table(benefit_schedule_item::Entity)
            .col(benefit_schedule_item::Column::PlanId)
            .col(benefit_schedule_item::Column::Status)
            .col(benefit_schedule_item::Column::ScheduledAt)
            .to_owned(),
    )
    .await;

    // Reconciliation tick: pending entries whose next_retry_at <= now
    create(
        db,
        "idx_payment_dlq_status_next_retry",
        Index::create()
            .if_not_exists()
            .name("idx_payment_dlq_status_next_retry")
            .table(payment_dlq::Entity)
            .col(payment_dlq::Column::Status)
            .col(payment_dlq::Column::NextRetryAt)
            .to_owned(),
    )
    .await;

    create(
        db,
        "idx_payment_dlq_status_priority_created",
        Index::create()
            .if_not_exists()
            .name("idx_payment_dlq_status_priority_created")
            .table(payment_dlq::Entity)
            .col(payment_dlq::Column::Status)
            .col(payment_dlq::Column::Priority)
            .col(payment_dlq::Column::CreatedAt)
            .to_owned(),
    )
    .await;

    // One row per payout day. Failure here is fatal.
    let stmt = Index::create()
        .if_not_exists()
        .unique()
        .name("uq_schedule_item_plan_day")
        .table(benefit_schedule_item::Entity)
        .col(benefit_schedule_item::Column::PlanId)
        .col(benefit_schedule_item::Column::DayIndex)
        .to_string(PostgresQueryBuilder);
    db.execute_unprepared(&stmt).await?;
    info!("Ensured index uq_schedule_item_plan_day exists");

    Ok(())
}

async fn create(db: &DatabaseConnection, name: &str, index: IndexCreateStatement) {
    let stmt = index.to_string(PostgresQueryBuilder);

    match db.execute_unprepared(&stmt).await {
        Ok(_) => info!("Ensured index {} exists", name),
        Err(e) => warn!("Failed to create index {}: {}", name, e),
    }
}
