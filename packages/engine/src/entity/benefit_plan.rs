use common::PlanStatus;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Payout plan attached to one confirmed purchase.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "benefit_plan")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(indexed)]
    pub user_id: i32,

    /// At most one plan per purchase.
    #[sea_orm(unique)]
    pub purchase_id: i32,

    pub package_id: i32,

    #[sea_orm(indexed)]
    pub status: PlanStatus,

    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub principal: Decimal,
    pub currency: String,
    pub cycles_total: i32,
    pub days_per_cycle: i32,
    pub pause_days: i32,
    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub daily_rate: Decimal,
    /// Total payout as a multiple of principal.
    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub total_potential: Decimal,

    pub starts_at: DateTimeUtc,
    pub ends_at: DateTimeUtc,

    /// Earliest `scheduled_at` among pending items, NULL when none remain.
    pub next_run_at: Option<DateTimeUtc>,

    pub total_executed: i32,
    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub total_amount: Decimal,
    pub total_failed: i32,
    pub last_execution_at: Option<DateTimeUtc>,

    pub paused_at: Option<DateTimeUtc>,
    /// Operator reason for the last pause or cancel.
    #[sea_orm(column_type = "Text", nullable)]
    pub status_reason: Option<String>,
    pub completed_at: Option<DateTimeUtc>,
    pub cancelled_at: Option<DateTimeUtc>,

    #[sea_orm(has_many)]
    pub items: HasMany<super::benefit_schedule_item::Entity>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
