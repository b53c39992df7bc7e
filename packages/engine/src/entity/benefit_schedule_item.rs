use common::ItemStatus;
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Error recorded on a schedule item whose payout failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub message: String,
    pub code: String,
    pub timestamp: DateTimeUtc,
}

/// One payout day of a benefit plan. Unique on `(plan_id, day_index)`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "benefit_schedule_item")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub plan_id: i32,
    #[sea_orm(belongs_to, from = "plan_id", to = "id")]
    pub plan: HasOne<super::benefit_plan::Entity>,

    pub day_index: i32,
    pub cycle_number: i32,
    /// Percent of principal paid on this day.
    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub percent: Decimal,
    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub amount: Decimal,

    #[sea_orm(indexed)]
    pub status: ItemStatus,

    pub scheduled_at: DateTimeUtc,
    pub executed_at: Option<DateTimeUtc>,

    /// Ledger transaction that paid this item.
    pub transaction_id: Option<Uuid>,

    /// Last failure as `{message, code, timestamp}`.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_error: Option<serde_json::Value>,
    pub retry_count: i32,

    /// Fencing token of the current claim; completions must present it.
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Reference used for the ledger credit, stable across re-claims.
    pub fn ledger_reference(&self) -> String {
        format!("benefit:{}:{}", self.plan_id, self.day_index)
    }

    pub fn error(&self) -> Option<ItemError> {
        self.last_error
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl ActiveModelBehavior for ActiveModel {}
