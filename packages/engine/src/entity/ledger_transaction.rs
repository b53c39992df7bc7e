use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only balance movement. `reference` makes every write idempotent.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_transaction")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(indexed)]
    pub user_id: i32,

    /// `credit` or `debit`.
    pub kind: String,

    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub amount: Decimal,
    pub currency: String,

    #[sea_orm(column_type = "Text")]
    pub reason: String,

    #[sea_orm(unique)]
    pub reference: String,

    pub created_at: DateTimeUtc,
}

impl ActiveModelBehavior for ActiveModel {}
