use common::{
    DlqPriority, DlqStatus, ErrorCategory, FailureSource, PaymentPayload, ResolutionMethod,
    RetryRecord,
};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Payment confirmation that could not be reconciled, with its retry state.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_dlq")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Natural key of the chain event. One entry per hash.
    #[sea_orm(unique)]
    pub tx_hash: String,
    #[sea_orm(indexed)]
    pub user_id: i32,
    pub purchase_id: Option<i32>,
    #[sea_orm(column_type = "Decimal(Some((24, 8)))")]
    pub amount: Decimal,
    pub currency: String,
    pub network: String,
    pub token: String,
    pub expected_address: String,

    pub source: FailureSource,

    #[sea_orm(column_type = "Text")]
    pub error_message: String,
    pub error_code: String,
    pub error_category: ErrorCategory,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub error_detail: Option<serde_json::Value>,

    pub attempts: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTimeUtc>,
    pub backoff_multiplier: f64,
    pub base_delay_ms: i64,

    #[sea_orm(indexed)]
    pub status: DlqStatus,

    /// Append-only list of `RetryRecord`.
    #[sea_orm(column_type = "JsonBinary")]
    pub retry_history: serde_json::Value,

    pub resolved_at: Option<DateTimeUtc>,
    pub resolved_by: Option<String>,
    pub resolution_method: Option<ResolutionMethod>,
    #[sea_orm(column_type = "Text", nullable)]
    pub resolution_notes: Option<String>,
    pub final_transaction_id: Option<String>,

    pub priority: DlqPriority,
    #[sea_orm(default_value = false, indexed)]
    pub requires_attention: bool,
    pub high_value: bool,
    pub suspicious: bool,
    #[sea_orm(column_type = "Text", nullable)]
    pub escalation_reason: Option<String>,

    /// How many times a confirmation path reported this hash.
    pub report_count: i32,

    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    /// Eligible for the next automatic attempt at `now`.
    pub fn can_retry(&self, now: DateTimeUtc) -> bool {
        self.status == DlqStatus::Pending
            && self.attempts < self.max_attempts
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Older than the retention window.
    pub fn is_expired(&self, now: DateTimeUtc, retention: chrono::Duration) -> bool {
        now - self.created_at > retention
    }

    pub fn payload(&self) -> PaymentPayload {
        PaymentPayload {
            tx_hash: self.tx_hash.clone(),
            user_id: self.user_id,
            purchase_id: self.purchase_id,
            amount: self.amount,
            currency: self.currency.clone(),
            network: self.network.clone(),
            token: self.token.clone(),
            expected_address: self.expected_address.clone(),
        }
    }

    /// Attempts recorded so far, oldest first.
    pub fn history(&self) -> Result<Vec<RetryRecord>, DbErr> {
        serde_json::from_value(self.retry_history.clone()).map_err(|e| {
            DbErr::Json(format!("malformed retry_history on dlq entry {}: {e}", self.id))
        })
    }
}

impl ActiveModelBehavior for ActiveModel {}
