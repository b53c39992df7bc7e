#[cfg(feature = "sea-orm")]
use sea_orm::prelude::StringLen;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Status of a payment dead letter queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for its next retry time.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "pending"))]
    Pending,
    /// Claimed by a reconciliation worker.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "retrying"))]
    Retrying,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "resolved"))]
    Resolved,
    /// Retries exhausted. Only an operator can reopen it.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "failed_permanently"))]
    FailedPermanently,
    /// Parked for a human, no automatic retries.
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "manual_review"))]
    ManualReview,
}

impl DlqStatus {
    /// Statuses the reconciliation worker never touches again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::FailedPermanently)
    }

    pub const ALL: &'static [DlqStatus] = &[
        Self::Pending,
        Self::Retrying,
        Self::Resolved,
        Self::FailedPermanently,
        Self::ManualReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::FailedPermanently => "failed_permanently",
            Self::ManualReview => "manual_review",
        }
    }
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry ordering band. Stored as an integer so it sorts.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "i32", db_type = "Integer")
)]
#[serde(rename_all = "snake_case")]
pub enum DlqPriority {
    #[cfg_attr(feature = "sea-orm", sea_orm(num_value = 0))]
    Low,
    #[default]
    #[cfg_attr(feature = "sea-orm", sea_orm(num_value = 1))]
    Normal,
    #[cfg_attr(feature = "sea-orm", sea_orm(num_value = 2))]
    High,
    #[cfg_attr(feature = "sea-orm", sea_orm(num_value = 3))]
    Critical,
}

/// How an entry reached `resolved`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "auto_retry"))]
    AutoRetry,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "manual_fix"))]
    ManualFix,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "admin_override"))]
    AdminOverride,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "cancelled"))]
    Cancelled,
}

/// Result of a single reconciliation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Payment confirmation path that reported the failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "sea-orm",
    derive(sea_orm::DeriveActiveEnum, sea_orm::EnumIter),
    sea_orm(rs_type = "String", db_type = "String(StringLen::None)")
)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "webhook"))]
    Webhook,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "manual_verification"))]
    ManualVerification,
    #[cfg_attr(feature = "sea-orm", sea_orm(string_value = "scheduled_check"))]
    ScheduledCheck,
}

/// The payment confirmation that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPayload {
    /// Natural key of the chain event.
    pub tx_hash: String,
    pub user_id: i32,
    pub purchase_id: Option<i32>,
    pub amount: Decimal,
    pub currency: String,
    pub network: String,
    pub token: String,
    /// Deposit address the payment was expected on.
    pub expected_address: String,
}
