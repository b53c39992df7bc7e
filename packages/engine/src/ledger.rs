//! Outbound ledger interface.
//!
//! The core only appends credits and looks them up. Every credit carries a
//! caller-chosen `reference`; writing the same reference twice returns the
//! transaction recorded the first time instead of moving money again.

use std::sync::Arc;

use async_trait::async_trait;
use common::Clock;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
    SqlErr,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::entity::ledger_transaction;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    pub user_id: i32,
    pub amount: Decimal,
    pub currency: String,
    pub reason: String,
    /// Idempotency key.
    pub reference: String,
}

/// A recorded balance movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: i32,
    pub amount: Decimal,
    pub currency: String,
    pub reference: String,
}

impl From<ledger_transaction::Model> for LedgerEntry {
    fn from(m: ledger_transaction::Model) -> Self {
        Self {
            id: m.id,
            user_id: m.user_id,
            amount: m.amount,
            currency: m.currency,
            reference: m.reference,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("credit rejected: {0}")]
    Rejected(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger write timed out")]
    Timeout,
}

impl LedgerError {
    /// Machine-readable code recorded on failed schedule items.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "LEDGER_REJECTED",
            Self::Unavailable(_) => "LEDGER_UNAVAILABLE",
            Self::Timeout => "LEDGER_TIMEOUT",
        }
    }
}

impl From<DbErr> for LedgerError {
    fn from(err: DbErr) -> Self {
        LedgerError::Unavailable(err.to_string())
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Credit a user. Returns the transaction id; a repeated reference returns the
    /// original transaction.
    async fn credit(&self, request: &CreditRequest) -> Result<Uuid, LedgerError>;

    /// Look up a transaction by its reference.
    async fn find_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>, LedgerError>;
}

/// Ledger stored in the `ledger_transaction` table.
#[derive(Clone)]
pub struct DbLedger {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
}

impl DbLedger {
    pub fn new(db: DatabaseConnection, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    async fn find(&self, reference: &str) -> Result<Option<ledger_transaction::Model>, DbErr> {
        ledger_transaction::Entity::find()
            .filter(ledger_transaction::Column::Reference.eq(reference))
            .one(&self.db)
            .await
    }
}

#[async_trait]
impl Ledger for DbLedger {
    async fn credit(&self, request: &CreditRequest) -> Result<Uuid, LedgerError> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::Rejected(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }

        let model = ledger_transaction::ActiveModel {
            id: Set(Uuid::now_v7()),
            user_id: Set(request.user_id),
            kind: Set("credit".to_string()),
            amount: Set(request.amount),
            currency: Set(request.currency.clone()),
            reason: Set(request.reason.clone()),
            reference: Set(request.reference.clone()),
            created_at: Set(self.clock.now()),
        };

        match model.insert(&self.db).await {
            Ok(inserted) => {
                info!(
                    transaction_id = %inserted.id,
                    user_id = request.user_id,
                    amount = %request.amount,
                    reference = %request.reference,
                    "Ledger credit recorded"
                );
                Ok(inserted.id)
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                let existing = self.find(&request.reference).await?.ok_or_else(|| {
                    LedgerError::Unavailable(
                        "UniqueConstraintViolation but existing row not found".to_string(),
                    )
                })?;
                debug!(
                    transaction_id = %existing.id,
                    reference = %request.reference,
                    "Ledger reference already credited"
                );
                Ok(existing.id)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        Ok(self.find(reference).await?.map(LedgerEntry::from))
    }
}
