pub mod benefit_plan;
pub mod benefit_schedule_item;
pub mod ledger_transaction;
pub mod payment_dlq;
