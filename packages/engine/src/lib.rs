pub mod config;
pub mod database;
pub mod dlq;
pub mod entity;
pub mod error;
pub mod indexes;
pub mod ledger;
pub mod plan;
pub mod reconciler;
