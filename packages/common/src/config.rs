use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Benefit accrual scheduler configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Whether the scheduler loop runs in this process. Default: true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between ticks. Default: 300.
    #[serde(default = "default_scheduler_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum due plans examined per tick. Default: 200.
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: u64,
    /// Upper bound on a single ledger credit. Default: 30.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    /// Items left in `processing` longer than this are requeued. Default: 900.
    #[serde(default = "default_scheduler_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
    /// How far in the past a plan start date may lie. Default: 86400.
    #[serde(default = "default_start_grace_secs")]
    pub start_grace_secs: u64,
    /// Return failed items to `pending` automatically. Default: false.
    #[serde(default)]
    pub retry_failed_items: bool,
    /// Automatic retries per item when `retry_failed_items` is on. Default: 3.
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_scheduler_tick_interval_secs() -> u64 {
    300
}
fn default_scheduler_batch_size() -> u64 {
    200
}
fn default_execution_timeout_secs() -> u64 {
    30
}
fn default_scheduler_stale_claim_timeout_secs() -> u64 {
    900
}
fn default_start_grace_secs() -> u64 {
    86_400
}
fn default_max_item_retries() -> u32 {
    3
}

impl SchedulerConfig {
    /// Never zero; a zero interval is treated as one second.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn stale_claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_claim_timeout_secs as i64)
    }

    pub fn start_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.start_grace_secs as i64)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_secs: default_scheduler_tick_interval_secs(),
            batch_size: default_scheduler_batch_size(),
            execution_timeout_secs: default_execution_timeout_secs(),
            stale_claim_timeout_secs: default_scheduler_stale_claim_timeout_secs(),
            start_grace_secs: default_start_grace_secs(),
            retry_failed_items: false,
            max_item_retries: default_max_item_retries(),
        }
    }
}

/// Payment dead letter queue policy.
#[derive(Debug, Deserialize, Clone)]
pub struct DlqConfig {
    /// Retry attempts before an entry fails permanently. Default: 5.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt. Default: 60000.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Growth factor between consecutive delays. Default: 2.0.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Payments at or above this amount are flagged high-value. Default: 1000.
    #[serde(default = "default_high_value_threshold")]
    pub high_value_threshold: Decimal,
    /// Age after which an unresolved entry goes to manual review. Default: 7.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Failed attempts after which priority is raised to high. Default: 3.
    #[serde(default = "default_escalate_after_attempts")]
    pub escalate_after_attempts: u32,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    60_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_high_value_threshold() -> Decimal {
    Decimal::ONE_THOUSAND
}
fn default_retention_days() -> u32 {
    7
}
fn default_escalate_after_attempts() -> u32 {
    3
}

impl DlqConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            high_value_threshold: default_high_value_threshold(),
            retention_days: default_retention_days(),
            escalate_after_attempts: default_escalate_after_attempts(),
        }
    }
}

/// Reconciliation worker configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ReconcilerConfig {
    /// Whether the reconciliation loop runs in this process. Default: true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between ticks. Default: 60.
    #[serde(default = "default_reconciler_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum entries retried per tick. Default: 50.
    #[serde(default = "default_reconciler_batch_size")]
    pub batch_size: u64,
    /// Upper bound on one verification attempt. Default: 30.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Entries left in `retrying` longer than this are released. Default: 600.
    #[serde(default = "default_reconciler_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
}

fn default_reconciler_tick_interval_secs() -> u64 {
    60
}
fn default_reconciler_batch_size() -> u64 {
    50
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_reconciler_stale_claim_timeout_secs() -> u64 {
    600
}

impl ReconcilerConfig {
    /// Never zero; a zero interval is treated as one second.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn stale_claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_claim_timeout_secs as i64)
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_interval_secs: default_reconciler_tick_interval_secs(),
            batch_size: default_reconciler_batch_size(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            stale_claim_timeout_secs: default_reconciler_stale_claim_timeout_secs(),
        }
    }
}
