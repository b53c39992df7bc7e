pub mod clock;
pub mod config;
pub mod dlq;
pub mod error;
pub mod plan_status;
pub mod retry;
pub mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DlqConfig, ReconcilerConfig, SchedulerConfig};
pub use dlq::{
    AttemptOutcome, DlqPriority, DlqStatus, FailureSource, PaymentPayload, ResolutionMethod,
};
pub use error::{ErrorCategory, PaymentError};
pub use plan_status::{ItemStatus, PlanStatus};
pub use retry::{RetryDecision, RetryPolicy, RetryRecord};
pub use schedule::{BenefitSchedule, PlannedPayout, ScheduleError, ScheduleParams, build_schedule};
