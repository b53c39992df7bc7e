mod service;

pub use service::{
    AUTO_RESOLVER, AttemptReport, DlqService, DlqStats, RecordedFailure, ResolveResult,
    RetryApplied, dlq_service,
};
