mod scheduler;
mod service;

pub use scheduler::{BenefitScheduler, ItemRun, TickReport};
pub use service::{ItemCompletion, PackageConfig, PlanAttention, PlanService, PurchaseRecord};
