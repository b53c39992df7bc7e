use chrono::Duration;
use common::{Clock, ItemStatus, PlanStatus};
use rust_decimal_macros::dec;
use sea_orm::{EntityTrait, PaginatorTrait};

use engine::entity::{benefit_plan, benefit_schedule_item};
use engine::error::EngineError;
use engine::plan::PackageConfig;

use crate::common::{TestEnv, purchase, reference_package, start_time};

mod create_plan {
    use super::*;

    #[tokio::test]
    async fn persists_full_schedule() {
        let env = TestEnv::spawn().await;
        let plan = env.create_reference_plan(1).await;

        assert_eq!(plan.status, PlanStatus::Active);
        assert_eq!(plan.total_potential, dec!(5));
        assert_eq!(plan.ends_at, start_time() + Duration::days(45));
        assert_eq!(plan.next_run_at, Some(start_time() + Duration::days(1)));

        let items = env.plans().items(plan.id).await.unwrap();
        assert_eq!(items.len(), 40);
        assert!(items.iter().all(|i| i.amount == dec!(125)));
        assert!(items.iter().all(|i| i.status == ItemStatus::Pending));
        assert!(items.windows(2).all(|w| w[0].scheduled_at < w[1].scheduled_at));
        assert_eq!(
            items.last().unwrap().scheduled_at,
            start_time() + Duration::days(44)
        );
    }

    #[tokio::test]
    async fn second_call_for_same_purchase_returns_existing_plan() {
        let env = TestEnv::spawn().await;
        let first = env.create_reference_plan(5).await;
        let second = env.create_reference_plan(5).await;

        assert_eq!(first.id, second.id);
        let plans = benefit_plan::Entity::find().count(&env.db).await.unwrap();
        let items = benefit_schedule_item::Entity::find()
            .count(&env.db)
            .await
            .unwrap();
        assert_eq!(plans, 1);
        assert_eq!(items, 40);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_plan() {
        let env = TestEnv::spawn().await;
        let (a, b) = tokio::join!(env.create_reference_plan(9), env.create_reference_plan(9));

        assert_eq!(a.id, b.id);
        let items = benefit_schedule_item::Entity::find()
            .count(&env.db)
            .await
            .unwrap();
        assert_eq!(items, 40);
    }

    #[tokio::test]
    async fn invalid_package_is_rejected_without_writes() {
        let env = TestEnv::spawn().await;
        let package = PackageConfig {
            daily_rate: dec!(1.5),
            ..reference_package()
        };

        let err = env
            .plans()
            .create_plan(
                &purchase(2, dec!(1000), env.clock.now()),
                &package,
                env.scheduler_config.start_grace(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Schedule(_)));
        assert_eq!(benefit_plan::Entity::find().count(&env.db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_date_beyond_grace_is_rejected() {
        let env = TestEnv::spawn().await;
        let stale = env.clock.now() - Duration::days(3);

        let err = env
            .plans()
            .create_plan(
                &purchase(3, dec!(1000), stale),
                &reference_package(),
                env.scheduler_config.start_grace(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Schedule(_)));
    }
}

mod pause_resume {
    use super::*;

    #[tokio::test]
    async fn paused_plan_is_not_due() {
        let env = TestEnv::spawn().await;
        let plan = env.create_reference_plan(1).await;

        let paused = env.plans().pause(plan.id, "kyc review").await.unwrap();
        assert_eq!(paused.status, PlanStatus::Paused);
        assert_eq!(paused.status_reason.as_deref(), Some("kyc review"));
        assert!(paused.paused_at.is_some());

        env.clock.advance(Duration::days(2));
        let due = env.plans().due_plans(env.clock.now(), 10).await.unwrap();
        assert!(due.is_empty());

        let report = env.scheduler().tick().await.unwrap();
        assert_eq!(report.executed, 0);
        assert_eq!(env.ledger_count().await, 0);
    }

    #[tokio::test]
    async fn resume_points_next_run_at_earliest_pending_item() {
        let env = TestEnv::spawn().await;
        let plan = env.create_reference_plan(1).await;

        env.clock.advance(Duration::days(1));
        env.scheduler().tick().await.unwrap();
        env.plans().pause(plan.id, "manual").await.unwrap();

        env.clock.advance(Duration::days(5));
        let resumed = env.plans().resume(plan.id).await.unwrap();

        assert_eq!(resumed.status, PlanStatus::Active);
        assert!(resumed.paused_at.is_none());
        assert_eq!(resumed.next_run_at, Some(start_time() + Duration::days(2)));
    }

    #[tokio::test]
    async fn pause_of_paused_plan_is_invalid() {
        let env = TestEnv::spawn().await;
        let plan = env.create_reference_plan(1).await;
        env.plans().pause(plan.id, "first").await.unwrap();

        let err = env.plans().pause(plan.id, "second").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        let err = env.plans().resume(9999).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}

mod cancel {
    use super::*;

    #[tokio::test]
    async fn cancel_skips_pending_items_and_keeps_done_ones() {
        let env = TestEnv::spawn().await;
        let plan = env.create_reference_plan(1).await;

        env.clock.advance(Duration::days(1));
        env.scheduler().tick().await.unwrap();

        let cancelled = env.plans().cancel(plan.id, "refund").await.unwrap();
        assert_eq!(cancelled.status, PlanStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(cancelled.next_run_at.is_none());

        let items = env.plans().items(plan.id).await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Done);
        assert!(items[1..].iter().all(|i| i.status == ItemStatus::Skipped));

        let err = env.plans().cancel(plan.id, "again").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }
}
