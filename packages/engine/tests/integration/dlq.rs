use chrono::Duration;
use common::{
    AttemptOutcome, Clock, DlqPriority, DlqStatus, ErrorCategory, FailureSource, PaymentError,
    ResolutionMethod,
};
use rust_decimal_macros::dec;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DbErr, EntityTrait, PaginatorTrait, QueryFilter};
use uuid::Uuid;

use engine::dlq::{AUTO_RESOLVER, AttemptReport, ResolveResult, RetryApplied};
use engine::entity::payment_dlq;
use engine::error::EngineError;

use crate::common::{TestEnv, payment};

fn chain_error() -> PaymentError {
    PaymentError::new(ErrorCategory::Blockchain, "TX_NOT_FOUND", "transaction not indexed")
}

async fn queue(env: &TestEnv, tx_hash: &str) -> payment_dlq::Model {
    env.dlq()
        .record_failure(
            &payment(tx_hash, dec!(50)),
            &chain_error(),
            FailureSource::Webhook,
        )
        .await
        .unwrap()
        .entry
}

async fn reload(env: &TestEnv, id: i32) -> payment_dlq::Model {
    env.dlq().get(id).await.unwrap().unwrap()
}

/// Claim `entry` and record one failed attempt.
async fn fail_once(env: &TestEnv, entry: &payment_dlq::Model) -> RetryApplied {
    let token = Uuid::new_v4();
    assert!(env.dlq().claim(entry, token).await.unwrap());
    let claimed = reload(env, entry.id).await;
    env.dlq()
        .record_retry_attempt(&claimed, token, AttemptReport::failure(12, chain_error()))
        .await
        .unwrap()
}

mod record_failure {
    use super::*;

    #[tokio::test]
    async fn new_entry_is_immediately_eligible() {
        let env = TestEnv::spawn().await;
        let recorded = env
            .dlq()
            .record_failure(
                &payment("0xabc", dec!(50)),
                &chain_error(),
                FailureSource::ScheduledCheck,
            )
            .await
            .unwrap();

        assert!(recorded.created);
        let entry = recorded.entry;
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.max_attempts, 5);
        assert_eq!(entry.next_retry_at, Some(env.clock.now()));
        assert_eq!(entry.priority, DlqPriority::Normal);
        assert_eq!(entry.source, FailureSource::ScheduledCheck);
        assert_eq!(entry.report_count, 1);
        assert!(!entry.high_value);
        assert!(entry.history().unwrap().is_empty());
        assert!(entry.can_retry(env.clock.now()));
    }

    #[tokio::test]
    async fn duplicate_report_updates_existing_entry() {
        let env = TestEnv::spawn().await;
        let first = queue(&env, "0xdup").await;

        let again = env
            .dlq()
            .record_failure(
                &payment("0xdup", dec!(50)),
                &PaymentError::network("rpc node unreachable"),
                FailureSource::ManualVerification,
            )
            .await
            .unwrap();

        assert!(!again.created);
        assert_eq!(again.entry.id, first.id);
        assert_eq!(again.entry.report_count, 2);
        assert_eq!(again.entry.error_code, "NETWORK_ERROR");
        assert_eq!(again.entry.attempts, 0);
        assert_eq!(
            payment_dlq::Entity::find().count(&env.db).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_reports_create_one_entry() {
        let env = TestEnv::spawn().await;
        let (a, b) = tokio::join!(queue(&env, "0xrace"), queue(&env, "0xrace"));

        assert_eq!(a.id, b.id);
        let entry = reload(&env, a.id).await;
        assert_eq!(entry.report_count, 2);
    }

    #[tokio::test]
    async fn high_value_amount_is_flagged() {
        let env = TestEnv::spawn().await;
        let big = env
            .dlq()
            .record_failure(
                &payment("0xbig", dec!(1000)),
                &chain_error(),
                FailureSource::Webhook,
            )
            .await
            .unwrap()
            .entry;
        let small = env
            .dlq()
            .record_failure(
                &payment("0xsmall", dec!(999.99)),
                &chain_error(),
                FailureSource::Webhook,
            )
            .await
            .unwrap()
            .entry;

        assert!(big.high_value);
        assert_eq!(big.priority, DlqPriority::High);
        assert!(!small.high_value);
        assert_eq!(small.priority, DlqPriority::Normal);
    }
}

mod retries {
    use super::*;

    #[tokio::test]
    async fn backoff_doubles_until_failed_permanently() {
        let env = TestEnv::spawn().await;
        let mut entry = queue(&env, "0xretry").await;

        for expected_secs in [60, 120, 240, 480] {
            let now = env.clock.now();
            let applied = fail_once(&env, &entry).await;
            let RetryApplied::Rescheduled { next_retry_at } = applied else {
                panic!("expected reschedule, got {applied:?}");
            };
            assert_eq!(next_retry_at - now, Duration::seconds(expected_secs));

            entry = reload(&env, entry.id).await;
            assert_eq!(entry.status, DlqStatus::Pending);
            assert!(!entry.can_retry(env.clock.now()));
            env.clock.set(next_retry_at);
        }

        let applied = fail_once(&env, &entry).await;
        assert_eq!(applied, RetryApplied::Exhausted);

        let entry = reload(&env, entry.id).await;
        assert_eq!(entry.status, DlqStatus::FailedPermanently);
        assert!(entry.requires_attention);
        assert_eq!(entry.attempts, 5);
        assert!(entry.next_retry_at.is_none());
        assert!(!entry.can_retry(env.clock.now()));
        assert_eq!(entry.priority, DlqPriority::High);

        let history = entry.history().unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(
            history.iter().map(|r| r.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(history.iter().all(|r| r.outcome == AttemptOutcome::Failure));
    }

    #[tokio::test]
    async fn successful_attempt_resolves_entry() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xok").await;

        let token = Uuid::new_v4();
        assert!(env.dlq().claim(&entry, token).await.unwrap());
        let claimed = reload(&env, entry.id).await;
        assert_eq!(claimed.status, DlqStatus::Retrying);

        let applied = env
            .dlq()
            .record_retry_attempt(&claimed, token, AttemptReport::success(30, "ledger-tx-1"))
            .await
            .unwrap();
        assert_eq!(applied, RetryApplied::Resolved);

        let entry = reload(&env, entry.id).await;
        assert_eq!(entry.status, DlqStatus::Resolved);
        assert_eq!(entry.resolution_method, Some(ResolutionMethod::AutoRetry));
        assert_eq!(entry.resolved_by.as_deref(), Some(AUTO_RESOLVER));
        assert_eq!(entry.final_transaction_id.as_deref(), Some("ledger-tx-1"));
        assert_eq!(entry.attempts, 1);
        assert!(entry.claim_token.is_none());
    }

    #[tokio::test]
    async fn second_claim_on_same_entry_fails() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xclaim").await;

        assert!(env.dlq().claim(&entry, Uuid::new_v4()).await.unwrap());
        assert!(!env.dlq().claim(&entry, Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn attempt_with_foreign_token_is_fenced() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xfence").await;

        assert!(env.dlq().claim(&entry, Uuid::new_v4()).await.unwrap());
        let claimed = reload(&env, entry.id).await;

        let applied = env
            .dlq()
            .record_retry_attempt(
                &claimed,
                Uuid::new_v4(),
                AttemptReport::failure(5, chain_error()),
            )
            .await
            .unwrap();
        assert_eq!(applied, RetryApplied::Fenced);
        assert_eq!(reload(&env, entry.id).await.attempts, 0);
    }

    #[tokio::test]
    async fn stale_claim_is_released() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xstale").await;
        let token = Uuid::new_v4();
        assert!(env.dlq().claim(&entry, token).await.unwrap());
        let claimed = reload(&env, entry.id).await;

        env.clock.advance(Duration::hours(1));
        let released = env
            .dlq()
            .release_stale_claims(env.clock.now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let entry = reload(&env, entry.id).await;
        assert_eq!(entry.status, DlqStatus::Pending);
        assert!(entry.claim_token.is_none());
        assert!(entry.can_retry(env.clock.now()));

        let late = env
            .dlq()
            .record_retry_attempt(&claimed, token, AttemptReport::success(1, "tx"))
            .await
            .unwrap();
        assert_eq!(late, RetryApplied::Fenced);
    }

    #[tokio::test]
    async fn malformed_history_is_not_overwritten() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xcorrupt").await;
        let garbage = serde_json::json!({ "attempt": "not-a-list" });
        payment_dlq::Entity::update_many()
            .col_expr(payment_dlq::Column::RetryHistory, Expr::value(garbage.clone()))
            .filter(payment_dlq::Column::Id.eq(entry.id))
            .exec(&env.db)
            .await
            .unwrap();

        let token = Uuid::new_v4();
        assert!(env.dlq().claim(&entry, token).await.unwrap());
        let claimed = reload(&env, entry.id).await;
        assert!(matches!(claimed.history(), Err(DbErr::Json(_))));

        let err = env
            .dlq()
            .record_retry_attempt(&claimed, token, AttemptReport::failure(5, chain_error()))
            .await
            .unwrap_err();
        assert!(matches!(err, DbErr::Json(_)));

        let entry = reload(&env, entry.id).await;
        assert_eq!(entry.retry_history, garbage);
        assert_eq!(entry.attempts, 0);
    }

    #[tokio::test]
    async fn schedule_retry_uses_current_attempt_count() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xsched").await;
        fail_once(&env, &entry).await;
        let entry = reload(&env, entry.id).await;
        fail_once(&env, &entry).await;

        let applied = env.dlq().schedule_retry(entry.id).await.unwrap();
        assert_eq!(
            applied,
            RetryApplied::Rescheduled {
                next_retry_at: env.clock.now() + Duration::seconds(120)
            }
        );
    }
}

mod operator {
    use super::*;

    #[tokio::test]
    async fn mark_as_resolved_is_terminal() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xmanual").await;

        let result = env
            .dlq()
            .mark_as_resolved(
                entry.id,
                "ops@example.com",
                ResolutionMethod::ManualFix,
                Some("credited by hand"),
                Some("manual-tx-9"),
            )
            .await
            .unwrap();
        assert_eq!(result, ResolveResult::Resolved);

        let resolved = reload(&env, entry.id).await;
        assert_eq!(resolved.status, DlqStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some("ops@example.com"));
        assert_eq!(resolved.resolution_notes.as_deref(), Some("credited by hand"));
        assert!(!resolved.requires_attention);

        let again = env
            .dlq()
            .mark_as_resolved(entry.id, "ops", ResolutionMethod::ManualFix, None, None)
            .await
            .unwrap();
        assert_eq!(again, ResolveResult::AlreadyResolved);

        let missing = env
            .dlq()
            .mark_as_resolved(4242, "ops", ResolutionMethod::ManualFix, None, None)
            .await
            .unwrap();
        assert_eq!(missing, ResolveResult::NotFound);
    }

    #[tokio::test]
    async fn resolving_permanently_failed_entry_clears_attention() {
        let env = TestEnv::spawn().await;
        let mut entry = queue(&env, "0xdead").await;
        for _ in 0..5 {
            fail_once(&env, &entry).await;
            entry = reload(&env, entry.id).await;
            if let Some(at) = entry.next_retry_at {
                env.clock.set(at);
            }
        }
        assert_eq!(entry.status, DlqStatus::FailedPermanently);

        let result = env
            .dlq()
            .mark_as_resolved(entry.id, "ops", ResolutionMethod::AdminOverride, None, None)
            .await
            .unwrap();
        assert_eq!(result, ResolveResult::Resolved);
        assert!(!reload(&env, entry.id).await.requires_attention);
    }

    #[tokio::test]
    async fn manual_resolution_fences_in_flight_attempt() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xinflight").await;
        let token = Uuid::new_v4();
        assert!(env.dlq().claim(&entry, token).await.unwrap());
        let claimed = reload(&env, entry.id).await;

        env.dlq()
            .mark_as_resolved(entry.id, "ops", ResolutionMethod::Cancelled, None, None)
            .await
            .unwrap();

        let applied = env
            .dlq()
            .record_retry_attempt(&claimed, token, AttemptReport::failure(3, chain_error()))
            .await
            .unwrap();
        assert_eq!(applied, RetryApplied::Fenced);
        assert_eq!(reload(&env, entry.id).await.status, DlqStatus::Resolved);
    }

    #[tokio::test]
    async fn escalate_and_flag_suspicious() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xodd").await;

        let escalated = env.dlq().escalate(entry.id, "customer complaint").await.unwrap();
        assert_eq!(escalated.priority, DlqPriority::High);
        assert!(escalated.requires_attention);
        assert_eq!(escalated.attempts, 0);
        assert_eq!(
            escalated.escalation_reason.as_deref(),
            Some("customer complaint")
        );

        let flagged = env
            .dlq()
            .flag_suspicious(entry.id, "address mismatch")
            .await
            .unwrap();
        assert!(flagged.suspicious);
        assert_eq!(flagged.priority, DlqPriority::Critical);

        // Escalation never lowers priority.
        let again = env.dlq().escalate(entry.id, "follow-up").await.unwrap();
        assert_eq!(again.priority, DlqPriority::Critical);

        env.dlq()
            .mark_as_resolved(entry.id, "ops", ResolutionMethod::ManualFix, None, None)
            .await
            .unwrap();
        let err = env.dlq().escalate(entry.id, "too late").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn manual_review_and_reopen() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xreview").await;

        let parked = env
            .dlq()
            .send_to_manual_review(entry.id, "needs chain explorer check")
            .await
            .unwrap();
        assert_eq!(parked.status, DlqStatus::ManualReview);
        assert!(parked.requires_attention);
        assert!(!parked.can_retry(env.clock.now()));
        assert!(env.dlq().ready_for_retry(10).await.unwrap().is_empty());

        let reopened = env.dlq().reopen(entry.id).await.unwrap();
        assert_eq!(reopened.status, DlqStatus::Pending);
        assert_eq!(reopened.attempts, 0);
        assert!(!reopened.requires_attention);
        assert!(reopened.can_retry(env.clock.now()));

        let err = env.dlq().reopen(entry.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }
}

mod queries {
    use super::*;

    #[tokio::test]
    async fn ready_entries_are_ordered_by_priority_then_age() {
        let env = TestEnv::spawn().await;
        let old_normal = queue(&env, "0x1").await;
        env.clock.advance(Duration::seconds(10));
        let new_normal = queue(&env, "0x2").await;
        env.clock.advance(Duration::seconds(10));
        let high = env
            .dlq()
            .record_failure(
                &payment("0x3", dec!(5000)),
                &chain_error(),
                FailureSource::Webhook,
            )
            .await
            .unwrap()
            .entry;
        let waiting = queue(&env, "0x4").await;
        fail_once(&env, &waiting).await;

        let ready = env.dlq().ready_for_retry(10).await.unwrap();
        let ids: Vec<i32> = ready.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![high.id, old_normal.id, new_normal.id]);

        let limited = env.dlq().ready_for_retry(1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, high.id);
    }

    #[tokio::test]
    async fn expired_entries_are_surfaced_for_review() {
        let env = TestEnv::spawn().await;
        let entry = queue(&env, "0xold").await;

        env.clock.advance(Duration::days(6));
        assert_eq!(env.dlq().surface_expired().await.unwrap(), 0);

        env.clock.advance(Duration::days(2));
        assert!(reload(&env, entry.id).await.is_expired(env.clock.now(), Duration::days(7)));
        assert_eq!(env.dlq().surface_expired().await.unwrap(), 1);

        let entry = reload(&env, entry.id).await;
        assert_eq!(entry.status, DlqStatus::ManualReview);
        assert!(entry.requires_attention);

        let attention = env.dlq().needing_attention(10).await.unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].id, entry.id);
    }

    #[tokio::test]
    async fn stats_count_entries_per_status() {
        let env = TestEnv::spawn().await;
        let a = queue(&env, "0xa").await;
        queue(&env, "0xb").await;
        env.dlq()
            .record_failure(
                &payment("0xc", dec!(2500)),
                &chain_error(),
                FailureSource::Webhook,
            )
            .await
            .unwrap();
        env.dlq()
            .mark_as_resolved(a.id, "ops", ResolutionMethod::ManualFix, None, None)
            .await
            .unwrap();

        let stats = env.dlq().stats().await.unwrap();
        assert_eq!(stats.count(DlqStatus::Pending), 2);
        assert_eq!(stats.count(DlqStatus::Resolved), 1);
        assert_eq!(stats.count(DlqStatus::FailedPermanently), 0);
        assert_eq!(stats.high_value_open, 1);
        assert_eq!(stats.requires_attention, 0);
        assert_eq!(env.dlq().count(DlqStatus::Pending).await.unwrap(), 2);
    }
}
