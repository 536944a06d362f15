//! Integration tests for the pending sweeper and the delayed job runner.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use hookguard_core::{
    models::JobStatus, Clock, EventId, EventStatus, FailureCode, HookguardError, NewWebhookEvent,
    RelatedEntity, WebhookEvent,
};
use hookguard_processing::{
    handlers::books::PurchaseBook, scheduler::PURCHASE_FOLLOW_UP, JobStorage, SweeperConfig,
};
use hookguard_testing::{PayloadBuilder, TestEnv};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn pending_event(env: &TestEnv, event_id: &str, age: Duration) -> WebhookEvent {
    let payload = PayloadBuilder::repair_requested(event_id, "stranded").build();
    WebhookEvent::from_new(NewWebhookEvent {
        event_id: EventId::from(event_id),
        event_type: "repair_requested".to_string(),
        version: "1".to_string(),
        signature_valid: true,
        signature_provided: "sha256=00".to_string(),
        signature_computed: "00".to_string(),
        source_ip: None,
        raw_payload: payload,
        received_at: env.clock.now_utc() - chrono::Duration::from_std(age).unwrap(),
    })
}

fn sweeper_config() -> SweeperConfig {
    SweeperConfig {
        interval: Duration::from_secs(30),
        stale_after: Duration::from_secs(60),
        batch_size: 10,
    }
}

#[tokio::test]
async fn sweeper_dispatches_stranded_pending_events() {
    let env = TestEnv::new();
    env.events.seed(pending_event(&env, "evt_stale", Duration::from_secs(300))).await;
    env.events.seed(pending_event(&env, "evt_fresh", Duration::from_secs(5))).await;

    let sweeper = env.sweeper(sweeper_config(), CancellationToken::new());
    let completed = sweeper.sweep_once().await.unwrap();

    assert_eq!(completed, 1);
    assert_eq!(env.event("evt_stale").await.unwrap().status, EventStatus::Processed);
    assert_eq!(env.event("evt_fresh").await.unwrap().status, EventStatus::Pending);
    assert_eq!(env.repairs.all().await.len(), 1);
}

#[tokio::test]
async fn sweeper_skips_ignored_pending_events() {
    let env = TestEnv::new();
    let mut event = pending_event(&env, "evt_parked", Duration::from_secs(300));
    event.ignored_at = Some(env.clock.now_utc());
    env.events.seed(event).await;

    let sweeper = env.sweeper(sweeper_config(), CancellationToken::new());

    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    assert!(env.repairs.all().await.is_empty());
}

#[tokio::test]
async fn event_stuck_after_a_lost_completion_write_is_recovered() {
    let env = TestEnv::new();
    env.purchases.insert_quoted("P-70").await;
    env.events.fail_next_completions(1);

    let outcome =
        env.deliver(&PayloadBuilder::quote_accepted("evt_lost", "P-70").build()).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Processing);
    let applied = env.purchases.find("P-70").await.unwrap().unwrap();

    let err = env.safe_replay("evt_lost").await.unwrap_err();
    let err = err.downcast::<HookguardError>().unwrap();
    assert!(matches!(err, HookguardError::ConcurrencyConflict { .. }));

    let sweeper = env.sweeper(sweeper_config(), CancellationToken::new());
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    assert_eq!(env.event("evt_lost").await.unwrap().status, EventStatus::Processing);

    env.advance(Duration::from_secs(3600));
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    let event = env.event("evt_lost").await.unwrap();
    assert_eq!(event.status, EventStatus::Processed);
    assert!(event.processing_started_at.is_none());
    assert_eq!(event.related_entity, Some(RelatedEntity::Purchase("P-70".to_string())));
    assert_eq!(env.purchases.find("P-70").await.unwrap().unwrap().version, applied.version);
}

#[tokio::test]
async fn failure_lost_on_write_is_recorded_after_the_lease() {
    let env = TestEnv::new();
    env.events.fail_next_completions(1);

    let outcome = env.deliver(&PayloadBuilder::new("evt_odd", "invoice_paid").build()).await.unwrap();
    assert_eq!(outcome.status, EventStatus::Processing);

    env.advance(Duration::from_secs(120));
    let sweeper = env.sweeper(sweeper_config(), CancellationToken::new());
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    let event = env.event("evt_odd").await.unwrap();
    assert_eq!(event.status, EventStatus::Failed);
    assert_eq!(event.error_code, Some(FailureCode::UnsupportedEventType));

    env.service
        .ignore(&EventId::from("evt_odd"), "ops-1", "sender retired invoice events")
        .await
        .unwrap();
}

#[tokio::test]
async fn crashed_attempt_is_released_by_the_sweeper() {
    let env = TestEnv::new();
    let mut event = pending_event(&env, "evt_crashed", Duration::from_secs(600));
    event.status = EventStatus::Processing;
    event.processing_started_at = Some(env.clock.now_utc() - chrono::Duration::seconds(300));
    env.events.seed(event).await;

    let mut live = pending_event(&env, "evt_live", Duration::from_secs(600));
    live.status = EventStatus::Processing;
    live.processing_started_at = Some(env.clock.now_utc());
    env.events.seed(live).await;

    let sweeper = env.sweeper(sweeper_config(), CancellationToken::new());
    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);

    assert_eq!(env.event("evt_crashed").await.unwrap().status, EventStatus::Processed);
    assert_eq!(env.event("evt_live").await.unwrap().status, EventStatus::Processing);
    assert_eq!(env.repairs.all().await.len(), 1);
}

#[tokio::test]
async fn cancelled_sweeper_stops() {
    let env = TestEnv::new();
    let token = CancellationToken::new();
    token.cancel();

    let sweeper = env.sweeper(sweeper_config(), token);
    tokio::time::timeout(Duration::from_secs(5), sweeper.run()).await.unwrap();
}

#[tokio::test]
async fn accepted_quote_schedules_a_follow_up_that_fires_later() {
    let env = TestEnv::builder().follow_up_delay(Duration::from_secs(3600)).build();
    env.deliver(&PayloadBuilder::quote_accepted("evt_fu", "P-50").build()).await.unwrap();

    let entity = RelatedEntity::Purchase("P-50".to_string());
    let jobs = env.scheduler.jobs_for(entity.clone()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, PURCHASE_FOLLOW_UP);
    assert_eq!(jobs[0].status, JobStatus::Scheduled);

    let runner = env.job_runner(CancellationToken::new());
    assert_eq!(runner.run_due().await.unwrap(), 0);

    env.advance(Duration::from_secs(3601));
    assert_eq!(runner.run_due().await.unwrap(), 1);

    let jobs = env.scheduler.jobs_for(entity).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].attempts, 1);

    let sent = env.notifier.sent().await;
    assert!(sent.iter().any(|n| n.kind == PURCHASE_FOLLOW_UP));
}

#[tokio::test]
async fn undo_cancels_the_follow_up_before_it_runs() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::quote_accepted("evt_undo", "P-51").build()).await.unwrap();
    let entity = RelatedEntity::Purchase("P-51".to_string());

    assert!(env.scheduler.cancel(PURCHASE_FOLLOW_UP, entity.clone()).await.unwrap());
    assert!(!env.scheduler.cancel(PURCHASE_FOLLOW_UP, entity.clone()).await.unwrap());

    env.advance(Duration::from_secs(7200));
    let runner = env.job_runner(CancellationToken::new());
    assert_eq!(runner.run_due().await.unwrap(), 0);

    let jobs = env.scheduler.jobs_for(entity).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Cancelled);
    assert!(env.notifier.sent().await.iter().all(|n| n.kind != PURCHASE_FOLLOW_UP));
}

#[tokio::test]
async fn one_waiting_follow_up_per_purchase() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::quote_accepted("evt_x1", "P-52").build()).await.unwrap();
    env.deliver(&PayloadBuilder::quote_accepted("evt_x2", "P-52").build()).await.unwrap();

    assert_eq!(env.jobs.all().await.len(), 1);
}

#[tokio::test]
async fn job_without_executor_is_marked_failed() {
    let env = TestEnv::new();
    let entity = RelatedEntity::RepairTicket("T-1".to_string());
    env.scheduler
        .schedule("mystery_kind", entity.clone(), json!({}), Duration::from_secs(1))
        .await
        .unwrap();

    env.advance(Duration::from_secs(2));
    env.job_runner(CancellationToken::new()).run_due().await.unwrap();

    let jobs = env.scheduler.jobs_for(entity).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].last_error.as_deref().unwrap().contains("mystery_kind"));
}

#[tokio::test]
async fn failed_follow_up_is_retried_with_backoff() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::quote_accepted("evt_retry_job", "P-60").build()).await.unwrap();
    let entity = RelatedEntity::Purchase("P-60".to_string());
    let runner = env.job_runner(CancellationToken::new());

    env.notifier.set_failing(true);
    env.advance(Duration::from_secs(3601));
    assert_eq!(runner.run_due().await.unwrap(), 1);

    let job = env.scheduler.jobs_for(entity.clone()).await.unwrap().remove(0);
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.is_some());
    assert_eq!(runner.run_due().await.unwrap(), 0);

    env.notifier.set_failing(false);
    env.advance(Duration::from_secs(61));
    assert_eq!(runner.run_due().await.unwrap(), 1);

    let job = env.scheduler.jobs_for(entity).await.unwrap().remove(0);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
async fn follow_up_gives_up_after_max_attempts() {
    let env = TestEnv::new();
    env.deliver(&PayloadBuilder::quote_accepted("evt_give_up", "P-62").build()).await.unwrap();
    let entity = RelatedEntity::Purchase("P-62".to_string());
    let runner = env.job_runner(CancellationToken::new());

    env.notifier.set_failing(true);
    env.advance(Duration::from_secs(3601));
    for _ in 0..3 {
        assert_eq!(runner.run_due().await.unwrap(), 1);
        env.advance(Duration::from_secs(600));
    }

    let job = env.scheduler.jobs_for(entity).await.unwrap().remove(0);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(runner.run_due().await.unwrap(), 0);
}

#[tokio::test]
async fn abandoned_running_job_is_rescheduled_after_its_lease() {
    let env = TestEnv::new();
    let entity = RelatedEntity::Purchase("P-61".to_string());
    env.scheduler
        .schedule(PURCHASE_FOLLOW_UP, entity.clone(), json!({}), Duration::from_secs(1))
        .await
        .unwrap();
    env.advance(Duration::from_secs(2));

    // A runner claims the job and dies before recording the outcome.
    let claimed = env.jobs.claim_due(env.clock.now_utc(), 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let runner = env.job_runner(CancellationToken::new());
    assert_eq!(runner.run_due().await.unwrap(), 0);
    assert_eq!(env.jobs.all().await[0].status, JobStatus::Running);

    env.advance(Duration::from_secs(301));
    runner.run_due().await.unwrap();
    let job = env.jobs.all().await.remove(0);
    assert_eq!(job.status, JobStatus::Scheduled);
    assert!(job.last_error.as_deref().unwrap().contains("lease expired"));

    env.advance(Duration::from_secs(61));
    assert_eq!(runner.run_due().await.unwrap(), 1);

    let job = env.scheduler.jobs_for(entity).await.unwrap().remove(0);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert!(env.notifier.sent().await.iter().any(|n| n.kind == PURCHASE_FOLLOW_UP));
}
