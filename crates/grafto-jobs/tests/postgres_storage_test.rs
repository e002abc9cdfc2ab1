//! Integration tests for PgJobStorage.
//!
//! These tests run against a real PostgreSQL database using testcontainers.
//! Requires Docker; run with `cargo test -- --ignored`.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{job, ShortFuseRepeatable, TestDatabase};
use grafto_jobs::{
    JobError, JobState, JobStorage, PgJobStorage, PgReportSource, Queue, ReportSource,
    RetryPolicy,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn queue(db: &TestDatabase) -> (Queue, Arc<PgJobStorage>) {
    let storage = Arc::new(PgJobStorage::new(db.pool()));
    let queue = Queue::with_policy(storage.clone(), RetryPolicy::fixed(5, 1500));
    (queue, storage)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_push_and_pull_in_schedule_order() {
    let db = TestDatabase::new().await;
    let (queue, _) = queue(&db);
    let now = Utc::now();

    let current = queue.push(job("a").schedule_at(now)).await.unwrap();
    queue
        .push(job("a").schedule_at(now + ChronoDuration::hours(1)))
        .await
        .unwrap();
    let overdue = queue
        .push(job("a").schedule_at(now - ChronoDuration::hours(1)))
        .await
        .unwrap();

    let pulled = queue.pull_at(now, 10).await.unwrap();
    let ids: Vec<_> = pulled.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![overdue, current]);
    assert!(pulled.iter().all(|j| j.state == JobState::Running));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_concurrent_claims_are_exclusive() {
    let db = TestDatabase::new().await;
    let (queue, _) = queue(&db);

    for _ in 0..100 {
        queue.push(job("a")).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..6 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                let batch = queue.pull(9).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                ids.extend(batch.into_iter().map(|j| j.id));
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_fail_and_complete_round_trip() {
    let db = TestDatabase::new().await;
    let (queue, storage) = queue(&db);

    let id = queue.push(job("a")).await.unwrap();
    let claimed = queue.pull(1).await.unwrap().remove(0);

    let outcome = queue
        .fail(&claimed, &JobError::ExecutionFailed("smtp down".into()))
        .await
        .unwrap();
    assert!(!outcome.is_terminal());

    let stored = storage.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Queued);
    assert_eq!(stored.failed_attempts, 1);
    assert!(stored.scheduled_for > Utc::now());

    let retried = queue
        .pull_at(Utc::now() + ChronoDuration::seconds(2), 1)
        .await
        .unwrap()
        .remove(0);
    queue.complete(&retried).await.unwrap();
    assert_eq!(
        storage.get_job(id).await.unwrap().unwrap().state,
        JobState::Done
    );

    assert_eq!(queue.purge_completed(Duration::ZERO).await.unwrap(), 1);
    assert!(storage.get_job(id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_stale_claim_is_reclaimed_and_old_claim_rejected() {
    let db = TestDatabase::new().await;
    let (queue, storage) = queue(&db);
    let queue = queue.with_stale_after(Duration::from_secs(30));

    let id = queue.push(job("a")).await.unwrap();
    let now = Utc::now();
    let first = queue.pull_at(now, 1).await.unwrap().remove(0);
    assert!(queue
        .pull_at(now + ChronoDuration::seconds(10), 1)
        .await
        .unwrap()
        .is_empty());

    let second = queue
        .pull_at(now + ChronoDuration::seconds(31), 1)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(second.id, id);

    let err = queue.complete(&first).await.unwrap_err();
    assert!(matches!(err, JobError::ClaimLost(_)));
    let err = queue
        .fail(&first, &JobError::ExecutionFailed("late".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::ClaimLost(_)));

    queue.complete(&second).await.unwrap();
    assert_eq!(
        storage.get_job(id).await.unwrap().unwrap().state,
        JobState::Done
    );
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_repeatable_key_is_unique_while_active() {
    let db = TestDatabase::new().await;
    let (queue, storage) = queue(&db);
    let executor = ShortFuseRepeatable::new("weekly_report_executor", Duration::from_secs(60), false);

    assert!(queue.initialize_repeatable(executor.as_ref()).await.unwrap().is_some());
    assert!(queue.initialize_repeatable(executor.as_ref()).await.unwrap().is_none());
    assert!(storage
        .repeatable_job_exists("weekly_report_executor")
        .await
        .unwrap());

    let next = Utc::now() + ChronoDuration::hours(2);
    let occurrence = queue
        .pull_at(Utc::now() + ChronoDuration::minutes(2), 1)
        .await
        .unwrap()
        .remove(0);
    queue.reschedule_repeatable(&occurrence, next).await.unwrap();

    let stored = storage.get_job(occurrence.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Queued);
    assert_eq!(stored.failed_attempts, 0);
    assert_eq!(stored.scheduled_for.timestamp_micros(), next.timestamp_micros());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_report_source_counts_recent_users() {
    let db = TestDatabase::new().await;
    let pool = db.pool();

    for (mail, days_ago) in [("a@grafto.dev", 1), ("b@grafto.dev", 3), ("c@grafto.dev", 30)] {
        sqlx::query(
            "INSERT INTO users (id, name, mail, password, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(uuid::Uuid::new_v4())
        .bind("user")
        .bind(mail)
        .bind("hash")
        .bind(Utc::now() - ChronoDuration::days(days_ago))
        .execute(&pool)
        .await
        .unwrap();
    }

    let source = PgReportSource::new(pool);
    let count = source
        .new_users_since(Utc::now() - ChronoDuration::days(7))
        .await
        .unwrap();
    assert_eq!(count, 2);
}
