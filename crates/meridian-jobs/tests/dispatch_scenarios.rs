//! End-to-end dispatch scenarios against the in-memory store.
//!
//! Time-sensitive scenarios run on a manual clock; concurrency scenarios
//! run on the multi-threaded runtime.

mod common;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{t0, TestSystem};
use meridian_jobs::config::SchedulerConfig;
use meridian_jobs::{
    cron_expressions, JobError, JobId, JobOutcome, JobPayload, JobRecord, JobState, JobStore, LeaseReaper,
    Priority, RecurringScheduler, RetryPolicy, WorkerPool, WorkerPoolConfig, WorkerPoolManager,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_are_exclusive() {
    let system = TestSystem::new(1);
    let tier = system.dispatcher.priority(Priority::Normal).unwrap();
    for _ in 0..64 {
        system
            .dispatcher
            .enqueue(JobPayload::kind("noop"), &tier)
            .await
            .expect("Failed to enqueue");
    }

    let queues = vec![tier.queue().to_string()];
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let store = system.store.clone();
            let queues = queues.clone();
            tokio::spawn(async move {
                let mut leased = Vec::new();
                while let Some(job) = store
                    .lease_next(&queues, Duration::from_secs(60))
                    .await
                    .expect("Lease failed")
                {
                    leased.push(job.id);
                }
                leased
            })
        })
        .collect();

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }

    let unique: HashSet<&JobId> = all.iter().collect();
    assert_eq!(all.len(), 64);
    assert_eq!(unique.len(), 64);
    assert!(system
        .store
        .list_jobs(None)
        .iter()
        .all(|job| job.state == JobState::Leased && job.attempt == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_high_rank_jobs_leased_before_low_rank() {
    let system = TestSystem::new(1);
    let high = system.dispatcher.priority(Priority::High).unwrap();
    let low = system.dispatcher.priority(Priority::BelowNormal).unwrap();

    // Low-rank jobs are enqueued first so creation order cannot explain the result.
    for _ in 0..4 {
        system.dispatcher.enqueue(JobPayload::kind("low"), &low).await.unwrap();
    }
    for _ in 0..4 {
        system.dispatcher.enqueue(JobPayload::kind("high"), &high).await.unwrap();
    }

    let high_queue = high.queue().to_string();
    let store = system.store.clone();
    let overtaken = Arc::new(AtomicBool::new(false));
    let flag = overtaken.clone();
    system.handlers.register_fn("low", move |_, _| {
        let store = store.clone();
        let flag = flag.clone();
        let high_queue = high_queue.clone();
        async move {
            let stats = store.queue_stats(&high_queue).await?;
            if stats.enqueued > 0 {
                flag.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<(), JobError>(())
        }
    });
    system.handlers.register_fn("high", |_, _| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(())
    });

    let all_queues: Vec<String> = system.registry.queue_names().map(str::to_string).collect();
    let manager = WorkerPoolManager::new(
        &system.registry,
        vec![WorkerPoolConfig::new("mixed", all_queues, 2).poll_interval(Duration::from_millis(5))],
        system.worker_context(RetryPolicy::none()),
    )
    .expect("Invalid pool setup");
    manager.start().expect("Failed to start pools");

    for _ in 0..400 {
        if system.store.list_jobs(Some(JobState::Succeeded)).len() == 8 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    manager.shutdown().await;

    assert_eq!(system.store.list_jobs(Some(JobState::Succeeded)).len(), 8);
    assert!(!overtaken.load(Ordering::SeqCst));
    assert_eq!(manager.stats()[0].jobs_succeeded, 8);
}

#[tokio::test]
async fn test_flaky_job_succeeds_on_third_attempt() {
    let system = TestSystem::new(3);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    system.handlers.register_fn("flaky", move |_, _| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call < 3 {
                return Err(JobError::ExecutionFailed(format!("attempt {call} failed")));
            }
            Ok(())
        }
    });

    let tier = system.dispatcher.tier("normal").unwrap();
    let id = system.dispatcher.enqueue(JobPayload::kind("flaky"), &tier).await.unwrap();
    let pool = WorkerPool::new(
        WorkerPoolConfig::new("normal", [tier.queue()], 1),
        system.worker_context(RetryPolicy::sequence(
            3,
            vec![Duration::from_secs(5), Duration::from_secs(15)],
        )),
    );

    let outcome = pool.run_once("normal-0").await.unwrap();
    assert_eq!(
        outcome,
        Some(JobOutcome::Retrying {
            job_id: id.clone(),
            retry_at: t0() + ChronoDuration::seconds(5)
        })
    );

    // Not eligible before the first delay elapses.
    system.clock.advance(Duration::from_secs(4));
    assert_eq!(pool.run_once("normal-0").await.unwrap(), None);

    system.clock.advance(Duration::from_secs(1));
    let outcome = pool.run_once("normal-0").await.unwrap();
    assert_eq!(
        outcome,
        Some(JobOutcome::Retrying {
            job_id: id.clone(),
            retry_at: t0() + ChronoDuration::seconds(20)
        })
    );

    system.clock.advance(Duration::from_secs(15));
    let outcome = pool.run_once("normal-0").await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Succeeded { .. })));

    let job = system.store.get(&id).await.unwrap().expect("Job not found");
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_continuation_chain_releases_one_level_per_ack() {
    let system = TestSystem::new(1);
    let ran = Arc::new(Mutex::new(Vec::new()));
    let log = ran.clone();
    system.handlers.register_fn("step", move |_, ctx| {
        log.lock().unwrap().push(ctx.job_id.clone());
        async { Ok(()) }
    });

    let tier = system.dispatcher.tier("normal").unwrap();
    let a = system.dispatcher.enqueue(JobPayload::kind("step"), &tier).await.unwrap();
    let b = system.dispatcher.continue_with(&a, JobPayload::kind("step"), &tier).await.unwrap();
    let c = system.dispatcher.continue_with(&b, JobPayload::kind("step"), &tier).await.unwrap();
    let d = system.dispatcher.continue_with(&c, JobPayload::kind("step"), &tier).await.unwrap();
    let chain = [a.clone(), b.clone(), c.clone(), d.clone()];

    let pool = WorkerPool::new(
        WorkerPoolConfig::new("normal", [tier.queue()], 1),
        system.worker_context(RetryPolicy::default()),
    );

    for level in 0..chain.len() {
        for (depth, id) in chain.iter().enumerate() {
            let expected = match depth {
                n if n < level => JobState::Succeeded,
                n if n == level => JobState::Enqueued,
                _ => JobState::AwaitingParent,
            };
            let job = system.store.get(id).await.unwrap().expect("Job not found");
            assert_eq!(job.state, expected, "level {depth} before running level {level}");
        }

        let outcome = pool.run_once("normal-0").await.unwrap();
        let released = chain.get(level + 1).cloned().into_iter().collect::<Vec<_>>();
        assert_eq!(
            outcome,
            Some(JobOutcome::Succeeded {
                job_id: chain[level].clone(),
                released
            })
        );
    }

    assert_eq!(pool.run_once("normal-0").await.unwrap(), None);
    for id in &chain {
        assert_eq!(system.store.get(id).await.unwrap().unwrap().state, JobState::Succeeded);
    }
    assert_eq!(*ran.lock().unwrap(), chain.to_vec());
}

#[tokio::test]
async fn test_minutely_recurring_fires_once_per_slot() {
    let system = TestSystem::new(1);
    let tier = system.dispatcher.tier("normal").unwrap();
    system
        .dispatcher
        .add_recurring("heartbeat", cron_expressions::MINUTELY, JobPayload::kind("beat"), &tier)
        .await
        .unwrap();

    let scheduler = RecurringScheduler::new(
        system.store.clone(),
        system.dispatcher.clone(),
        system.clock.clone(),
        &SchedulerConfig::default(),
    );

    let mut fired = 0;
    for _ in 0..3 {
        system.clock.advance(Duration::from_secs(60));
        fired += scheduler.tick().await.unwrap();
        // A second tick for the same instant must not duplicate.
        fired += scheduler.tick().await.unwrap();
    }
    assert_eq!(fired, 3);

    let slots: Vec<DateTime<Utc>> = system
        .store
        .list_jobs(None)
        .into_iter()
        .map(|job| job.scheduled_at)
        .collect();
    assert_eq!(
        slots,
        vec![
            t0() + ChronoDuration::minutes(1),
            t0() + ChronoDuration::minutes(2),
            t0() + ChronoDuration::minutes(3),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_continuation_created_during_parent_ack_is_released() {
    let system = TestSystem::new(1);
    let queue = system.registry.queue_for("normal").unwrap().to_string();
    let queues = vec![queue.clone()];

    for _ in 0..50 {
        let parent = system
            .store
            .create(JobRecord::new(JobPayload::kind("parent"), queue.clone(), t0()))
            .await
            .unwrap();
        let leased = system
            .store
            .lease_next(&queues, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("Parent not leased");
        assert_eq!(leased.id, parent);

        let acker = {
            let store = system.store.clone();
            let parent = parent.clone();
            tokio::spawn(async move { store.ack(&parent, leased.attempt).await })
        };
        let creator = {
            let store = system.store.clone();
            let child = JobRecord::new(JobPayload::kind("child"), queue.clone(), t0()).parent(parent.clone());
            tokio::spawn(async move { store.create(child).await })
        };

        acker.await.unwrap().expect("Ack failed");
        let child = creator.await.unwrap().expect("Create failed");

        let child = system.store.get(&child).await.unwrap().expect("Child not found");
        assert_eq!(child.state, JobState::Enqueued);

        // Drain the child so the next round leases the next parent.
        let drained = system
            .store
            .lease_next(&queues, Duration::from_secs(60))
            .await
            .unwrap()
            .expect("Child not eligible");
        system.store.ack(&drained.id, drained.attempt).await.unwrap();
    }
}

#[tokio::test]
async fn test_cyclic_continuation_rejected_without_mutation() {
    let system = TestSystem::new(1);
    let tier = system.dispatcher.tier("normal").unwrap();
    let a = system.dispatcher.enqueue(JobPayload::kind("a"), &tier).await.unwrap();
    let b = system.dispatcher.enqueue(JobPayload::kind("b"), &tier).await.unwrap();
    let c = system.dispatcher.enqueue(JobPayload::kind("c"), &tier).await.unwrap();

    system.dispatcher.attach_continuation(&a, &b).await.unwrap();
    system.dispatcher.attach_continuation(&b, &c).await.unwrap();
    let before = system.store.list_jobs(None);

    let result = system.dispatcher.attach_continuation(&c, &a).await;
    assert!(matches!(result, Err(JobError::CyclicContinuation { .. })));
    let result = system.dispatcher.attach_continuation(&a, &a).await;
    assert!(matches!(result, Err(JobError::CyclicContinuation { .. })));

    let after = system.store.list_jobs(None);
    assert_eq!(
        before.iter().map(|j| (j.id.clone(), j.state, j.parent_id.clone())).collect::<Vec<_>>(),
        after.iter().map(|j| (j.id.clone(), j.state, j.parent_id.clone())).collect::<Vec<_>>()
    );
    assert!(system.store.children(&c).await.unwrap().is_empty());
    assert_eq!(system.store.get(&a).await.unwrap().unwrap().state, JobState::Enqueued);
}

#[tokio::test]
async fn test_expired_lease_is_reaped_and_released() {
    let system = TestSystem::new(3);
    let tier = system.dispatcher.tier("normal").unwrap();
    let id = system.dispatcher.enqueue(JobPayload::kind("slow"), &tier).await.unwrap();
    let queues = vec![tier.queue().to_string()];

    let first = system
        .store
        .lease_next(&queues, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("Job not leased");
    assert_eq!(first.attempt, 1);

    let reaper = LeaseReaper::new(system.store.clone(), Duration::from_secs(1));
    assert_eq!(reaper.reap_once().await.unwrap(), 0);
    assert!(system
        .store
        .lease_next(&queues, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    system.clock.advance(Duration::from_secs(31));
    let job = system.store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.attempt, 1);
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    let job = system.store.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Enqueued);
    assert_eq!(job.attempt, 1);
    assert!(job.lease_expires_at.is_none());

    let second = system
        .store
        .lease_next(&queues, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("Reaped job not re-leased");
    assert_eq!(second.id, id);
    assert_eq!(second.attempt, 2);

    // The reaped lease can no longer settle the job.
    assert!(matches!(
        system.store.ack(&id, first.attempt).await,
        Err(JobError::LeaseConflict(_))
    ));

    // Settled once; a repeated ack is rejected.
    system.store.ack(&id, second.attempt).await.unwrap();
    assert!(system.store.ack(&id, second.attempt).await.is_err());
}
