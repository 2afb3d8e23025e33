//! End-to-end scheduler runs against a scripted verifier on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ScriptedVerifier, fast_scheduler, item, token, tuning};
use verifyq::engine::{Engine, Scheduler, SchedulerConfig};
use verifyq::model::Outcome;

async fn engine_with(
    batch_size: usize,
    max_retries: u32,
    token_limit: u32,
    items: &[&str],
    tokens: &[&str],
) -> Engine {
    let engine = Engine::in_memory(tuning(batch_size, max_retries, token_limit))
        .await
        .unwrap();
    engine.queue.ingest(items.iter().copied()).await.unwrap();
    for t in tokens {
        engine.pool.feed(t).await.unwrap();
    }
    engine
}

fn scheduler(
    engine: &Engine,
    verifier: &Arc<ScriptedVerifier>,
    config: SchedulerConfig,
) -> Scheduler<ScriptedVerifier> {
    Scheduler::new(
        Arc::clone(&engine.queue),
        Arc::clone(&engine.pool),
        Arc::clone(verifier),
        config,
    )
}

#[tokio::test(start_paused = true)]
async fn batch_waits_for_replacement_token() {
    let engine = engine_with(3, 3, 2, &["a", "b", "c"], &["t1"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Positive));
    let sched = scheduler(&engine, &verifier, fast_scheduler(3));

    let pool = Arc::clone(&engine.pool);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        pool.feed("t2").await.unwrap();
    });

    let started = tokio::time::Instant::now();
    let summary = sched.run().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));

    assert!(!summary.stopped);
    assert_eq!(summary.committed, 3);
    assert_eq!(summary.attempts, 3);
    assert_eq!(engine.queue.positives().await, vec![item("a"), item("b"), item("c")]);
    assert!(engine.queue.is_drained().await);

    let calls = verifier.calls();
    let used_t1 = calls.iter().filter(|(_, t)| t == "t1").count();
    let used_t2 = calls.iter().filter(|(_, t)| t == "t2").count();
    assert_eq!((used_t1, used_t2), (2, 1));

    assert_eq!(engine.pool.usage(&token("t1")).await, None);
    assert_eq!(engine.pool.usage(&token("t2")).await, Some((1, 2)));
}

#[tokio::test(start_paused = true)]
async fn rejected_token_is_retired_and_item_retried() {
    let engine = engine_with(1, 3, 10, &["x"], &["t1", "t2"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Positive).script(
        "x",
        [Outcome::AuthInvalid, Outcome::Transient, Outcome::Positive],
    ));
    let summary = scheduler(&engine, &verifier, fast_scheduler(1))
        .run()
        .await
        .unwrap();

    let tokens: Vec<String> = verifier.calls().into_iter().map(|(_, t)| t).collect();
    assert_eq!(tokens, vec!["t1", "t2", "t2"]);
    assert_eq!(summary.requeued, 2);
    assert_eq!(summary.committed, 1);
    assert_eq!(engine.queue.positives().await, vec![item("x")]);
    assert_eq!(engine.queue.retry_count(&item("x")).await, None);
    assert_eq!(engine.pool.usage(&token("t1")).await, None);
    assert_eq!(engine.pool.usage(&token("t2")).await, Some((1, 10)));
}

#[tokio::test(start_paused = true)]
async fn retries_are_bounded_and_end_negative() {
    let engine = engine_with(1, 2, 100, &["flaky"], &["t1"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Transient));
    let summary = scheduler(&engine, &verifier, fast_scheduler(1))
        .run()
        .await
        .unwrap();

    assert_eq!(verifier.calls_for("flaky"), 3);
    assert_eq!(summary.exhausted, 1);
    assert_eq!(summary.requeued, 2);
    assert_eq!(engine.queue.negatives().await, vec![item("flaky")]);
    assert_eq!(engine.queue.retry_count(&item("flaky")).await, None);
    // Inconclusive checks never spend token budget.
    assert_eq!(engine.pool.usage(&token("t1")).await, Some((0, 100)));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_items_share_the_retry_budget() {
    let engine = engine_with(1, 1, 100, &["busy"], &["t1"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::RateLimited));
    let summary = scheduler(&engine, &verifier, fast_scheduler(1))
        .run()
        .await
        .unwrap();

    assert_eq!(verifier.calls_for("busy"), 2);
    assert_eq!(summary.exhausted, 1);
    assert_eq!(engine.queue.negatives().await, vec![item("busy")]);
}

#[tokio::test(start_paused = true)]
async fn failed_streak_triggers_cooldown() {
    let engine = engine_with(1, 5, 100, &["down"], &["t1"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::ServerError));
    let config = SchedulerConfig {
        failure_threshold: 2,
        ..fast_scheduler(1)
    };

    let started = tokio::time::Instant::now();
    let summary = scheduler(&engine, &verifier, config).run().await.unwrap();

    assert_eq!(verifier.calls_for("down"), 6);
    assert_eq!(summary.cooldowns, 2);
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(engine.queue.negatives().await, vec![item("down")]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_lets_in_flight_checks_finish() {
    let engine = engine_with(2, 3, 100, &["a", "b", "c", "d", "e"], &["t1"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Positive).latency(Duration::from_secs(10)));
    let sched = scheduler(&engine, &verifier, fast_scheduler(2));

    let runner = sched.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    sched.shutdown();

    let summary = handle.await.unwrap().unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.batches, 1);
    assert_eq!(engine.queue.positives().await, vec![item("a"), item("b")]);

    let counts = engine.queue.counts().await;
    assert_eq!(counts.claimed, 0);
    assert_eq!(counts.pending, 3);
    assert_eq!(summary.counts, counts);
}

#[tokio::test(start_paused = true)]
async fn unpaired_items_are_released_without_a_retry_charge() {
    let engine = engine_with(2, 3, 1, &["a", "b"], &["t1"]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Positive));
    let sched = scheduler(&engine, &verifier, fast_scheduler(2));

    let runner = sched.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // Past the 30s wait ceiling of the first batch; the second batch is
    // now waiting on "b" with no tokens left.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(engine.queue.positives().await, vec![item("a")]);
    assert_eq!(engine.queue.retry_count(&item("b")).await, None);

    sched.shutdown();
    let summary = handle.await.unwrap().unwrap();
    assert!(summary.stopped);
    assert_eq!(verifier.calls_for("b"), 0);

    let counts = engine.queue.counts().await;
    assert_eq!((counts.pending, counts.claimed), (1, 0));
}

#[tokio::test(start_paused = true)]
async fn stop_while_waiting_for_tokens_releases_claims() {
    let engine = engine_with(3, 3, 5, &["a", "b"], &[]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Positive));
    let sched = scheduler(&engine, &verifier, fast_scheduler(3));

    let runner = sched.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.queue.counts().await.claimed, 2);

    sched.shutdown();
    let summary = handle.await.unwrap().unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.attempts, 0);
    assert!(verifier.calls().is_empty());

    let counts = engine.queue.counts().await;
    assert_eq!((counts.pending, counts.claimed, counts.committed()), (2, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn every_item_ends_in_exactly_one_result_set() {
    let names: Vec<String> = (0..20).map(|i| format!("item-{i:02}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let engine = engine_with(4, 3, 100, &refs, &["t1", "t2", "t3", "t4"]).await;

    let verifier = ScriptedVerifier::new(Outcome::Positive)
        .script("item-01", [Outcome::Negative])
        .script("item-02", [Outcome::Transient, Outcome::Negative])
        .script("item-03", [Outcome::AuthInvalid, Outcome::Positive])
        .script("item-04", [Outcome::RateLimited, Outcome::ServerError])
        .script("item-05", [Outcome::Transient; 4]);
    let verifier = Arc::new(verifier);
    let summary = scheduler(&engine, &verifier, fast_scheduler(4))
        .run()
        .await
        .unwrap();

    let positives = engine.queue.positives().await;
    let negatives = engine.queue.negatives().await;
    assert_eq!(positives.len() + negatives.len(), 20);
    assert!(positives.iter().all(|p| !negatives.contains(p)));
    assert_eq!(negatives, vec![item("item-01"), item("item-02"), item("item-05")]);

    let counts = engine.queue.counts().await;
    assert!(counts.is_complete());
    assert_eq!(counts.total(), 20);
    assert_eq!(summary.committed, 20);
    assert_eq!(summary.exhausted, 1);
    assert_eq!(engine.pool.len().await, 3);
}

#[tokio::test(start_paused = true)]
async fn mixed_batch_waits_the_degraded_delay() {
    let names = ["i0", "i1", "i2", "i3", "i4", "i5", "i6", "i7"];
    let engine = engine_with(4, 3, 100, &names, &["t1", "t2"]).await;
    let verifier = Arc::new(
        ScriptedVerifier::new(Outcome::Positive)
            .script("i1", [Outcome::Transient])
            .script("i2", [Outcome::ServerError])
            .script("i3", [Outcome::RateLimited]),
    );
    scheduler(&engine, &verifier, fast_scheduler(4))
        .run()
        .await
        .unwrap();

    let started = |item: &str| {
        verifier
            .start_times()
            .into_iter()
            .find(|(i, _)| i == item)
            .map(|(_, at)| at)
            .unwrap()
    };
    // Batch 1 (i0..i3) has one success in four; batch 2 (i4..i7) is clean.
    let degraded_gap = started("i4") - started("i0");
    assert!(degraded_gap >= Duration::from_millis(50), "{degraded_gap:?}");
    assert!(degraded_gap < Duration::from_millis(100), "{degraded_gap:?}");

    let retried = verifier
        .start_times()
        .into_iter()
        .filter(|(i, _)| i == "i1")
        .map(|(_, at)| at)
        .last()
        .unwrap();
    let healthy_gap = retried - started("i4");
    assert!(healthy_gap >= Duration::from_millis(10), "{healthy_gap:?}");
    assert!(healthy_gap < Duration::from_millis(50), "{healthy_gap:?}");

    assert_eq!(engine.queue.positives().await.len(), 8);
}

#[tokio::test(start_paused = true)]
async fn batches_without_tokens_count_toward_cooldown() {
    let engine = engine_with(2, 3, 5, &["a", "b"], &[]).await;
    let verifier = Arc::new(ScriptedVerifier::new(Outcome::Positive));
    let config = SchedulerConfig {
        failure_threshold: 2,
        ..fast_scheduler(2)
    };
    let sched = scheduler(&engine, &verifier, config);

    let runner = sched.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // Two 30s token waits, then the 60s cooldown starts; nothing is claimed
    // while it runs.
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(engine.queue.counts().await.claimed, 0);

    sched.shutdown();
    let summary = handle.await.unwrap().unwrap();
    assert!(summary.stopped);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.cooldowns, 1);
    assert_eq!(summary.attempts, 0);
    assert!(verifier.calls().is_empty());
    assert_eq!(engine.queue.counts().await.pending, 2);
}
