//! Integration tests for the token pool.

mod common;

use std::sync::Arc;

use common::token;
use verifyq::pool::{Admission, DEFAULT_USAGE_LIMITS, Settled, TokenPool};
use verifyq::storage::{FileStore, KeySetStore, MemoryStore, RetryPolicy, Stores};

fn pool_with_limit(limit: u32) -> (TokenPool, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let pool = TokenPool::new(
        Arc::clone(&store) as Arc<dyn KeySetStore>,
        limit..=limit,
        RetryPolicy::default(),
    );
    (pool, store)
}

#[tokio::test]
async fn acquire_rotates_round_robin() {
    let (pool, _) = pool_with_limit(10);
    pool.admit(["t1", "t2", "t3"]).await;

    let mut order = Vec::new();
    for _ in 0..4 {
        let lease = pool.acquire().await.unwrap();
        order.push(lease.token().expose().to_string());
        pool.release(lease).await;
    }
    assert_eq!(order, vec!["t1", "t2", "t3", "t1"]);
}

#[tokio::test]
async fn token_retires_when_budget_is_spent() {
    let (pool, store) = pool_with_limit(2);
    pool.feed("t1").await.unwrap();
    pool.refresh().await.unwrap();

    let lease = pool.acquire().await.unwrap();
    assert_eq!(
        pool.record_success(lease).await.unwrap(),
        Settled::Active { usage: 1, limit: 2 }
    );
    let lease = pool.acquire().await.unwrap();
    assert_eq!(pool.record_success(lease).await.unwrap(), Settled::Retired);

    assert!(pool.acquire().await.is_none());
    assert!(pool.is_empty().await);
    assert!(store.list().unwrap().is_empty());
}

#[tokio::test]
async fn leases_reserve_budget_while_in_flight() {
    let (pool, _) = pool_with_limit(2);
    pool.admit(["t1"]).await;

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert!(pool.acquire().await.is_none());
    assert_eq!(pool.available().await, 0);

    pool.release(first).await;
    assert_eq!(pool.available().await, 1);
    pool.release(second).await;
    assert_eq!(pool.usage(&token("t1")).await, Some((0, 2)));
}

#[tokio::test]
async fn invalid_token_retires_immediately_and_stays_retired() {
    let (pool, store) = pool_with_limit(5);
    pool.feed("bad").await.unwrap();
    pool.feed("good").await.unwrap();
    pool.refresh().await.unwrap();

    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.token().expose(), "bad");
    let also_bad = pool.acquire().await.unwrap();
    assert_eq!(also_bad.token().expose(), "good");
    pool.release(also_bad).await;

    assert_eq!(pool.record_invalid(lease).await.unwrap(), Settled::Retired);
    assert_eq!(store.list().unwrap(), vec!["good"]);

    // A stale producer write cannot resurrect it.
    store.append("bad").unwrap();
    assert_eq!(pool.refresh().await.unwrap(), Admission::Admitted(0));
    for _ in 0..3 {
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.token().expose(), "good");
        pool.release(lease).await;
    }
}

#[tokio::test]
async fn retiring_twice_is_a_no_op() {
    let (pool, _) = pool_with_limit(5);
    pool.admit(["t1"]).await;

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.record_invalid(first).await.unwrap(), Settled::Retired);
    assert_eq!(pool.record_invalid(second).await.unwrap(), Settled::Stale);
    assert_eq!(pool.len().await, 0);
}

#[tokio::test]
async fn settling_after_retirement_is_stale() {
    let (pool, _) = pool_with_limit(5);
    pool.admit(["t1"]).await;
    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();

    pool.record_invalid(first).await.unwrap();
    assert_eq!(pool.record_success(second).await.unwrap(), Settled::Stale);
}

#[tokio::test]
async fn empty_admission_into_empty_pool_reports_exhausted() {
    let (pool, _) = pool_with_limit(5);
    assert_eq!(pool.admit(Vec::<String>::new()).await, Admission::Exhausted);
    assert_eq!(pool.refresh().await.unwrap(), Admission::Exhausted);

    pool.admit(["t1"]).await;
    assert_eq!(pool.admit(Vec::<String>::new()).await, Admission::Admitted(0));
}

#[tokio::test]
async fn admission_ignores_known_and_malformed_tokens() {
    let (pool, _) = pool_with_limit(5);
    assert_eq!(pool.admit(["t1", "t2"]).await, Admission::Admitted(2));
    assert_eq!(
        pool.admit(["t1", "has space", "t3"]).await,
        Admission::Admitted(1)
    );
    assert_eq!(pool.len().await, 3);
}

#[tokio::test]
async fn default_limits_fall_in_range() {
    let pool = TokenPool::new(
        Arc::new(MemoryStore::new()),
        DEFAULT_USAGE_LIMITS,
        RetryPolicy::default(),
    );
    let names: Vec<String> = (0..50).map(|i| format!("tok-{i}")).collect();
    pool.admit(&names).await;

    for name in &names {
        let (usage, limit) = pool.usage(&token(name)).await.unwrap();
        assert_eq!(usage, 0);
        assert!((5..=7).contains(&limit), "limit {limit} out of range");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_successes_never_exceed_the_limit() {
    let (pool, _) = pool_with_limit(7);
    let pool = Arc::new(pool);
    pool.admit(["shared"]).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            match pool.acquire().await {
                Some(lease) => Some(pool.record_success(lease).await.unwrap()),
                None => None,
            }
        }));
    }

    let mut credited = 0;
    let mut retired = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Some(Settled::Active { .. }) => credited += 1,
            Some(Settled::Retired) => retired += 1,
            Some(Settled::Stale) => panic!("lease outlived its token"),
            None => {}
        }
    }
    assert_eq!(credited + retired, 7);
    assert_eq!(retired, 1);
    assert!(pool.acquire().await.is_none());
}

#[tokio::test]
async fn retiring_keeps_tokens_fed_by_another_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(Stores::TOKENS_FILE);
    let pool = TokenPool::new(
        Arc::new(FileStore::open(&path).unwrap()),
        1..=1,
        RetryPolicy::default(),
    );
    pool.feed("t1").await.unwrap();
    pool.refresh().await.unwrap();
    let lease = pool.acquire().await.unwrap();

    // Producer with its own handle, writing while the lease is out.
    FileStore::open(&path).unwrap().append("t2").unwrap();

    assert_eq!(pool.record_success(lease).await.unwrap(), Settled::Retired);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "t2\n");
    assert_eq!(pool.refresh().await.unwrap(), Admission::Admitted(1));
}
