use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::join_all;
use rowcache::cache::{CacheConfig, CacheOutcome, CacheableRow, QueryCache, ReadContext};
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    id: u64,
    tags: Vec<String>,
}

impl CacheableRow for Account {
    fn primary_key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DbError(&'static str);

const READERS: usize = 24;

fn by_owner(owner: u64) -> ReadContext<Account, DbError> {
    ReadContext::new("accounts", "SELECT * FROM accounts WHERE owner = ?").bind(owner)
}

fn cache(config: CacheConfig) -> QueryCache {
    QueryCache::with_memory_store(config).expect("valid cache config")
}

/// Run `READERS` identical reads released at the same instant.
async fn concurrent_reads(
    cache: &QueryCache,
    executions: &Arc<AtomicU32>,
    result: Result<Vec<Account>, DbError>,
) -> Vec<ReadContext<Account, DbError>> {
    let barrier = Arc::new(Barrier::new(READERS));
    let tasks = (0..READERS).map(|_| {
        let cache = cache.clone();
        let executions = Arc::clone(executions);
        let barrier = Arc::clone(&barrier);
        let result = result.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            cache
                .query(by_owner(1), || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    result
                })
                .await
        })
    });

    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.expect("reader task"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_reads_execute_once() {
    let cache = cache(CacheConfig::default());
    let executions = Arc::new(AtomicU32::new(0));
    let rows = vec![Account {
        id: 1,
        tags: vec!["gold".to_string()],
    }];

    let reads = concurrent_reads(&cache, &executions, Ok(rows.clone())).await;

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    let owners = reads
        .iter()
        .filter(|ctx| ctx.outcome() == &CacheOutcome::Miss)
        .count();
    assert_eq!(owners, 1);
    assert!(reads.iter().all(|ctx| {
        ctx.outcome() == &CacheOutcome::Miss
            || ctx.outcome() == &CacheOutcome::single_flight(CacheOutcome::Miss)
    }));

    let mut results: Vec<Vec<Account>> = reads
        .into_iter()
        .map(|ctx| ctx.into_result().expect("rows"))
        .collect();
    assert!(results.iter().all(|result| result == &rows));

    // each caller owns its copy
    results[0][0].tags.push("mutated".to_string());
    assert!(results[1..].iter().all(|result| result == &rows));

    assert_eq!(cache.single_flight().in_flight(), 0);
    assert_eq!(cache.lookup_count(), READERS as u64);
    assert_eq!(cache.miss_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn owner_error_is_propagated_verbatim() {
    let cache = cache(CacheConfig::default());
    let executions = Arc::new(AtomicU32::new(0));

    let reads = concurrent_reads(&cache, &executions, Err(DbError("deadlock detected"))).await;

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    for ctx in reads {
        assert_eq!(ctx.outcome().origin(), &CacheOutcome::Error);
        assert_eq!(ctx.into_result(), Err(DbError("deadlock detected")));
    }

    // errors are never cached
    let retry = cache
        .query(by_owner(1), || async { Ok(Vec::new()) })
        .await;
    assert_eq!(retry.outcome(), &CacheOutcome::Miss);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn later_reads_hit_the_cache_instead_of_the_flight() {
    let cache = cache(CacheConfig::default());
    let executions = Arc::new(AtomicU32::new(0));
    let rows = vec![Account {
        id: 2,
        tags: Vec::new(),
    }];

    concurrent_reads(&cache, &executions, Ok(rows.clone())).await;
    let later = cache
        .query(by_owner(1), || async { Err(DbError("should not run")) })
        .await;

    assert_eq!(later.outcome(), &CacheOutcome::SearchHit);
    assert_eq!(later.into_result(), Ok(rows));
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_parameters_do_not_coalesce() {
    let cache = cache(CacheConfig::default());
    let executions = Arc::new(AtomicU32::new(0));

    let tasks = (0..4_u64).map(|owner| {
        let cache = cache.clone();
        let executions = Arc::clone(&executions);
        tokio::spawn(async move {
            cache
                .query(by_owner(owner), || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(vec![Account {
                        id: owner,
                        tags: Vec::new(),
                    }])
                })
                .await
                .into_result()
        })
    });

    for (owner, joined) in join_all(tasks).await.into_iter().enumerate() {
        let rows = joined.expect("reader task").expect("rows");
        assert_eq!(rows[0].id, owner as u64);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 4);
}
