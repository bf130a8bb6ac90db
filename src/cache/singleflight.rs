//! Single-flight coordination.
//!
//! The first caller for a key becomes the owner and runs the real operation;
//! callers arriving while the owner is in flight wait for its completion and
//! receive their own copy of its result. The in-flight map is guarded by one
//! mutex that is only held for map operations.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::watch;
use tracing::trace;

use super::lock::mutex_lock;
use super::metric_names::SINGLEFLIGHT_WAITERS_TOTAL;
use super::outcome::CacheOutcome;

const SOURCE: &str = "cache::singleflight";

type Calls = Arc<Mutex<HashMap<String, Arc<Call>>>>;

/// In-flight call registry for one cache instance.
#[derive(Clone, Default)]
pub struct SingleFlight {
    calls: Calls,
}

struct Call {
    key: String,
    waiters: AtomicUsize,
    forgotten: AtomicBool,
    signal: watch::Sender<Option<Signal>>,
}

#[derive(Clone)]
enum Signal {
    Completed(Arc<Completion>),
    Abandoned,
}

/// Result published by an owner for its waiters.
pub struct Completion {
    outcome: CacheOutcome,
    rows_affected: u64,
    snapshot: Box<dyn Any + Send + Sync>,
}

impl Completion {
    pub fn outcome(&self) -> &CacheOutcome {
        &self.outcome
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// An independently owned copy of the owner's result.
    ///
    /// `None` if the owner published a different type.
    pub fn snapshot<S: Any + Clone>(&self) -> Option<S> {
        self.snapshot.downcast_ref::<S>().cloned()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("outcome", &self.outcome)
            .field("rows_affected", &self.rows_affected)
            .finish_non_exhaustive()
    }
}

/// Role assigned by [`SingleFlight::enter`].
pub enum Flight {
    Owner(FlightOwner),
    Waiter(FlightWaiter),
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register as owner of `key`, or join the call already in flight.
    pub fn enter(&self, key: &str) -> Flight {
        let mut calls = mutex_lock(&self.calls, SOURCE, "enter");

        if let Some(call) = calls.get(key) {
            call.waiters.fetch_add(1, Ordering::Relaxed);
            let receiver = call.signal.subscribe();
            drop(calls);

            counter!(SINGLEFLIGHT_WAITERS_TOTAL).increment(1);
            trace!(key, "joined in-flight call");
            return Flight::Waiter(FlightWaiter { receiver });
        }

        let (signal, _) = watch::channel(None);
        let call = Arc::new(Call {
            key: key.to_string(),
            waiters: AtomicUsize::new(0),
            forgotten: AtomicBool::new(false),
            signal,
        });
        calls.insert(key.to_string(), Arc::clone(&call));
        drop(calls);

        Flight::Owner(FlightOwner {
            calls: Arc::clone(&self.calls),
            call,
            finished: false,
        })
    }

    /// Detach the in-flight call for `key` so later callers start a new one.
    ///
    /// Waiters that already joined still receive the detached call's result.
    pub fn forget(&self, key: &str) -> bool {
        let removed = mutex_lock(&self.calls, SOURCE, "forget").remove(key);
        match removed {
            Some(call) => {
                call.forgotten.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// [`forget`](Self::forget) every call whose key starts with `prefix`.
    pub fn forget_prefix(&self, prefix: &str) -> usize {
        let mut calls = mutex_lock(&self.calls, SOURCE, "forget_prefix");
        let mut forgotten = 0;
        calls.retain(|key, call| {
            if key.starts_with(prefix) {
                call.forgotten.store(true, Ordering::Release);
                forgotten += 1;
                false
            } else {
                true
            }
        });
        forgotten
    }

    /// Number of calls currently registered.
    pub fn in_flight(&self) -> usize {
        mutex_lock(&self.calls, SOURCE, "in_flight").len()
    }
}

/// Handle held by the caller responsible for running the real operation.
///
/// The call stays registered until the handle is dropped. Dropping it before
/// [`release`](Self::release) or [`complete`](Self::complete) releases every
/// waiter with an abandoned signal so none of them blocks forever.
pub struct FlightOwner {
    calls: Calls,
    call: Arc<Call>,
    finished: bool,
}

impl FlightOwner {
    pub fn key(&self) -> &str {
        &self.call.key
    }

    pub fn waiters(&self) -> usize {
        self.call.waiters.load(Ordering::Relaxed)
    }

    /// True once a write detached this call with [`SingleFlight::forget`].
    ///
    /// Rows produced by a detached call may predate that write.
    pub fn is_forgotten(&self) -> bool {
        self.call.forgotten.load(Ordering::Acquire)
    }

    /// Publish a copy of `result` to every waiter without retiring the call.
    ///
    /// Callers joining before the owner is dropped receive the same result.
    /// Returns the number of waiters that joined so far.
    pub fn release<S>(&mut self, outcome: CacheOutcome, result: &S, rows_affected: u64) -> usize
    where
        S: Any + Clone + Send + Sync,
    {
        let completion = Completion {
            outcome,
            rows_affected,
            snapshot: Box::new(result.clone()),
        };
        self.call
            .signal
            .send_replace(Some(Signal::Completed(Arc::new(completion))));
        self.finished = true;
        self.waiters()
    }

    /// Publish a copy of `result` to every waiter and retire the call.
    ///
    /// Returns the number of waiters that joined this call.
    pub fn complete<S>(mut self, outcome: CacheOutcome, result: &S, rows_affected: u64) -> usize
    where
        S: Any + Clone + Send + Sync,
    {
        self.release(outcome, result, rows_affected)
    }

    fn retire(&self, op: &'static str) {
        if self.is_forgotten() {
            return;
        }
        let mut calls = mutex_lock(&self.calls, SOURCE, op);
        let ours = calls
            .get(&self.call.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.call));
        if ours {
            calls.remove(&self.call.key);
        }
    }
}

impl Drop for FlightOwner {
    fn drop(&mut self) {
        if self.finished {
            self.retire("complete");
            return;
        }
        self.call.signal.send_replace(Some(Signal::Abandoned));
        self.retire("abandon");
        trace!(key = %self.call.key, "in-flight call abandoned by its owner");
    }
}

impl fmt::Debug for FlightOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightOwner")
            .field("key", &self.call.key)
            .field("waiters", &self.waiters())
            .finish()
    }
}

/// Handle held by a caller that joined an in-flight call.
pub struct FlightWaiter {
    receiver: watch::Receiver<Option<Signal>>,
}

impl FlightWaiter {
    /// Block until the owner finishes.
    ///
    /// Returns `None` if the owner was dropped before completing.
    pub async fn wait(mut self) -> Option<Arc<Completion>> {
        let signal = match self.receiver.wait_for(Option::is_some).await {
            Ok(current) => current.clone(),
            Err(_) => None,
        };
        match signal {
            Some(Signal::Completed(completion)) => Some(completion),
            Some(Signal::Abandoned) | None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use tokio::sync::Barrier;

    use super::*;

    fn owner(flight: Flight) -> FlightOwner {
        match flight {
            Flight::Owner(owner) => owner,
            Flight::Waiter(_) => panic!("expected to own the call"),
        }
    }

    fn waiter(flight: Flight) -> FlightWaiter {
        match flight {
            Flight::Waiter(waiter) => waiter,
            Flight::Owner(_) => panic!("expected to join the call"),
        }
    }

    #[tokio::test]
    async fn second_caller_waits_for_owner_result() {
        let flights = SingleFlight::new();
        let first = owner(flights.enter("k"));
        let second = waiter(flights.enter("k"));
        assert_eq!(first.waiters(), 1);

        let released = first.complete(CacheOutcome::Miss, &vec![1_u32, 2, 3], 3);
        assert_eq!(released, 1);
        assert_eq!(flights.in_flight(), 0);

        let completion = second.wait().await.expect("owner completed");
        assert_eq!(completion.outcome(), &CacheOutcome::Miss);
        assert_eq!(completion.rows_affected(), 3);
        assert_eq!(completion.snapshot::<Vec<u32>>(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn waiters_receive_independent_copies() {
        let flights = SingleFlight::new();
        let first = owner(flights.enter("k"));
        let a = waiter(flights.enter("k"));
        let b = waiter(flights.enter("k"));

        let mut result = vec![String::from("row")];
        first.complete(CacheOutcome::Miss, &result, 1);
        result[0].push_str("-mutated-by-owner");

        let mut copy_a: Vec<String> = a.wait().await.unwrap().snapshot().unwrap();
        copy_a[0].push_str("-mutated-by-a");
        let copy_b: Vec<String> = b.wait().await.unwrap().snapshot().unwrap();

        assert_eq!(copy_b, vec![String::from("row")]);
    }

    #[tokio::test]
    async fn mismatched_snapshot_type_is_none() {
        let flights = SingleFlight::new();
        let first = owner(flights.enter("k"));
        let second = waiter(flights.enter("k"));
        first.complete(CacheOutcome::Miss, &42_u64, 1);

        let completion = second.wait().await.unwrap();
        assert_eq!(completion.snapshot::<String>(), None);
    }

    #[tokio::test]
    async fn dropped_owner_releases_waiters() {
        let flights = SingleFlight::new();
        let first = owner(flights.enter("k"));
        let second = waiter(flights.enter("k"));

        drop(first);

        assert!(second.wait().await.is_none());
        assert_eq!(flights.in_flight(), 0);
        assert!(matches!(flights.enter("k"), Flight::Owner(_)));
    }

    #[tokio::test]
    async fn forget_starts_a_fresh_cycle_without_orphaning() {
        let flights = SingleFlight::new();
        let stale = owner(flights.enter("k"));
        let stale_waiter = waiter(flights.enter("k"));

        assert!(flights.forget("k"));
        assert!(!flights.forget("k"));

        let fresh = owner(flights.enter("k"));
        let fresh_waiter = waiter(flights.enter("k"));

        stale.complete(CacheOutcome::Miss, &"old", 1);
        assert_eq!(flights.in_flight(), 1, "stale owner must not retire the fresh call");
        assert_eq!(
            stale_waiter.wait().await.unwrap().snapshot::<&str>(),
            Some("old")
        );

        fresh.complete(CacheOutcome::Miss, &"new", 1);
        assert_eq!(
            fresh_waiter.wait().await.unwrap().snapshot::<&str>(),
            Some("new")
        );
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn released_call_serves_late_joiners_until_dropped() {
        let flights = SingleFlight::new();
        let mut first = owner(flights.enter("k"));

        assert_eq!(first.release(CacheOutcome::Miss, &7_u64, 1), 0);
        assert_eq!(flights.in_flight(), 1);

        let late = waiter(flights.enter("k"));
        assert_eq!(late.wait().await.unwrap().snapshot::<u64>(), Some(7));

        drop(first);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn owner_observes_being_forgotten() {
        let flights = SingleFlight::new();
        let first = owner(flights.enter("ns:s:orders:q1"));
        assert!(!first.is_forgotten());

        flights.forget_prefix("ns:s:orders:");

        assert!(first.is_forgotten());
    }

    #[tokio::test]
    async fn forget_prefix_only_detaches_matching_calls() {
        let flights = SingleFlight::new();
        let _orders = owner(flights.enter("ns:s:orders:q1"));
        let _users = owner(flights.enter("ns:s:users:q1"));

        assert_eq!(flights.forget_prefix("ns:s:orders:"), 1);
        assert_eq!(flights.in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_execution() {
        const CALLERS: usize = 32;

        let flights = SingleFlight::new();
        let executions = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(CALLERS));

        let mut handles = Vec::with_capacity(CALLERS);
        for _ in 0..CALLERS {
            let flights = flights.clone();
            let executions = Arc::clone(&executions);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                match flights.enter("shared") {
                    Flight::Owner(owner) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        executions.fetch_add(1, Ordering::SeqCst);
                        let rows = vec![7_u64];
                        owner.complete(CacheOutcome::Miss, &rows, 1);
                        rows
                    }
                    Flight::Waiter(waiter) => waiter
                        .wait()
                        .await
                        .and_then(|completion| completion.snapshot::<Vec<u64>>())
                        .expect("owner completes"),
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![7]);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }
}
