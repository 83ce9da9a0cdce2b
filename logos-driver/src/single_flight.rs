//! Single-flight coalescing of one asynchronous call.
//!
//! ```text
//!            get()                 Ok(value)
//!   Idle ───────────► Pending ───────────────► Settled(value)
//!    ▲  ▲                │                          │
//!    │  │     Err(_)     │ reset()      reset()     │
//!    │  └────────────────┼──────────────────────────┘
//!    │                   ▼
//!    └─────────────── Stale   (call settles, outcome discarded)
//! ```
//!
//! Concurrent callers while `Pending` await the same shared future. A failed
//! call drops back to `Idle` before any waiter sees the error, so a retry
//! issued from inside a failure handler always starts a fresh call.
//!
//! A reset while a call is running leaves it `Stale`: callers arriving then
//! wait for that call to finish and only afterwards start a new one, so at
//! most one call ever runs at a time.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::Result;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T>>>;
type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

enum FlightState<T> {
    Idle,
    Pending { call: SharedCall<T>, generation: u64 },
    Stale { call: SharedCall<T>, generation: u64 },
    Settled(T),
}

struct Inner<T> {
    state: FlightState<T>,
    /// Bumped on every new call; a settling call only writes back while the
    /// state still refers to its generation.
    generation: u64,
}

/// Memoizes one in-flight asynchronous operation.
///
/// Successful results are cached until [`SingleFlight::reset`]; failures
/// are never cached.
pub struct SingleFlight<T> {
    operation: Operation<T>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap a zero-argument async operation.
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            operation: Arc::new(move || operation().boxed()),
            inner: Arc::new(Mutex::new(Inner {
                state: FlightState::Idle,
                generation: 0,
            })),
        }
    }

    /// Return the cached value, join the pending call, or start a new one.
    ///
    /// If the running call was reset, wait for it to finish first and then
    /// start (or join) a fresh one.
    pub async fn get(&self) -> Result<T> {
        loop {
            let (call, stale) = {
                let mut inner = lock(&self.inner);
                match &inner.state {
                    FlightState::Settled(value) => return Ok(value.clone()),
                    FlightState::Pending { call, .. } => (call.clone(), false),
                    FlightState::Stale { call, .. } => (call.clone(), true),
                    FlightState::Idle => {
                        inner.generation += 1;
                        let generation = inner.generation;
                        let call = self.start(generation);
                        inner.state = FlightState::Pending {
                            call: call.clone(),
                            generation,
                        };
                        (call, false)
                    }
                }
            };
            if !stale {
                return call.await;
            }
            // outcome belongs to a reset generation
            let _ = call.await;
        }
    }

    /// Forget any cached or pending outcome.
    ///
    /// Callers already awaiting a pending call still receive its outcome,
    /// but that outcome will not be cached.
    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        inner.state = match std::mem::replace(&mut inner.state, FlightState::Idle) {
            FlightState::Pending { call, generation } | FlightState::Stale { call, generation } => {
                FlightState::Stale { call, generation }
            }
            FlightState::Idle | FlightState::Settled(_) => FlightState::Idle,
        };
    }

    /// A call is currently in flight, current or stale.
    pub fn is_pending(&self) -> bool {
        matches!(
            lock(&self.inner).state,
            FlightState::Pending { .. } | FlightState::Stale { .. }
        )
    }

    /// A successful result is cached.
    pub fn is_settled(&self) -> bool {
        matches!(lock(&self.inner).state, FlightState::Settled(_))
    }

    /// The cached value, if any, without starting a call.
    pub fn cached(&self) -> Option<T> {
        match &lock(&self.inner).state {
            FlightState::Settled(value) => Some(value.clone()),
            _ => None,
        }
    }

    fn start(&self, generation: u64) -> SharedCall<T> {
        let call = (self.operation)();
        let inner: Weak<Mutex<Inner<T>>> = Arc::downgrade(&self.inner);
        async move {
            let outcome = call.await;
            if let Some(inner) = inner.upgrade() {
                let mut inner = lock(&inner);
                let (current, stale) = match &inner.state {
                    FlightState::Pending { generation: g, .. } => (*g == generation, false),
                    FlightState::Stale { generation: g, .. } => (*g == generation, true),
                    _ => (false, false),
                };
                if current {
                    inner.state = match (&outcome, stale) {
                        (Ok(value), false) => FlightState::Settled(value.clone()),
                        _ => FlightState::Idle,
                    };
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match lock(&self.inner).state {
            FlightState::Idle => "idle",
            FlightState::Pending { .. } => "pending",
            FlightState::Stale { .. } => "stale",
            FlightState::Settled(_) => "settled",
        };
        f.debug_struct("SingleFlight").field("state", &state).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
