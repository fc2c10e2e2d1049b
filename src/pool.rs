//! Generic connection pooling with idle reaping and bounded acquire
//! waits.
//!
//! A connection is either in a caller's hands (guarded) or idle in the
//! pool, never both; the pool size never exceeds `max_connections`.
//! Acquires beyond the cap park in a FIFO queue and either receive a
//! connection handed over at release time or fail with a timeout.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering::Relaxed},
    },
    time::{Duration, Instant},
};

use futures::{channel::oneshot, future::BoxFuture, future::join_all};
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection acquire timeout after {0:?}")]
    AcquireTimeout(Duration),
    #[error("Connection pool is shut down")]
    ShutDown,
    #[error("Failed to create connection: {0}")]
    Factory(String),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Idle entries older than this are destroyed by the reaper.
    pub max_idle_time: Duration,
    pub acquire_timeout: Duration,
    pub reap_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_time: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Entry<T> {
    id: u64,
    value: T,
    created_at: Instant,
    last_used_at: Instant,
    request_count: u64,
}

#[derive(Debug)]
struct PoolState<T> {
    idle: Vec<Entry<T>>,
    /// Connections in callers' hands, including creations in flight.
    active: usize,
    waiters: VecDeque<oneshot::Sender<Entry<T>>>,
    next_id: u64,
    shut_down: bool,
}

impl<T> Default for PoolState<T> {
    fn default() -> Self {
        Self {
            idle: Vec::new(),
            active: 0,
            waiters: VecDeque::new(),
            next_id: 0,
            shut_down: false,
        }
    }
}

#[derive(Default)]
struct PoolCounters {
    total_created: AtomicU64,
    total_destroyed: AtomicU64,
    total_requests: AtomicU64,
    peak_connections: AtomicUsize,
    /// (ewma_ms, samples)
    wait: Mutex<(f64, u64)>,
}

impl PoolCounters {
    /// Exponentially weighted moving average, alpha = 0.1.
    fn record_wait(&self, waited: Duration) {
        let sample = waited.as_secs_f64() * 1000.0;
        let mut wait = self.wait.lock();
        let (avg, samples) = *wait;
        *wait = if samples == 0 {
            (sample, 1)
        } else {
            (avg * 0.9 + sample * 0.1, samples + 1)
        };
    }
}

/// Point-in-time view of the pool's counters and gauges.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolMetrics {
    pub total_created: u64,
    pub total_destroyed: u64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_requests: u64,
    pub waiting_requests: usize,
    pub average_wait_time_ms: f64,
    /// High-water mark for the process lifetime; never reset.
    pub peak_connections: usize,
}

type Destroyer<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ConnectionPool<T: Send + 'static> {
    state: Arc<Mutex<PoolState<T>>>,
    config: PoolConfig,
    counters: Arc<PoolCounters>,
    destroy: Destroyer<T>,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// A pool whose connections need no asynchronous teardown.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_destroyer(config, |value| {
            drop(value);
            Box::pin(async {})
        })
    }

    /// A pool that runs `destroy` for every connection it retires.
    pub fn with_destroyer<D>(config: PoolConfig, destroy: D) -> Self
    where
        D: Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let pool = Self {
            state: Arc::default(),
            config,
            counters: Arc::default(),
            destroy: Arc::new(destroy),
            reaper: Mutex::new(None),
        };
        pool.start_reaper();
        pool
    }

    fn start_reaper(&self) {
        let state = self.state.clone();
        let counters = self.counters.clone();
        let destroy = self.destroy.clone();
        let max_idle_time = self.config.max_idle_time;
        let reap_interval = self.config.reap_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(reap_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let now = Instant::now();
                let stale: Vec<Entry<T>> = {
                    let mut state = state.lock();
                    let (stale, keep) = state
                        .idle
                        .drain(..)
                        .partition(|entry| now.duration_since(entry.last_used_at) > max_idle_time);
                    state.idle = keep;
                    stale
                };
                if stale.is_empty() {
                    continue;
                }
                log::debug!("reaping {} idle connections", stale.len());
                counters
                    .total_destroyed
                    .fetch_add(stale.len() as u64, Relaxed);
                join_all(stale.into_iter().map(|entry| destroy(entry.value))).await;
            }
        });
        *self.reaper.lock() = Some(handle);
    }

    /// Acquires a connection: an idle one when available, a fresh one
    /// while under the cap, otherwise a FIFO wait bounded by
    /// `acquire_timeout`.
    pub async fn acquire<F, Fut>(&self, factory: F) -> Result<PoolGuard<T>, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        enum Plan<T> {
            Reuse(Entry<T>),
            Create,
            Wait(oneshot::Receiver<Entry<T>>),
        }

        let started = Instant::now();
        self.counters.total_requests.fetch_add(1, Relaxed);

        let plan = {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            if let Some(entry) = state.idle.pop() {
                state.active += 1;
                Plan::Reuse(entry)
            } else if state.active < self.config.max_connections {
                state.active += 1;
                Plan::Create
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Plan::Wait(rx)
            }
        };

        match plan {
            Plan::Reuse(entry) => {
                self.counters.record_wait(started.elapsed());
                Ok(self.guard(entry))
            }
            Plan::Create => match factory().await {
                Ok(value) => {
                    let entry = {
                        let mut state = self.state.lock();
                        let id = state.next_id;
                        state.next_id += 1;
                        let total = state.active + state.idle.len();
                        self.counters.peak_connections.fetch_max(total, Relaxed);
                        Entry {
                            id,
                            value,
                            created_at: Instant::now(),
                            last_used_at: Instant::now(),
                            request_count: 0,
                        }
                    };
                    self.counters.total_created.fetch_add(1, Relaxed);
                    self.counters.record_wait(started.elapsed());
                    Ok(self.guard(entry))
                }
                Err(err) => {
                    self.state.lock().active -= 1;
                    Err(PoolError::Factory(err.to_string()))
                }
            },
            Plan::Wait(rx) => {
                match tokio::time::timeout(self.config.acquire_timeout, rx).await {
                    Ok(Ok(entry)) => {
                        self.counters.record_wait(started.elapsed());
                        Ok(self.guard(entry))
                    }
                    Ok(Err(_closed)) => Err(PoolError::ShutDown),
                    Err(_elapsed) => {
                        // Release the queue slot so the releaser skips us.
                        self.state.lock().waiters.retain(|tx| !tx.is_canceled());
                        Err(PoolError::AcquireTimeout(self.config.acquire_timeout))
                    }
                }
            }
        }
    }

    fn guard(&self, entry: Entry<T>) -> PoolGuard<T> {
        PoolGuard {
            entry: Some(entry),
            state: self.state.clone(),
        }
    }

    /// Waits for every guard to come home, up to `drain_timeout`.
    pub async fn drain(&self) {
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            if self.state.lock().active == 0 {
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("pool drain timed out with connections still active");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stops the reaper, drains, destroys what is left, and rejects every
    /// queued waiter.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().take() {
            handle.abort();
        }
        self.drain().await;

        let (idle, waiters) = {
            let mut state = self.state.lock();
            state.shut_down = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        drop(waiters);

        if !idle.is_empty() {
            self.counters
                .total_destroyed
                .fetch_add(idle.len() as u64, Relaxed);
            let destroy = self.destroy.clone();
            join_all(idle.into_iter().map(|entry| destroy(entry.value))).await;
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let (active, idle, waiting) = {
            let state = self.state.lock();
            (
                state.active,
                state.idle.len(),
                state.waiters.iter().filter(|tx| !tx.is_canceled()).count(),
            )
        };
        PoolMetrics {
            total_created: self.counters.total_created.load(Relaxed),
            total_destroyed: self.counters.total_destroyed.load(Relaxed),
            active_connections: active,
            idle_connections: idle,
            total_requests: self.counters.total_requests.load(Relaxed),
            waiting_requests: waiting,
            average_wait_time_ms: self.counters.wait.lock().0,
            peak_connections: self.counters.peak_connections.load(Relaxed),
        }
    }

    /// Current pool size: connections out plus connections idle.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.active + state.idle.len()
    }
}

/// Exclusive use of one pooled connection. Releasing (or dropping) hands
/// the connection to the longest-waiting acquirer, or parks it idle.
#[derive(Debug)]
pub struct PoolGuard<T: Send + 'static> {
    entry: Option<Entry<T>>,
    state: Arc<Mutex<PoolState<T>>>,
}

impl<T: Send + 'static> PoolGuard<T> {
    pub fn id(&self) -> u64 {
        self.entry.as_ref().expect("guard not yet released").id
    }

    pub fn request_count(&self) -> u64 {
        self.entry
            .as_ref()
            .expect("guard not yet released")
            .request_count
    }

    pub fn created_at(&self) -> Instant {
        self.entry
            .as_ref()
            .expect("guard not yet released")
            .created_at
    }

    /// Returns the connection to the pool.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        entry.last_used_at = Instant::now();
        entry.request_count += 1;

        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(entry) {
                // Handed over; stays active on the waiter's behalf.
                Ok(()) => return,
                Err(returned) => entry = returned,
            }
        }
        state.active -= 1;
        state.idle.push(entry);
    }
}

impl<T: Send + 'static> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry.as_ref().expect("guard not yet released").value
    }
}

impl<T: Send + 'static> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.entry.as_mut().expect("guard not yet released").value
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, acquire_timeout: Duration) -> PoolConfig {
        PoolConfig {
            max_connections: max,
            acquire_timeout,
            ..Default::default()
        }
    }

    async fn make() -> anyhow::Result<u32> {
        Ok(7)
    }

    #[tokio::test]
    async fn reuses_idle_connections() {
        let pool = ConnectionPool::new(config(2, Duration::from_millis(50)));
        let first = pool.acquire(make).await.unwrap();
        let first_id = first.id();
        first.release();

        let second = pool.acquire(make).await.unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(second.request_count(), 1);
        assert_eq!(pool.metrics().total_created, 1);
    }

    #[tokio::test]
    async fn exhaustion_times_out_with_a_clear_error() {
        let pool = ConnectionPool::new(config(2, Duration::from_millis(50)));
        let _a = pool.acquire(make).await.unwrap();
        let _b = pool.acquire(make).await.unwrap();

        let err = pool.acquire(make).await.unwrap_err();
        assert!(err.to_string().contains("Connection acquire timeout"));
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.metrics().waiting_requests, 0);
    }

    #[tokio::test]
    async fn released_connections_serve_waiters_fifo() {
        let pool = Arc::new(ConnectionPool::new(config(1, Duration::from_secs(5))));
        let guard = pool.acquire(make).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(make).await.map(|g| g.id()) })
        };
        tokio::task::yield_now().await;

        let id = guard.id();
        guard.release();
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert_eq!(pool.metrics().total_created, 1);
    }

    #[tokio::test]
    async fn burst_never_exceeds_the_cap() {
        let pool = Arc::new(ConnectionPool::new(config(3, Duration::from_millis(200))));
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let guard = pool.acquire(make).await?;
                assert!(pool.size() <= 3);
                tokio::time::sleep(Duration::from_millis(10)).await;
                guard.release();
                Ok::<_, PoolError>(())
            }));
        }
        let outcomes = join_all(tasks).await;
        // Every acquirer either got a connection or a timeout error.
        for outcome in outcomes {
            match outcome.unwrap() {
                Ok(()) => {}
                Err(PoolError::AcquireTimeout(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(pool.metrics().peak_connections <= 3);
    }

    #[tokio::test]
    async fn factory_failures_free_the_slot() {
        let pool = ConnectionPool::new(config(1, Duration::from_millis(50)));
        let err = pool
            .acquire(|| async { Err::<u32, _>(anyhow::anyhow!("refused")) })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Factory(_)));

        // The failed creation must not occupy the only slot.
        let guard = pool.acquire(make).await.unwrap();
        assert_eq!(*guard, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_destroys_stale_idle_entries() {
        let destroyed = Arc::new(AtomicU64::new(0));
        let observed = destroyed.clone();
        let pool = ConnectionPool::with_destroyer(
            PoolConfig {
                max_connections: 2,
                max_idle_time: Duration::from_secs(1),
                reap_interval: Duration::from_secs(1),
                ..Default::default()
            },
            move |_conn: u32| {
                let destroyed = observed.clone();
                Box::pin(async move {
                    destroyed.fetch_add(1, Relaxed);
                })
            },
        );

        pool.acquire(make).await.unwrap().release();
        assert_eq!(pool.metrics().idle_connections, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;

        assert_eq!(destroyed.load(Relaxed), 1);
        let metrics = pool.metrics();
        assert_eq!(metrics.idle_connections, 0);
        assert_eq!(metrics.total_destroyed, 1);
    }

    #[tokio::test]
    async fn shutdown_balances_created_and_destroyed() {
        let pool = Arc::new(ConnectionPool::new(config(3, Duration::from_secs(1))));
        let a = pool.acquire(make).await.unwrap();
        let b = pool.acquire(make).await.unwrap();
        a.release();
        b.release();

        pool.shutdown().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.total_created - metrics.total_destroyed, 0);
        assert_eq!(pool.size(), 0);

        let err = pool.acquire(make).await.unwrap_err();
        assert!(matches!(err, PoolError::ShutDown));
    }

    #[tokio::test]
    async fn shutdown_rejects_queued_waiters() {
        let pool = Arc::new(ConnectionPool::new(config(1, Duration::from_secs(30))));
        let guard = pool.acquire(make).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(make).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.metrics().waiting_requests, 1);

        // Shutdown drains first; give the guard back from another task.
        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        drop(guard);
        shutdown.await.unwrap();

        match waiter.await.unwrap() {
            Err(PoolError::ShutDown) | Ok(()) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
