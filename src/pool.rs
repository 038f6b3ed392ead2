//! Pool of long-lived workers.
//!
//! Workers are created lazily, at most one per released concurrency token, and
//! handed out one task at a time. A worker comes back to the idle list after
//! its task unless the task failed in a way that makes the worker untrustworthy
//! (see [`StryxError::is_worker_fatal`]) or the worker itself asks to be
//! recycled; in that case it is disposed and its token becomes free for a
//! fresh worker on the next demand.
//!
//! ```text
//!   schedule ──> idle worker? ──yes──> run task ──> checkin ──> idle
//!                    │ no                              │ fatal / not reusable
//!                    v                                 v
//!              free token? ──yes──> create         dispose, free token
//!                    │ no
//!                    v
//!              wait for checkin or new token
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::concurrency::{ConcurrencyToken, TokenStream};
use crate::error::{Result, StryxError};

/// A worker that can live in a [`ResourcePool`].
pub trait Resource: Send + Sync + 'static {
    /// Whether the worker may serve another task.
    fn is_reusable(&self) -> bool {
        true
    }

    /// Release the worker. Must not hang indefinitely.
    fn dispose(&self) -> impl Future<Output = ()> + Send;
}

/// Creates workers for a pool.
pub trait ResourceFactory<T>: Send + Sync + 'static {
    fn create(&self, token: ConcurrencyToken) -> impl Future<Output = Result<T>> + Send;
}

/// Counters describing a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub disposed: usize,
    pub idle: usize,
    pub busy: usize,
}

struct Pooled<T> {
    token: ConcurrencyToken,
    resource: Arc<T>,
}

struct PoolState<T> {
    idle: Vec<Pooled<T>>,
    /// Tokens held by a live worker (idle, busy or being created).
    live_tokens: BTreeSet<ConcurrencyToken>,
    busy: usize,
    disposed: bool,
    created: usize,
    destroyed: usize,
}

struct PoolInner<T, F> {
    name: &'static str,
    factory: F,
    tokens: TokenStream,
    state: Mutex<PoolState<T>>,
    /// Signalled whenever a worker or a token becomes available.
    changed: Notify,
}

/// Generic worker pool; cheap to clone.
pub struct ResourcePool<T, F> {
    inner: Arc<PoolInner<T, F>>,
}

impl<T, F> Clone for ResourcePool<T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Acquire<T> {
    Reuse(Pooled<T>),
    Create(ConcurrencyToken),
    Wait,
}

impl<T: Resource, F: ResourceFactory<T>> ResourcePool<T, F> {
    pub fn new(name: &'static str, factory: F, tokens: TokenStream) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                factory,
                tokens,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    live_tokens: BTreeSet::new(),
                    busy: 0,
                    disposed: false,
                    created: 0,
                    destroyed: 0,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            created: state.created,
            disposed: state.destroyed,
            idle: state.idle.len(),
            busy: state.busy,
        }
    }

    /// Run `task` on a worker from the pool.
    ///
    /// Waits until a worker is idle or a token allows creating one. The task's
    /// result is returned as is; a worker-fatal error retires the worker.
    pub async fn schedule<R, Fut, Task>(&self, task: Task) -> Result<R>
    where
        Task: FnOnce(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let (lease, resource) = self.checkout().await?;
        let result = task(resource).await;
        let reusable = !matches!(&result, Err(e) if e.is_worker_fatal());
        lease.release(reusable).await;
        result
    }

    /// Stop serving and dispose every worker.
    ///
    /// Idle workers are disposed right away; busy ones once their task settles.
    /// Returns when no worker is alive anymore.
    pub async fn dispose(&self) {
        let idle = {
            let mut state = self.lock();
            state.disposed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.changed.notify_waiters();

        if !idle.is_empty() {
            debug!(pool = self.name(), count = idle.len(), "Disposing idle workers");
        }
        let mut disposals = JoinSet::new();
        for worker in idle {
            let pool = self.clone();
            disposals.spawn(async move { pool.retire(worker).await });
        }
        while disposals.join_next().await.is_some() {}

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock().live_tokens.is_empty() {
                break;
            }
            notified.await;
        }
        debug!(pool = self.name(), stats = ?self.stats(), "Pool disposed");
    }

    async fn checkout(&self) -> Result<(Lease<T, F>, Arc<T>)> {
        loop {
            let mut tokens = self.inner.tokens.clone();
            let issued = tokens.mark_seen().issued;

            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let action = {
                let mut state = self.lock();
                if state.disposed {
                    return Err(StryxError::PoolDisposed);
                }
                if let Some(worker) = state.idle.pop() {
                    state.busy += 1;
                    Acquire::Reuse(worker)
                } else if let Some(token) = (0..issued).find(|t| !state.live_tokens.contains(t)) {
                    state.live_tokens.insert(token);
                    state.busy += 1;
                    Acquire::Create(token)
                } else {
                    Acquire::Wait
                }
            };

            match action {
                Acquire::Reuse(worker) => {
                    trace!(pool = self.name(), token = worker.token, "Reusing idle worker");
                    return Ok(self.lease(worker));
                }
                Acquire::Create(token) => return self.create(token).await,
                Acquire::Wait => {
                    trace!(pool = self.name(), issued, "Waiting for a worker");
                    tokio::select! {
                        _ = &mut notified => {}
                        true = tokens.changed() => {}
                    }
                }
            }
        }
    }

    async fn create(&self, token: ConcurrencyToken) -> Result<(Lease<T, F>, Arc<T>)> {
        debug!(pool = self.name(), token, "Creating worker");
        // Dropped on failure or cancellation, which frees the token again.
        let mut reservation = Reservation {
            pool: self,
            token: Some(token),
        };
        let resource = self.inner.factory.create(token).await?;
        reservation.token = None;

        let worker = Pooled {
            token,
            resource: Arc::new(resource),
        };
        let disposed = {
            let mut state = self.lock();
            state.created += 1;
            state.disposed
        };
        if disposed {
            self.checkin(worker, false).await;
            return Err(StryxError::PoolDisposed);
        }
        Ok(self.lease(worker))
    }

    fn lease(&self, worker: Pooled<T>) -> (Lease<T, F>, Arc<T>) {
        let resource = Arc::clone(&worker.resource);
        let lease = Lease {
            pool: self.clone(),
            worker: Some(worker),
        };
        (lease, resource)
    }

    async fn checkin(&self, worker: Pooled<T>, reusable: bool) {
        let keep = reusable && worker.resource.is_reusable();
        {
            let mut state = self.lock();
            state.busy -= 1;
            if keep && !state.disposed {
                state.idle.push(worker);
                drop(state);
                self.inner.changed.notify_waiters();
                return;
            }
        }
        self.retire(worker).await;
    }

    async fn retire(&self, worker: Pooled<T>) {
        debug!(pool = self.name(), token = worker.token, "Disposing worker");
        worker.resource.dispose().await;
        {
            let mut state = self.lock();
            state.live_tokens.remove(&worker.token);
            state.destroyed += 1;
        }
        self.inner.changed.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        // Pool state stays consistent across panics in tasks; recover the guard.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A token taken for a worker that is still being created.
struct Reservation<'a, T: Resource, F: ResourceFactory<T>> {
    pool: &'a ResourcePool<T, F>,
    token: Option<ConcurrencyToken>,
}

impl<T: Resource, F: ResourceFactory<T>> Drop for Reservation<'_, T, F> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        trace!(pool = self.pool.name(), token, "Worker creation abandoned");
        {
            let mut state = self.pool.lock();
            state.live_tokens.remove(&token);
            state.busy -= 1;
        }
        self.pool.inner.changed.notify_waiters();
    }
}

/// A checked-out worker. Dropping it without release retires the worker.
struct Lease<T: Resource, F: ResourceFactory<T>> {
    pool: ResourcePool<T, F>,
    worker: Option<Pooled<T>>,
}

impl<T: Resource, F: ResourceFactory<T>> Lease<T, F> {
    async fn release(mut self, reusable: bool) {
        if let Some(worker) = self.worker.take() {
            self.pool.checkin(worker, reusable).await;
        }
    }
}

impl<T: Resource, F: ResourceFactory<T>> Drop for Lease<T, F> {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        // The task was cancelled mid-flight; its worker state is unknown.
        let pool = self.pool.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { pool.checkin(worker, false).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyTokenProvider;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    struct FakeWorker {
        token: ConcurrencyToken,
        reusable: AtomicBool,
        disposed: Arc<AtomicUsize>,
    }

    impl Resource for FakeWorker {
        fn is_reusable(&self) -> bool {
            self.reusable.load(Ordering::SeqCst)
        }

        async fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created_tokens: Mutex<Vec<ConcurrencyToken>>,
        disposed: Arc<AtomicUsize>,
        fail: AtomicBool,
        /// Never finish creating while set.
        stall: AtomicBool,
        stalled: AtomicUsize,
    }

    impl ResourceFactory<FakeWorker> for Arc<FakeFactory> {
        async fn create(&self, token: ConcurrencyToken) -> Result<FakeWorker> {
            tokio::task::yield_now().await;
            if self.stall.load(Ordering::SeqCst) {
                self.stalled.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(StryxError::Spawn("no such executable".to_string()));
            }
            self.created_tokens.lock().unwrap().push(token);
            Ok(FakeWorker {
                token,
                reusable: AtomicBool::new(true),
                disposed: Arc::clone(&self.disposed),
            })
        }
    }

    fn pool(tokens: TokenStream) -> (ResourcePool<FakeWorker, Arc<FakeFactory>>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::default());
        (
            ResourcePool::new("test", Arc::clone(&factory), tokens),
            factory,
        )
    }

    #[tokio::test]
    async fn test_idle_worker_is_reused() {
        let (pool, factory) = pool(TokenStream::fixed(4));
        for _ in 0..3 {
            let token = pool.schedule(|w| async move { Ok(w.token) }).await.unwrap();
            assert_eq!(token, 0);
        }
        assert_eq!(*factory.created_tokens.lock().unwrap(), vec![0]);
        assert_eq!(
            pool.stats(),
            PoolStats {
                created: 1,
                disposed: 0,
                idle: 1,
                busy: 0
            }
        );
    }

    #[tokio::test]
    async fn test_never_exceeds_token_budget() {
        let (pool, factory) = pool(TokenStream::fixed(3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            tasks.spawn(async move {
                pool.schedule(|_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(factory.created_tokens.lock().unwrap().len() <= 3);
    }

    #[tokio::test]
    async fn test_fatal_error_retires_worker_and_reuses_token() {
        let (pool, factory) = pool(TokenStream::fixed(1));

        let err = pool
            .schedule(|_| async {
                Err::<(), _>(StryxError::CallTimeout {
                    method: "mutantRun".to_string(),
                    timeout: Duration::from_millis(10),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StryxError::CallTimeout { .. }));
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);

        let token = pool.schedule(|w| async move { Ok(w.token) }).await.unwrap();
        assert_eq!(token, 0);
        assert_eq!(*factory.created_tokens.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_non_fatal_error_keeps_worker() {
        let (pool, factory) = pool(TokenStream::fixed(1));
        let _ = pool
            .schedule(|_| async { Err::<(), _>(StryxError::DryRun("failed".to_string())) })
            .await;
        pool.schedule(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(factory.created_tokens.lock().unwrap().len(), 1);
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_asking_for_recycling_is_disposed() {
        let (pool, factory) = pool(TokenStream::fixed(1));
        pool.schedule(|w| async move {
            w.reusable.store(false, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_new_tokens_unblock_waiters() {
        let provider = ConcurrencyTokenProvider::with_cpu_count(Some(4), true, 1);
        let (pool, factory) = pool(provider.test_runner_tokens());

        // Occupy both initial tokens
        let mut releases = Vec::new();
        let mut holders = JoinSet::new();
        for _ in 0..2 {
            let (tx, rx) = oneshot::channel::<()>();
            releases.push(tx);
            let pool = pool.clone();
            holders.spawn(async move {
                pool.schedule(|_| async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            });
        }
        while pool.stats().busy < 2 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.schedule(|w| async move { Ok(w.token) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        provider.free_checkers();
        assert_eq!(waiter.await.unwrap().unwrap(), 2);

        drop(releases);
        while let Some(result) = holders.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(factory.created_tokens.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_factory_failure_frees_token() {
        let (pool, factory) = pool(TokenStream::fixed(1));
        factory.fail.store(true, Ordering::SeqCst);

        let err = pool.schedule(|_| async { Ok(()) }).await.unwrap_err();
        assert!(err.is_setup_failure());

        pool.schedule(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(*factory.created_tokens.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_dispose_waits_for_busy_workers() {
        let (pool, factory) = pool(TokenStream::fixed(2));
        pool.schedule(|_| async { Ok(()) }).await.unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.schedule(|_| async move {
                    let _ = rx.await;
                    Ok(())
                })
                .await
            })
        };
        while pool.stats().busy < 1 {
            tokio::task::yield_now().await;
        }

        let disposing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.dispose().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!disposing.is_finished());

        let err = pool.schedule(|_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, StryxError::PoolDisposed));

        tx.send(()).unwrap();
        busy.await.unwrap().unwrap();
        disposing.await.unwrap();
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().disposed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_retires_worker() {
        let (pool, factory) = pool(TokenStream::fixed(1));
        let (started_tx, started_rx) = oneshot::channel();
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.schedule(|_| async move {
                    let _ = started_tx.send(());
                    std::future::pending::<Result<()>>().await
                })
                .await
            })
        };
        started_rx.await.unwrap();
        task.abort();
        let _ = task.await;

        let token = pool.schedule(|w| async move { Ok(w.token) }).await.unwrap();
        assert_eq!(token, 0);
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_creation_frees_token() {
        let (pool, factory) = pool(TokenStream::fixed(1));
        factory.stall.store(true, Ordering::SeqCst);
        let task = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.schedule(|_| async { Ok(()) }).await })
        };
        while factory.stalled.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats().busy, 1);
        task.abort();
        let _ = task.await;
        assert_eq!(pool.stats(), PoolStats::default());

        // The token is free again for a new worker
        factory.stall.store(false, Ordering::SeqCst);
        let token = pool.schedule(|w| async move { Ok(w.token) }).await.unwrap();
        assert_eq!(token, 0);

        tokio::time::timeout(Duration::from_secs(3), pool.dispose())
            .await
            .expect("dispose must not wait for an abandoned creation");
        assert_eq!(pool.stats().disposed, 1);
    }
}
