//! A registry of cancellable worker tasks.
//!
//! Every worker owns a child of its subsystem's [`CancellationToken`].
//! Cancelling the subsystem token stops the whole pool, cancelling a single
//! worker's token stops exactly that worker.
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Worker {
    id: usize,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct WorkerPool {
    role: &'static str,
    next_id: AtomicUsize,
    workers: Mutex<Vec<Worker>>,
}

impl WorkerPool {
    pub const fn new(role: &'static str) -> Self {
        Self {
            role,
            next_id: AtomicUsize::new(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        // Workers that quit on their own (fatal errors) leave the registry here.
        workers.retain(|w| !w.handle.is_finished());
        workers
    }

    /// Spawns one worker whose token is a child of `parent`.
    ///
    /// `work` receives the worker's id and its own token.
    pub fn spawn<F, Fut>(&self, parent: &CancellationToken, work: F) -> usize
    where
        F: FnOnce(usize, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        let handle = tokio::spawn(work(id, token.clone()));
        debug!("{} worker #{id:02} spawned", self.role);

        self.workers().push(Worker { id, token, handle });
        id
    }

    /// Stops the most recently started worker. Returns false if none is running.
    pub fn stop_one(&self) -> bool {
        let Some(worker) = self.workers().pop() else {
            return false;
        };
        debug!("Stopping {} worker #{:02}", self.role, worker.id);
        worker.token.cancel();
        true
    }

    /// Cancels and forgets every worker. Running items are not waited for.
    pub fn stop_all(&self) {
        for worker in self.workers().drain(..) {
            worker.token.cancel();
        }
    }

    /// Number of workers still running.
    pub fn len(&self) -> usize {
        self.workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The on/off state of a subsystem, held as its root cancellation token.
///
/// A subsystem is active while it holds a root token that nobody cancelled.
/// A singleton worker hitting a fatal error cancels the root, which takes the
/// whole subsystem down.
#[derive(Debug, Default)]
pub struct Lifecycle {
    root: Mutex<Option<CancellationToken>>,
}

impl Lifecycle {
    fn root(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.root.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out a fresh root token, or `None` if already active.
    pub fn begin(&self) -> Option<CancellationToken> {
        let mut root = self.root();
        if root.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return None;
        }
        let token = CancellationToken::new();
        *root = Some(token.clone());
        Some(token)
    }

    /// The root token of the running subsystem.
    pub fn current(&self) -> Option<CancellationToken> {
        self.root().clone().filter(|t| !t.is_cancelled())
    }

    /// Cancels the root token. Returns false if the subsystem was not active.
    pub fn end(&self) -> bool {
        match self.root().take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn lifecycle_hands_out_one_root_at_a_time() {
        let lifecycle = Lifecycle::default();
        assert!(!lifecycle.is_active());

        let root = lifecycle.begin().unwrap();
        assert!(lifecycle.begin().is_none());
        assert!(lifecycle.is_active());

        // A fatal error in a singleton worker.
        root.cancel();
        assert!(!lifecycle.is_active());
        assert!(!lifecycle.end());

        assert!(lifecycle.begin().is_some());
        assert!(lifecycle.end());
        assert!(!lifecycle.is_active());
    }

    async fn park(_id: usize, token: CancellationToken) {
        token.cancelled().await;
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn stop_one_stops_exactly_one() {
        let root = CancellationToken::new();
        let pool = WorkerPool::new("test");
        for _ in 0..3 {
            pool.spawn(&root, park);
        }
        assert_eq!(pool.len(), 3);

        assert!(pool.stop_one());
        settle().await;
        assert_eq!(pool.len(), 2);
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancellation_stops_everyone() {
        let root = CancellationToken::new();
        let pool = WorkerPool::new("test");
        for _ in 0..4 {
            pool.spawn(&root, park);
        }

        root.cancel();
        settle().await;
        assert!(pool.is_empty());
        assert!(!pool.stop_one());
    }

    #[tokio::test]
    async fn finished_workers_leave_the_registry() {
        let root = CancellationToken::new();
        let pool = WorkerPool::new("test");
        pool.spawn(&root, |_, _| async {});
        pool.spawn(&root, park);
        settle().await;

        assert_eq!(pool.len(), 1);
        pool.stop_all();
        assert!(pool.is_empty());
    }
}
