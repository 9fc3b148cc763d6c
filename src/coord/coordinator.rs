//! Mutex coordinator - named exclusive locks shared across plugins
//!
//! A request names a set of mutexes and is granted all of them at once or
//! none. Requests are served in ticket order: a request is granted only when
//! every mutex it waits on is free and it is the oldest waiter on each. Since
//! no request ever holds part of its set while waiting for the rest, two
//! requests with overlapping sets cannot deadlock each other.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::errors::{ConvoyError, Result};

#[derive(Debug, Default)]
struct MutexState {
    held_by: Option<String>,
    waiters: VecDeque<u64>,
}

#[derive(Debug, Default)]
struct MutexTable {
    mutexes: HashMap<String, MutexState>,
    next_ticket: u64,
}

impl MutexTable {
    fn state(&mut self, name: &str) -> &mut MutexState {
        // Mutexes are created lazily on first reference and never removed
        self.mutexes.entry(name.to_string()).or_default()
    }

    /// Names in `names` that `holder` does not already hold
    fn missing(&mut self, holder: &str, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| self.state(name).held_by.as_deref() != Some(holder))
            .cloned()
            .collect()
    }

    fn grant(&mut self, holder: &str, names: &[String]) {
        for name in names {
            self.state(name).held_by = Some(holder.to_string());
        }
    }
}

struct Inner {
    table: Mutex<MutexTable>,
    released: Notify,
}

/// Grants and releases named exclusive mutexes.
///
/// One coordinator is created per orchestration run and shared by cloning.
#[derive(Clone)]
pub struct MutexCoordinator {
    inner: Arc<Inner>,
}

impl Default for MutexCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(MutexTable::default()),
                released: Notify::new(),
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, MutexTable> {
        self.inner.table.lock()
    }

    /// Acquire every mutex in `names` for `holder`, waiting at most `timeout`.
    ///
    /// Dropping the returned future withdraws the pending request; nothing
    /// is ever left partially acquired.
    pub async fn acquire<I, S>(&self, holder: &str, names: I, timeout: Duration) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acquire_missing(holder, sorted_names(names), timeout)
            .await
            .map(|_| ())
    }

    /// Acquire `names` and return the ones this call granted, leaving out
    /// names `holder` already held
    async fn acquire_missing(
        &self,
        holder: &str,
        names: Vec<String>,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(names);
        }

        let pending = {
            let mut table = self.table();
            let missing = table.missing(holder, &names);
            let uncontended = missing.iter().all(|name| {
                let state = table.state(name);
                state.held_by.is_none() && state.waiters.is_empty()
            });
            if uncontended {
                table.grant(holder, &missing);
                debug!(holder, mutexes = ?names, "mutexes granted");
                return Ok(missing);
            }

            let ticket = table.next_ticket;
            table.next_ticket += 1;
            for name in &missing {
                table.state(name).waiters.push_back(ticket);
            }
            debug!(holder, mutexes = ?names, ticket, "waiting for mutexes");
            PendingRequest {
                coordinator: self.clone(),
                holder: holder.to_string(),
                names: missing,
                ticket,
                granted: false,
            }
        };

        self.wait_for_grant(pending, timeout).await
    }

    async fn wait_for_grant(
        &self,
        mut pending: PendingRequest,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let wait = async {
            loop {
                let released = self.inner.released.notified();
                tokio::pin!(released);
                // Register before checking so a release in between is not missed
                released.as_mut().enable();
                if self.try_grant(&pending) {
                    return;
                }
                released.await;
            }
        };

        let outcome = tokio::time::timeout(timeout, wait).await;
        match outcome {
            Ok(()) => {
                pending.granted = true;
                debug!(holder = %pending.holder, mutexes = ?pending.names, "mutexes granted after wait");
                Ok(pending.names.clone())
            }
            Err(_) => {
                warn!(
                    holder = %pending.holder,
                    mutexes = ?pending.names,
                    timeout_ms = timeout.as_millis() as u64,
                    "mutex acquisition timed out"
                );
                Err(ConvoyError::mutex_timeout(
                    pending.holder.clone(),
                    pending.names.clone(),
                    timeout,
                ))
            }
        }
    }

    fn try_grant(&self, pending: &PendingRequest) -> bool {
        let mut table = self.table();
        let ready = pending.names.iter().all(|name| {
            let state = table.state(name);
            state.held_by.is_none() && state.waiters.front() == Some(&pending.ticket)
        });
        if !ready {
            return false;
        }
        for name in &pending.names {
            let state = table.state(name);
            state.waiters.pop_front();
            state.held_by = Some(pending.holder.clone());
        }
        true
    }

    /// Acquire and return a guard that releases on drop.
    ///
    /// The guard owns only the names this call granted. Names the holder
    /// already held stay with whoever acquired them first.
    pub async fn acquire_guard<I, S>(
        &self,
        holder: &str,
        names: I,
        timeout: Duration,
    ) -> Result<HeldMutexes>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let granted = self
            .acquire_missing(holder, sorted_names(names), timeout)
            .await?;
        Ok(HeldMutexes {
            coordinator: self.clone(),
            holder: holder.to_string(),
            names: granted,
            released: false,
        })
    }

    /// Release mutexes held by `holder`. Names it does not hold are ignored.
    pub fn release<I, S>(&self, holder: &str, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names = sorted_names(names);
        let mut released = Vec::new();
        {
            let mut table = self.table();
            for name in &names {
                let state = table.state(name);
                if state.held_by.as_deref() == Some(holder) {
                    state.held_by = None;
                    released.push(name.clone());
                } else {
                    debug!(
                        holder,
                        mutex = %name,
                        held_by = ?state.held_by,
                        "release ignored, mutex not held by caller"
                    );
                }
            }
        }
        if !released.is_empty() {
            debug!(holder, mutexes = ?released, "mutexes released");
            self.inner.released.notify_waiters();
        }
    }

    /// Current holder of a mutex
    pub fn holder_of(&self, name: &str) -> Option<String> {
        self.table()
            .mutexes
            .get(name)
            .and_then(|state| state.held_by.clone())
    }

    /// Number of pending requests waiting on a mutex
    pub fn waiting_count(&self, name: &str) -> usize {
        self.table()
            .mutexes
            .get(name)
            .map(|state| state.waiters.len())
            .unwrap_or(0)
    }

    /// Holder of every mutex referenced so far
    pub fn snapshot(&self) -> BTreeMap<String, Option<String>> {
        self.table()
            .mutexes
            .iter()
            .map(|(name, state)| (name.clone(), state.held_by.clone()))
            .collect()
    }

    fn withdraw(&self, ticket: u64, names: &[String]) {
        {
            let mut table = self.table();
            for name in names {
                table.state(name).waiters.retain(|t| *t != ticket);
            }
        }
        // Requests queued behind this one may be grantable now
        self.inner.released.notify_waiters();
    }
}

/// A queued request; withdrawn from every queue when dropped ungranted
struct PendingRequest {
    coordinator: MutexCoordinator,
    holder: String,
    names: Vec<String>,
    ticket: u64,
    granted: bool,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.granted {
            debug!(holder = %self.holder, ticket = self.ticket, "withdrawing mutex request");
            self.coordinator.withdraw(self.ticket, &self.names);
        }
    }
}

/// Mutexes held by one holder, released when dropped
pub struct HeldMutexes {
    coordinator: MutexCoordinator,
    holder: String,
    names: Vec<String>,
    released: bool,
}

impl HeldMutexes {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release now instead of at drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.coordinator.release(&self.holder, self.names.iter().cloned());
        }
    }
}

impl Drop for HeldMutexes {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Deduplicated names in lexicographic order
fn sorted_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names
        .into_iter()
        .map(Into::into)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_acquire_and_release() {
        let coord = MutexCoordinator::new();
        coord.acquire("apt", ["pkgdb", "network"], LONG).await.unwrap();

        assert_eq!(coord.holder_of("pkgdb").as_deref(), Some("apt"));
        assert_eq!(coord.holder_of("network").as_deref(), Some("apt"));

        coord.release("apt", ["pkgdb", "network"]);
        assert_eq!(coord.holder_of("pkgdb"), None);
        assert_eq!(coord.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_request_is_immediate() {
        let coord = MutexCoordinator::new();
        coord
            .acquire("apt", Vec::<String>::new(), Duration::from_millis(1))
            .await
            .unwrap();
        assert!(coord.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_release_not_held_is_noop() {
        let coord = MutexCoordinator::new();
        coord.acquire("apt", ["pkgdb"], LONG).await.unwrap();

        coord.release("snap", ["pkgdb"]);
        coord.release("snap", ["never-seen"]);
        assert_eq!(coord.holder_of("pkgdb").as_deref(), Some("apt"));

        coord.release("apt", ["pkgdb"]);
        coord.release("apt", ["pkgdb"]);
        assert_eq!(coord.holder_of("pkgdb"), None);
    }

    #[tokio::test]
    async fn test_timeout_leaves_holder_unchanged() {
        let coord = MutexCoordinator::new();
        coord.acquire("apt", ["pkgdb"], LONG).await.unwrap();

        let started = Instant::now();
        let err = coord
            .acquire("dpkg", ["pkgdb"], Duration::from_secs(1))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ConvoyError::MutexTimeout { .. }));
        assert!(elapsed >= Duration::from_secs(1), "returned early: {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1200), "returned late: {:?}", elapsed);
        assert_eq!(coord.holder_of("pkgdb").as_deref(), Some("apt"));
        assert_eq!(coord.waiting_count("pkgdb"), 0);
    }

    #[tokio::test]
    async fn test_waiter_granted_on_release() {
        let coord = MutexCoordinator::new();
        coord.acquire("apt", ["pkgdb"], LONG).await.unwrap();

        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.acquire("dpkg", ["pkgdb"], LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.waiting_count("pkgdb"), 1);

        coord.release("apt", ["pkgdb"]);
        waiter.await.unwrap().unwrap();
        assert_eq!(coord.holder_of("pkgdb").as_deref(), Some("dpkg"));
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let coord = MutexCoordinator::new();
        {
            let guard = coord.acquire_guard("apt", ["b", "a"], LONG).await.unwrap();
            assert_eq!(guard.names(), ["a".to_string(), "b".to_string()]);
            assert_eq!(coord.holder_of("a").as_deref(), Some("apt"));
        }
        assert_eq!(coord.holder_of("a"), None);
        assert_eq!(coord.holder_of("b"), None);
    }

    #[tokio::test]
    async fn test_nested_guard_leaves_outer_names_held() {
        let coord = MutexCoordinator::new();
        let outer = coord.acquire_guard("apt", ["pkgdb"], LONG).await.unwrap();
        {
            let inner = coord
                .acquire_guard("apt", ["pkgdb", "network"], LONG)
                .await
                .unwrap();
            assert_eq!(inner.names(), ["network".to_string()]);
        }
        assert_eq!(coord.holder_of("pkgdb").as_deref(), Some("apt"));
        assert_eq!(coord.holder_of("network"), None);

        drop(outer);
        assert_eq!(coord.holder_of("pkgdb"), None);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_withdrawn() {
        let coord = MutexCoordinator::new();
        coord.acquire("holder", ["a"], LONG).await.unwrap();

        // Waits on a (held) and queues ahead of everyone on b
        let blocked = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.acquire("wide", ["a", "b"], LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coord.waiting_count("b"), 1);

        // Queued behind the wide request on b
        let narrow = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.acquire("narrow", ["b"], LONG).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!narrow.is_finished());

        blocked.abort();
        let _ = blocked.await;

        tokio::time::timeout(Duration::from_secs(1), narrow)
            .await
            .expect("narrow request should be granted after withdrawal")
            .unwrap()
            .unwrap();
        assert_eq!(coord.holder_of("b").as_deref(), Some("narrow"));
        assert_eq!(coord.holder_of("a").as_deref(), Some("holder"));
        assert_eq!(coord.waiting_count("a"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_sets_never_deadlock() {
        let coord = MutexCoordinator::new();
        let inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for (holder, names) in [("one", ["a", "b"]), ("two", ["b", "a"]), ("three", ["b", "c"])] {
            let coord = coord.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let guard = coord.acquire_guard(holder, names, LONG).await.unwrap();
                    if names.contains(&"a") {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::task::yield_now().await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                    guard.release();
                }
            }));
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(20), handle)
                .await
                .expect("deadlock")
                .unwrap();
        }
        assert!(coord.snapshot().values().all(Option::is_none));
    }
}
