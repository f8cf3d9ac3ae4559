//! Write Scheduler
//!
//! The persistence coordinator: decides *when* and *as what kind of
//! operation* each pending change reaches the backing store.
//!
//! # Responsibilities
//!
//! - **Debounce coalescing**: every change to a node restarts that node's
//!   debounce window; only the final accumulated change set is written.
//!   Structural changes (hierarchy pointer updates) dispatch immediately so
//!   downstream reads never observe stale structure.
//! - **CREATE-vs-UPDATE**: decided exclusively by `ever_persisted`. A
//!   not-found response to an update falls back to a create exactly once.
//!   Lifecycle state is never consulted - it legitimately cycles on every
//!   edit and conflating it with identity produces duplicate creates.
//! - **Dependency ordering**: a write may wait on other nodes' writes; it
//!   is parked on a per-dependency wait list until every dependency is
//!   durably persisted. Waiters of a node that will never persist (deleted
//!   or permanently failed before its first create) are released with an
//!   abandonment signal, never left hanging. A park that would close a
//!   transitive wait cycle is refused outright.
//! - **Retry**: version conflicts retry with a fresh version, transient
//!   store errors retry with exponential backoff, both within a bounded
//!   attempt budget. Constraint violations fail immediately.
//!
//! All bookkeeping is synchronous under one mutex; the only awaited
//! operation is the store call itself. Per-node writes are serialized;
//! writes for distinct nodes run concurrently up to a fan-out limit.

use crate::db::{NodeStore, StoreError};
use crate::models::{LifecycleState, NodeUpdate};
use crate::services::node_cache::{NodeCache, WriteRequest, WriteSink};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::Instant;

/// Outcome channel capacity; completion events are fire-and-forget
const OUTCOME_CHANNEL_CAPACITY: usize = 128;

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quiet period before a coalesced write is dispatched
    pub debounce: Duration,
    /// Retry budget for transient failures and version conflicts
    pub max_retries: u32,
    /// Fan-out limit for concurrent store calls across distinct nodes
    pub max_concurrent_writes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_retries: 3,
            max_concurrent_writes: 8,
        }
    }
}

/// Terminal result of a scheduled write, broadcast to observers
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    /// The write landed; `version` is the store-assigned version
    Saved { id: String, version: i64 },
    /// The write was dropped because a dependency will never persist
    Abandoned { id: String, dependency: String },
    /// The write exhausted its retries or hit a fatal error
    Failed {
        id: String,
        attempts: u32,
        error: String,
    },
}

impl WriteOutcome {
    /// Id of the node this outcome is about
    pub fn node_id(&self) -> &str {
        match self {
            WriteOutcome::Saved { id, .. }
            | WriteOutcome::Abandoned { id, .. }
            | WriteOutcome::Failed { id, .. } => id,
        }
    }
}

struct PendingWrite {
    update: NodeUpdate,
    deps: HashSet<String>,
    structural: bool,
    epoch: u64,
    deadline: Instant,
}

#[derive(Default)]
struct SchedulerState {
    pending: HashMap<String, PendingWrite>,
    in_flight: HashSet<String>,
    /// dependency id → ids waiting for it to persist
    waiters: HashMap<String, Vec<String>>,
    /// ids that will never persist (deleted or failed before first create)
    abandoned: HashSet<String>,
    epoch_counter: u64,
}

enum Decision {
    Run(PendingWrite),
    Park { dependency: String },
    Abandon { dependency: String },
    Cycle { dependency: String },
    Skip,
}

/// The persistence coordinator
pub struct WriteScheduler {
    cache: Arc<NodeCache>,
    store: Arc<dyn NodeStore>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    gate: Arc<Semaphore>,
    outcomes: broadcast::Sender<WriteOutcome>,
    weak_self: Weak<WriteScheduler>,
}

impl WriteSink for WriteScheduler {
    fn submit(&self, request: WriteRequest) {
        self.submit_request(request);
    }
}

impl WriteScheduler {
    /// Build a scheduler. Must be constructed (and its writes submitted)
    /// inside a tokio runtime; debounce timers are tokio tasks.
    pub fn new(
        cache: Arc<NodeCache>,
        store: Arc<dyn NodeStore>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        let gate = Arc::new(Semaphore::new(config.max_concurrent_writes));
        Arc::new_cyclic(|weak| Self {
            cache,
            store,
            config,
            state: Mutex::new(SchedulerState::default()),
            gate,
            outcomes,
            weak_self: weak.clone(),
        })
    }

    /// Subscribe to terminal write outcomes
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<WriteOutcome> {
        self.outcomes.subscribe()
    }

    /// Accept a change request. Synchronous: merges into the node's
    /// pending entry and arms (or preempts) its debounce timer.
    pub fn submit_request(&self, request: WriteRequest) {
        let id = request.id.clone();
        let (epoch, structural) = {
            let mut st = self.state.lock().unwrap();
            // A fresh write for this id supersedes any earlier abandonment
            st.abandoned.remove(&id);
            st.epoch_counter += 1;
            let epoch = st.epoch_counter;
            let deadline = Instant::now() + self.config.debounce;

            let entry = st.pending.entry(id.clone()).or_insert_with(|| PendingWrite {
                update: NodeUpdate::new(),
                deps: HashSet::new(),
                structural: false,
                epoch,
                deadline,
            });
            entry.update.merge(request.update);
            entry
                .deps
                .extend(request.deps.into_iter().filter(|dep| dep != &id));
            entry.structural |= request.structural;
            entry.epoch = epoch;
            entry.deadline = deadline;
            (epoch, entry.structural)
        };

        self.cache.mark_lifecycle(&id, LifecycleState::WritePending);

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        if structural {
            tokio::spawn(async move { this.try_dispatch(id, epoch).await });
        } else {
            let debounce = self.config.debounce;
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                this.try_dispatch(id, epoch).await;
            });
        }
    }

    /// Drop the pending write for a node that is being deleted before it
    /// ever persisted, and release its waiters with an abandonment signal.
    pub fn abandon(&self, id: &str) {
        let waiters = {
            let mut st = self.state.lock().unwrap();
            st.pending.remove(id);
            st.abandoned.insert(id.to_string());
            st.waiters.remove(id).unwrap_or_default()
        };
        if !waiters.is_empty() {
            tracing::debug!(
                id,
                waiter_count = waiters.len(),
                "abandoning write; releasing waiters"
            );
        }
        self.wake(waiters);
    }

    /// True when no writes are pending, parked, or in flight
    pub fn is_idle(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.pending.is_empty() && st.in_flight.is_empty()
    }

    /// Wait until every scheduled write has reached a terminal state
    pub async fn flush(&self) {
        while !self.is_idle() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Wait until one node's scheduled write (if any) has reached a
    /// terminal state
    pub async fn flush_node(&self, id: &str) {
        loop {
            {
                let st = self.state.lock().unwrap();
                if !st.pending.contains_key(id) && !st.in_flight.contains(id) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    /// Drive one node's write to a terminal state. Runs as a loop rather
    /// than respawning itself, so the dispatch future never contains its
    /// own type.
    async fn try_dispatch(self: Arc<Self>, id: String, mut epoch: u64) {
        loop {
            match self.decide(&id, epoch) {
                Decision::Skip => return,
                Decision::Park { dependency } => {
                    tracing::debug!(
                        id,
                        dep = %dependency,
                        "write parked on unpersisted dependency"
                    );
                    return;
                }
                Decision::Abandon { dependency } => {
                    self.fail_scheduled(
                        &id,
                        WriteOutcome::Abandoned {
                            id: id.clone(),
                            dependency,
                        },
                    );
                    return;
                }
                Decision::Cycle { dependency } => {
                    tracing::warn!(id, dep = %dependency, "refusing to park: circular wait");
                    self.fail_scheduled(
                        &id,
                        WriteOutcome::Failed {
                            id: id.clone(),
                            attempts: 0,
                            error: format!("circular wait between {id} and {dependency}"),
                        },
                    );
                    return;
                }
                Decision::Run(write) => {
                    self.cache.mark_lifecycle(&id, LifecycleState::Writing);
                    let Some((next_epoch, structural, deadline)) =
                        self.execute(&id, write).await
                    else {
                        return;
                    };
                    // Edits accumulated during the flight; dispatch them
                    // once their own debounce deadline passes
                    if !structural {
                        tokio::time::sleep_until(deadline).await;
                    }
                    epoch = next_epoch;
                }
            }
        }
    }

    /// Resolve a dispatch attempt under the state lock.
    fn decide(&self, id: &str, epoch: u64) -> Decision {
        let mut st = self.state.lock().unwrap();
        let deps: Vec<String> = match st.pending.get(id) {
            Some(entry) if entry.epoch == epoch && !st.in_flight.contains(id) => {
                entry.deps.iter().cloned().collect()
            }
            // Superseded by a newer change, or the completion handler will
            // reschedule once the current flight lands
            _ => return Decision::Skip,
        };

        let mut satisfied = Vec::new();
        let mut blocking = None;
        for dep in deps {
            if st.abandoned.contains(&dep) {
                return self.fail_under_lock(&mut st, id, dep, true);
            }
            match self.cache.ever_persisted(&dep) {
                Some(true) => satisfied.push(dep),
                Some(false) => {
                    blocking = Some(dep);
                    break;
                }
                // Dependency no longer exists in memory at all
                None => return self.fail_under_lock(&mut st, id, dep, true),
            }
        }

        if let Some(dep) = blocking {
            if Self::would_cycle(&st, &dep, id) {
                return self.fail_under_lock(&mut st, id, dep, false);
            }
            let waiters = st.waiters.entry(dep.clone()).or_default();
            if !waiters.iter().any(|w| w == id) {
                waiters.push(id.to_string());
            }
            return Decision::Park { dependency: dep };
        }

        let mut write = st.pending.remove(id).expect("checked above");
        for dep in satisfied {
            write.deps.remove(&dep);
        }
        st.in_flight.insert(id.to_string());
        Decision::Run(write)
    }

    /// Shared bookkeeping for writes that terminate without dispatching.
    fn fail_under_lock(
        &self,
        st: &mut SchedulerState,
        id: &str,
        dependency: String,
        abandoned: bool,
    ) -> Decision {
        st.pending.remove(id);
        if abandoned {
            Decision::Abandon { dependency }
        } else {
            Decision::Cycle { dependency }
        }
    }

    /// Would parking `waiter` on `dep` close a wait cycle? Walks the
    /// pending dependency edges from `dep`.
    fn would_cycle(st: &SchedulerState, dep: &str, waiter: &str) -> bool {
        let mut stack = vec![dep.to_string()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == waiter {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(entry) = st.pending.get(&current) {
                stack.extend(entry.deps.iter().cloned());
            }
        }
        false
    }

    /// Finish a write that terminated before dispatch (abandoned
    /// dependency or refused cycle): the node itself will now never
    /// persist, so its own waiters are released too.
    fn fail_scheduled(&self, id: &str, outcome: WriteOutcome) {
        let waiters = {
            let mut st = self.state.lock().unwrap();
            if self.cache.ever_persisted(id) == Some(false) {
                st.abandoned.insert(id.to_string());
            }
            st.waiters.remove(id).unwrap_or_default()
        };
        self.cache.mark_lifecycle(id, LifecycleState::WriteFailed);
        let _ = self.outcomes.send(outcome);
        self.wake(waiters);
    }

    /// Run one write to completion. Returns the node's newer pending
    /// entry (epoch, structural flag, deadline) if edits accumulated
    /// during the flight, so the caller loops instead of respawning.
    async fn execute(&self, id: &str, write: PendingWrite) -> Option<(u64, bool, Instant)> {
        // Fan-out limit across distinct node ids
        let permit = self
            .gate
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let result = self.perform_write(id, &write).await;
        drop(permit);

        // Identity settles before the waiter list is drained: a dispatch
        // racing this completion either observes the persisted flag or
        // lands on the list before the drain, never in between
        if let Ok(version) = &result {
            self.cache.mark_persisted(id, *version);
        }

        let (waiters, reschedule) = {
            let mut st = self.state.lock().unwrap();
            st.in_flight.remove(id);
            if result.is_err() && self.cache.ever_persisted(id) != Some(true) {
                // Never landed and never will; release anyone waiting
                st.abandoned.insert(id.to_string());
            }
            let waiters = st.waiters.remove(id).unwrap_or_default();
            let reschedule = st
                .pending
                .get(id)
                .map(|entry| (entry.epoch, entry.structural, entry.deadline));
            (waiters, reschedule)
        };

        match result {
            Ok(version) => {
                if reschedule.is_some() {
                    // Identity is settled but the node is dirty again
                    self.cache.mark_lifecycle(id, LifecycleState::WritePending);
                }
                let _ = self.outcomes.send(WriteOutcome::Saved {
                    id: id.to_string(),
                    version,
                });
            }
            Err((attempts, error)) => {
                tracing::warn!(id, attempts, %error, "write failed permanently");
                self.cache.mark_lifecycle(id, LifecycleState::WriteFailed);
                let _ = self.outcomes.send(WriteOutcome::Failed {
                    id: id.to_string(),
                    attempts,
                    error: error.to_string(),
                });
            }
        }

        self.wake(waiters);
        reschedule
    }

    /// Re-evaluate every waiter of a completed (or abandoned) dependency.
    fn wake(&self, waiters: Vec<String>) {
        for waiter in waiters {
            let epoch = {
                let st = self.state.lock().unwrap();
                st.pending.get(&waiter).map(|entry| entry.epoch)
            };
            let Some(epoch) = epoch else { continue };
            if let Some(this) = self.weak_self.upgrade() {
                tokio::spawn(async move { this.try_dispatch(waiter, epoch).await });
            }
        }
    }

    /// Issue the store call, retrying within the configured budget.
    ///
    /// Returns the store-assigned version on success, or the attempt count
    /// and final error on permanent failure.
    async fn perform_write(
        &self,
        id: &str,
        write: &PendingWrite,
    ) -> Result<i64, (u32, StoreError)> {
        let mut attempts: u32 = 0;
        let mut version_override: Option<i64> = None;

        loop {
            let Some(snapshot) = self.cache.get(id) else {
                // Deleted while in flight; nothing left to persist
                return Err((attempts, StoreError::not_found(id)));
            };

            let result = if !snapshot.ever_persisted {
                self.create(snapshot.clone()).await
            } else {
                let expected = version_override.unwrap_or(snapshot.version);
                match self
                    .store
                    .update_node(id, expected, write.update.clone())
                    .await
                {
                    Ok(node) => Ok(node.version),
                    Err(StoreError::NotFound { .. }) => {
                        // The prior create never actually landed; fall back
                        // to a create exactly once
                        tracing::debug!(id, "update hit missing record; falling back to create");
                        self.create(snapshot.clone()).await
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(version) => {
                    if attempts > 0 {
                        tracing::debug!(id, attempts, "write succeeded after retry");
                    }
                    return Ok(version);
                }
                Err(StoreError::VersionConflict {
                    actual_version, ..
                }) if attempts < self.config.max_retries => {
                    tracing::debug!(
                        id,
                        actual_version,
                        attempt = attempts + 1,
                        "version conflict; retrying with fresh version"
                    );
                    version_override = Some(actual_version);
                    Self::backoff(attempts).await;
                    attempts += 1;
                }
                Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                    tracing::debug!(
                        id,
                        attempt = attempts + 1,
                        error = %e,
                        "transient failure; retrying"
                    );
                    Self::backoff(attempts).await;
                    attempts += 1;
                }
                Err(e) => return Err((attempts + 1, e)),
            }
        }
    }

    /// Create, recovering from a duplicate-id collision (a prior create
    /// landed but its completion was lost) by switching to an update.
    async fn create(&self, node: crate::models::Node) -> Result<i64, StoreError> {
        let id = node.id.clone();
        match self.store.create_node(node.clone()).await {
            Ok(created) => Ok(created.version),
            Err(StoreError::DuplicateId { .. }) => {
                let existing = self
                    .store
                    .get_node(&id)
                    .await?
                    .ok_or_else(|| StoreError::not_found(&id))?;
                let update = WriteRequest::full(&node).update;
                let updated = self.store.update_node(&id, existing.version, update).await?;
                Ok(updated.version)
            }
            Err(e) => Err(e),
        }
    }

    /// Exponential backoff: 10ms, 20ms, 40ms, ...
    async fn backoff(attempt: u32) {
        let backoff_ms = 10u64 * (1 << attempt);
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::db::ChangeSource;
    use crate::models::Node;
    use serde_json::json;

    fn setup(config: SchedulerConfig) -> (Arc<NodeCache>, Arc<MemoryStore>, Arc<WriteScheduler>) {
        let cache = Arc::new(NodeCache::new());
        let store = Arc::new(MemoryStore::new());
        let scheduler = WriteScheduler::new(cache.clone(), store.clone(), config);
        cache.wire_sink(scheduler.clone());
        (cache, store, scheduler)
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            debounce: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn text_node(content: &str) -> Node {
        Node::new("text".to_string(), content.to_string(), None, json!({}))
    }

    #[tokio::test]
    async fn test_single_write_creates_then_marks_persisted() {
        let (cache, store, scheduler) = setup(fast_config());
        let node = text_node("hello");
        let id = node.id.clone();

        cache.set(node, false);
        scheduler.flush().await;

        assert_eq!(store.op_counts().creates, 1);
        let cached = cache.get(&id).unwrap();
        assert!(cached.ever_persisted);
        assert_eq!(cached.lifecycle, LifecycleState::Saved);
    }

    #[tokio::test]
    async fn test_structural_write_skips_debounce() {
        let (cache, store, scheduler) = setup(SchedulerConfig {
            // Long enough that a debounced write could not land in time
            debounce: Duration::from_secs(60),
            ..Default::default()
        });
        let node = text_node("x");
        let id = node.id.clone();
        cache.set(node, true);

        let mut update = NodeUpdate::new();
        update.before_sibling_id = Some(None);
        cache.apply(&id, update, ChangeSource::Hierarchy).unwrap();

        scheduler.flush().await;
        assert_eq!(store.op_counts().creates, 1);
    }

    #[tokio::test]
    async fn test_cycle_refused_not_deadlocked() {
        let (cache, _store, scheduler) = setup(SchedulerConfig {
            debounce: Duration::from_millis(5),
            ..Default::default()
        });
        let a = text_node("a");
        let b = text_node("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        cache.set(a, true);
        cache.set(b, true);

        let mut outcomes = scheduler.subscribe_outcomes();

        // Mutually dependent writes; the second park must be refused
        scheduler.submit_request(WriteRequest {
            id: a_id.clone(),
            update: NodeUpdate::new().with_content("a2"),
            deps: vec![b_id.clone()],
            structural: true,
        });
        scheduler.submit_request(WriteRequest {
            id: b_id.clone(),
            update: NodeUpdate::new().with_content("b2"),
            deps: vec![a_id.clone()],
            structural: true,
        });

        scheduler.flush().await;

        // Both writes reached a terminal state; at least one was refused
        let mut terminal = Vec::new();
        while let Ok(outcome) = outcomes.try_recv() {
            terminal.push(outcome);
        }
        assert!(!terminal.is_empty());
        assert!(terminal
            .iter()
            .any(|o| matches!(o, WriteOutcome::Failed { .. } | WriteOutcome::Abandoned { .. })));
    }

    #[tokio::test]
    async fn test_outcome_node_id_accessor() {
        let outcome = WriteOutcome::Saved {
            id: "n1".to_string(),
            version: 2,
        };
        assert_eq!(outcome.node_id(), "n1");
    }
}
