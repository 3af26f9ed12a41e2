//! Coordinator - per-partition bookkeeping of in-flight work
//!
//! The coordinator is the single place workers and the rebalance callback agree on:
//! how many jobs are in flight for a partition, how the last batch ended, whether the
//! partition was revoked and whether the user paused it by hand. It also owns the
//! partition's [`PauseTracker`].
//!
//! State sits behind a plain mutex. Critical sections are short and never await.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::RuntimeError;
use crate::pause_tracker::PauseTracker;
use crate::types::PartitionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    Unknown,
    Success,
    Failure,
}

#[derive(Debug)]
struct CoordinatorState {
    in_flight: usize,
    last_result: JobResult,
    last_error: Option<String>,
    revoked: bool,
    manual_pause: bool,
    pause_tracker: PauseTracker,
}

#[derive(Debug)]
pub struct Coordinator {
    partition: PartitionKey,
    state: Mutex<CoordinatorState>,
    drained: Notify,
}

impl Coordinator {
    pub fn new(partition: PartitionKey, pause_tracker: PauseTracker) -> Self {
        Self {
            partition,
            state: Mutex::new(CoordinatorState {
                in_flight: 0,
                last_result: JobResult::Unknown,
                last_error: None,
                revoked: false,
                manual_pause: false,
                pause_tracker,
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.partition
    }

    /// Resets per-batch flags before a batch is consumed
    pub fn start(&self) {
        let mut state = self.lock();
        state.last_result = JobResult::Unknown;
        state.last_error = None;
        state.manual_pause = false;
    }

    /// Counts a job as in flight. Rejected once the partition is revoked.
    pub fn on_enqueue(&self) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        if state.revoked {
            return Err(RuntimeError::PartitionRevoked(self.partition.clone()));
        }
        state.in_flight += 1;
        Ok(())
    }

    pub fn success(&self) {
        self.lock().last_result = JobResult::Success;
    }

    pub fn failure(&self, error: &anyhow::Error) {
        let mut state = self.lock();
        state.last_result = JobResult::Failure;
        state.last_error = Some(format!("{error:#}"));
    }

    /// Releases one in-flight job. Reaching zero wakes drain waiters.
    ///
    /// # Panics
    ///
    /// When no job is in flight; that means a job was released twice.
    pub fn decrement(&self) {
        let mut state = self.lock();
        if state.in_flight == 0 {
            drop(state);
            panic!(
                "coordinator for {} decremented with no job in flight",
                self.partition
            );
        }
        state.in_flight -= 1;
        let drained = state.in_flight == 0;
        drop(state);

        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Latches the revoked flag. Returns true only for the call that set it.
    pub fn revoke(&self) -> bool {
        let mut state = self.lock();
        let newly = !state.revoked;
        state.revoked = true;
        newly
    }

    pub fn is_revoked(&self) -> bool {
        self.lock().revoked
    }

    pub fn is_success(&self) -> bool {
        self.lock().last_result == JobResult::Success
    }

    pub fn last_result(&self) -> JobResult {
        self.lock().last_result
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn is_manual_pause(&self) -> bool {
        self.lock().manual_pause
    }

    pub fn pause_manually(&self) {
        self.lock().manual_pause = true;
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Runs `f` against the pause tracker under the coordinator lock
    pub fn with_pause_tracker<R>(&self, f: impl FnOnce(&mut PauseTracker) -> R) -> R {
        f(&mut self.lock().pause_tracker)
    }

    /// Resolves once no job is in flight
    pub async fn wait_until_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Registry of live coordinators, one per assigned partition
#[derive(Debug, Default)]
pub struct Coordinators {
    coordinators: DashMap<PartitionKey, Arc<Coordinator>>,
}

impl Coordinators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live coordinator for `partition`, creating one when missing or when
    /// the existing one was revoked.
    pub fn find_or_create(
        &self,
        partition: &PartitionKey,
        pause_tracker: impl FnOnce() -> PauseTracker,
    ) -> Arc<Coordinator> {
        match self.coordinators.entry(partition.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_revoked() {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        "Replacing revoked coordinator on reassignment"
                    );
                    // the old instance stays alive for its in-flight jobs through their Arcs
                    occupied.insert(Arc::new(Coordinator::new(
                        partition.clone(),
                        pause_tracker(),
                    )));
                }
                Arc::clone(occupied.get())
            }
            Entry::Vacant(vacant) => {
                let coordinator = Arc::new(Coordinator::new(partition.clone(), pause_tracker()));
                vacant.insert(Arc::clone(&coordinator));
                coordinator
            }
        }
    }

    pub fn get(&self, partition: &PartitionKey) -> Option<Arc<Coordinator>> {
        self.coordinators
            .get(partition)
            .map(|c| Arc::clone(c.value()))
    }

    /// Removes the entry only if it still is `coordinator`. A newer coordinator created by
    /// a reassignment is left alone.
    pub fn remove_if_same(&self, coordinator: &Arc<Coordinator>) -> bool {
        let removed = self
            .coordinators
            .remove_if(coordinator.partition(), |_, current| {
                Arc::ptr_eq(current, coordinator)
            })
            .is_some();
        if !removed {
            debug!(
                topic = coordinator.partition().topic(),
                partition = coordinator.partition().partition(),
                "Coordinator was already replaced, skipping removal"
            );
        }
        removed
    }

    /// Partitions whose pause deadline has passed
    pub fn expired_pauses(&self) -> Vec<Arc<Coordinator>> {
        self.coordinators
            .iter()
            .filter(|entry| !entry.is_revoked())
            .filter(|entry| entry.with_pause_tracker(|tracker| tracker.is_expired()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.coordinators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinators.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator() -> Coordinator {
        Coordinator::new(
            PartitionKey::new("events", 0),
            PauseTracker::new(Duration::from_secs(1), Duration::from_secs(30), true),
        )
    }

    #[test]
    fn test_enqueue_and_decrement_track_in_flight() {
        let coordinator = coordinator();
        coordinator.on_enqueue().unwrap();
        coordinator.on_enqueue().unwrap();
        assert_eq!(coordinator.in_flight(), 2);

        coordinator.decrement();
        coordinator.decrement();
        assert!(coordinator.is_idle());
    }

    #[test]
    #[should_panic(expected = "decremented with no job in flight")]
    fn test_decrement_below_zero_panics() {
        coordinator().decrement();
    }

    #[test]
    fn test_revoked_coordinator_rejects_enqueue() {
        let coordinator = coordinator();
        assert!(coordinator.revoke());
        assert!(!coordinator.revoke());
        assert!(coordinator.is_revoked());
        assert!(matches!(
            coordinator.on_enqueue(),
            Err(RuntimeError::PartitionRevoked(_))
        ));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn test_results_and_manual_pause_reset_on_start() {
        let coordinator = coordinator();
        assert_eq!(coordinator.last_result(), JobResult::Unknown);

        coordinator.failure(&anyhow::anyhow!("boom").context("consume failed"));
        assert_eq!(coordinator.last_result(), JobResult::Failure);
        assert_eq!(
            coordinator.last_error().as_deref(),
            Some("consume failed: boom")
        );

        coordinator.pause_manually();
        assert!(coordinator.is_manual_pause());

        coordinator.start();
        assert_eq!(coordinator.last_result(), JobResult::Unknown);
        assert!(!coordinator.is_manual_pause());
        assert!(coordinator.last_error().is_none());

        coordinator.success();
        assert!(coordinator.is_success());
    }

    #[tokio::test]
    async fn test_wait_until_drained_resolves_on_last_decrement() {
        let coordinator = Arc::new(coordinator());
        coordinator.on_enqueue().unwrap();

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.wait_until_drained().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        coordinator.decrement();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain waiter timed out")
            .unwrap();
    }

    #[test]
    fn test_registry_replaces_revoked_coordinator() {
        let registry = Coordinators::new();
        let partition = PartitionKey::new("events", 1);
        let tracker = || PauseTracker::new(Duration::from_secs(1), Duration::from_secs(30), true);

        let first = registry.find_or_create(&partition, tracker);
        let again = registry.find_or_create(&partition, tracker);
        assert!(Arc::ptr_eq(&first, &again));

        first.revoke();
        let second = registry.find_or_create(&partition, tracker);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_revoked());

        // stale removal leaves the replacement in place
        assert!(!registry.remove_if_same(&first));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_same(&second));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_lists_expired_pauses() {
        let registry = Coordinators::new();
        let tracker = || PauseTracker::new(Duration::from_secs(1), Duration::from_secs(30), true);
        let paused = registry.find_or_create(&PartitionKey::new("events", 0), tracker);
        registry.find_or_create(&PartitionKey::new("events", 1), tracker);

        paused.with_pause_tracker(|t| t.pause(None));
        assert!(registry.expired_pauses().is_empty());

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let expired = registry.expired_pauses();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].partition(), &PartitionKey::new("events", 0));
    }
}
