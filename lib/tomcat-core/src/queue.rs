//! Per-Tomcat reconcile state
//!
//! A key absent from the queue is idle. A queued or reconciling key has
//! exactly one worker task driving it; further triggers for that key are
//! coalesced into it instead of starting another worker.

use crate::{ExponentialBackoff, ObjectKey, ReconcileOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Phase of a non-idle key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPhase {
    /// Waiting for a worker slot or a backoff delay
    Queued,
    /// A reconciliation is running
    Reconciling,
}

#[derive(Clone, Debug)]
struct KeyState {
    phase: KeyPhase,
    /// A trigger arrived while reconciling
    dirty: bool,
    /// Consecutive failed attempts
    failures: u32,
}

/// What a worker does after an attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Next {
    /// Nothing left to do; the key is idle
    Idle,
    /// Run again, after the delay if one is given
    Again(Option<Duration>),
}

pub struct ReconcileQueue {
    // Map of namespace/name to reconcile state
    states: Arc<Mutex<HashMap<ObjectKey, KeyState>>>,
    backoff: ExponentialBackoff,
}

impl ReconcileQueue {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            backoff,
        }
    }

    /// Record a trigger. Returns true if the key was idle and needs a worker.
    pub async fn enqueue(&self, key: &ObjectKey) -> bool {
        let mut states = self.states.lock().await;
        match states.get_mut(key) {
            None => {
                states.insert(
                    key.clone(),
                    KeyState {
                        phase: KeyPhase::Queued,
                        dirty: false,
                        failures: 0,
                    },
                );
                debug!("Queued {}", key);
                true
            }
            Some(state) => {
                if state.phase == KeyPhase::Reconciling {
                    state.dirty = true;
                }
                debug!("Coalesced trigger for {} ({:?})", key, state.phase);
                false
            }
        }
    }

    /// Take an idle key for a caller-driven pass. Returns false while a
    /// worker holds the key (queued or reconciling).
    pub async fn try_claim(&self, key: &ObjectKey) -> bool {
        let mut states = self.states.lock().await;
        if states.contains_key(key) {
            return false;
        }
        states.insert(
            key.clone(),
            KeyState {
                phase: KeyPhase::Reconciling,
                dirty: false,
                failures: 0,
            },
        );
        true
    }

    /// Mark the key as reconciling; triggers from now on set it dirty
    pub async fn begin(&self, key: &ObjectKey) {
        let mut states = self.states.lock().await;
        let state = states.entry(key.clone()).or_insert(KeyState {
            phase: KeyPhase::Queued,
            dirty: false,
            failures: 0,
        });
        state.phase = KeyPhase::Reconciling;
        state.dirty = false;
    }

    /// Count a failed attempt and return the delay before the next one
    pub async fn record_failure(&self, key: &ObjectKey) -> Duration {
        let mut states = self.states.lock().await;
        let failures = match states.get_mut(key) {
            Some(state) => {
                state.failures = state.failures.saturating_add(1);
                state.failures
            }
            None => 1,
        };
        self.backoff.delay(failures)
    }

    /// Settle the key after an attempt
    pub async fn finish(&self, key: &ObjectKey, outcome: &ReconcileOutcome) -> Next {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(key) else {
            return Next::Idle;
        };
        match outcome {
            ReconcileOutcome::Requeue(delay) => {
                state.phase = KeyPhase::Queued;
                state.dirty = false;
                Next::Again(Some(*delay))
            }
            ReconcileOutcome::Converged | ReconcileOutcome::Terminated => {
                state.failures = 0;
                if state.dirty {
                    state.phase = KeyPhase::Queued;
                    state.dirty = false;
                    Next::Again(None)
                } else {
                    states.remove(key);
                    Next::Idle
                }
            }
        }
    }

    /// Drop a key without finishing it (shutdown)
    pub async fn forget(&self, key: &ObjectKey) {
        self.states.lock().await.remove(key);
    }

    pub async fn phase(&self, key: &ObjectKey) -> Option<KeyPhase> {
        self.states.lock().await.get(key).map(|s| s.phase)
    }

    pub async fn failures(&self, key: &ObjectKey) -> u32 {
        self.states
            .lock()
            .await
            .get(key)
            .map_or(0, |s| s.failures)
    }

    /// Number of keys that are queued or reconciling
    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
