// State management module
//
// This module provides the StateManager which wraps a component's published state
// with thread-safe access using Arc<RwLock<T>> and emits change events to observers.

use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Default broadcast buffer for change events
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// State that can be published through a [`StateManager`]
///
/// Implementors describe how to turn a before/after pair of snapshots into
/// change events, so observers never have to poll or diff themselves.
pub trait Observable: Clone + Send + Sync + 'static {
    /// Event type emitted to subscribers
    type Change: Clone + Debug + Send + 'static;

    /// Detect what changed between two states and generate events
    fn detect_changes(old: &Self, new: &Self) -> Vec<Self::Change>;
}

/// Thread-safe state manager with event emission
///
/// Each of the link, recorder and recovery managers owns one of these for its
/// published state. It:
/// - Provides thread-safe access to the state via `Arc<RwLock<T>>`
/// - Detects state changes and emits change events
/// - Supports subscribing to state changes via tokio broadcast channels
///
/// Every mutation runs under a single write lock and its events are sent before
/// the lock is released, so an observer never sees a half-applied update.
/// Dropping a receiver is all it takes to unsubscribe.
pub struct StateManager<S: Observable> {
    /// The published state protected by RwLock for thread-safe access
    state: Arc<RwLock<S>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<S::Change>,
}

impl<S: Observable> StateManager<S> {
    /// Create a new StateManager with the given initial state
    pub fn new(initial: S) -> Self {
        Self::with_capacity(initial, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new StateManager with a custom broadcast buffer
    pub fn with_capacity(initial: S, capacity: usize) -> Self {
        let (state_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Arc::new(RwLock::new(initial)),
            state_tx,
        }
    }

    /// Get a read-only snapshot of the current state
    pub fn snapshot(&self) -> S {
        self.state.read().unwrap().clone()
    }

    /// Execute a function with read access to the state
    ///
    /// # Example
    /// ```ignore
    /// let phase = recorder_state.read(|state| state.phase);
    /// ```
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&S) -> R,
    {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// This is the primary way to modify state. It:
    /// 1. Captures the old state
    /// 2. Applies the update function
    /// 3. Detects what changed
    /// 4. Emits appropriate events
    ///
    /// # Returns
    /// A vector of change events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<S::Change>
    where
        F: FnOnce(&mut S),
    {
        let mut state = self.state.write().unwrap();
        let old_state = state.clone();

        // Apply the update
        update_fn(&mut state);

        // Detect changes and emit events
        let changes = S::detect_changes(&old_state, &state);

        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Update the state only if the closure succeeds
    ///
    /// The closure runs against a scratch copy; on `Err` the copy is discarded,
    /// no events are emitted, and the error is returned unchanged.
    pub fn try_update<F, T, E>(&self, update_fn: F) -> Result<(Vec<S::Change>, T), E>
    where
        F: FnOnce(&mut S) -> Result<T, E>,
    {
        let mut state = self.state.write().unwrap();
        let mut next = state.clone();

        let value = update_fn(&mut next)?;

        let changes = S::detect_changes(&state, &next);
        *state = next;

        for change in &changes {
            // Ignore send errors - it's OK if no one is listening
            let _ = self.state_tx.send(change.clone());
        }

        Ok((changes, value))
    }

    /// Emit an event that is not derived from a state diff
    pub fn emit(&self, change: S::Change) {
        let _state = self.state.read().unwrap();
        let _ = self.state_tx.send(change);
    }

    /// Subscribe to state change events
    ///
    /// Returns a receiver that will get notified of all future state changes.
    /// Multiple subscribers can listen simultaneously.
    pub fn subscribe(&self) -> broadcast::Receiver<S::Change> {
        self.state_tx.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.state_tx.receiver_count()
    }
}

// Make StateManager cloneable for sharing across tasks
impl<S: Observable> Clone for StateManager<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            state_tx: self.state_tx.clone(),
        }
    }
}

impl<S: Observable + Default> Default for StateManager<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}
