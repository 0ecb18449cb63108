//! Multi-subscriber event channel with replay and configurable overflow handling.
//!
//! Every subscriber sees every value emitted after it subscribed, in emission order.
//! The buffer is bounded by the slowest subscriber: once it holds
//! `replay + extra_buffer_capacity` values that subscriber has not read yet, the
//! overflow policy decides between waiting, dropping the oldest value, or dropping the
//! new one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Deserialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{Error, Result};

/// What `emit` does when the buffer is full.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferOverflow {
    /// Wait until the slowest subscriber catches up.
    #[default]
    Suspend,
    /// Discard the oldest buffered value.
    DropOldest,
    /// Discard the value being emitted.
    DropLatest,
}

/// Sizing and overflow settings for an [`EventFlow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    /// Values replayed to a new subscriber.
    pub replay: usize,
    /// Buffer space beyond the replay cache.
    pub extra_buffer_capacity: usize,
    pub overflow: BufferOverflow,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            replay: 0,
            extra_buffer_capacity: 32,
            overflow: BufferOverflow::Suspend,
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.overflow != BufferOverflow::Suspend && self.capacity() == 0 {
            return Err(Error::InvalidFlowConfig(format!(
                "{:?} requires replay or extra_buffer_capacity to be positive",
                self.overflow
            )));
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.replay.saturating_add(self.extra_buffer_capacity)
    }
}

/// Outcome of a non-blocking emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    /// The value was buffered.
    Buffered,
    /// The value was discarded by [`BufferOverflow::DropLatest`].
    Dropped,
}

struct FlowState<T> {
    /// Values still needed by a subscriber or kept for replay.
    buffer: VecDeque<T>,
    /// Sequence number of `buffer[0]`.
    head: u64,
    /// Subscriber id -> sequence number of the next value it reads.
    cursors: HashMap<u64, u64>,
    next_id: u64,
}

impl<T> FlowState<T> {
    fn tail(&self) -> u64 {
        self.head + self.buffer.len() as u64
    }

    fn slowest(&self) -> Option<u64> {
        self.cursors.values().copied().min()
    }

    /// Drop values every subscriber has read, keeping the replay cache.
    fn trim(&mut self, replay: usize) {
        let oldest_needed = self.slowest().unwrap_or_else(|| self.tail());
        while self.buffer.len() > replay && self.head < oldest_needed {
            self.buffer.pop_front();
            self.head += 1;
        }
    }
}

struct FlowShared<T> {
    config: FlowConfig,
    state: Mutex<FlowState<T>>,
    /// Signalled when a value is buffered.
    emitted: Notify,
    /// Signalled when a subscriber reads or leaves.
    consumed: Notify,
}

impl<T> FlowShared<T> {
    fn lock(&self) -> MutexGuard<'_, FlowState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broadcast channel feeding listener events to any number of subscribers.
pub struct EventFlow<T> {
    shared: Arc<FlowShared<T>>,
}

impl<T> Clone for EventFlow<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> EventFlow<T> {
    pub fn new(config: FlowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(FlowShared {
                config,
                state: Mutex::new(FlowState {
                    buffer: VecDeque::new(),
                    head: 0,
                    cursors: HashMap::new(),
                    next_id: 0,
                }),
                emitted: Notify::new(),
                consumed: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.shared.config
    }

    /// Register a subscriber. It first receives the replay cache.
    pub fn subscribe(&self) -> Subscriber<T> {
        let mut state = self.shared.lock();
        let replayed = state.buffer.len().min(self.shared.config.replay) as u64;
        let cursor = state.tail() - replayed;
        let id = state.next_id;
        state.next_id += 1;
        state.cursors.insert(id, cursor);

        Subscriber {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().cursors.len()
    }

    /// Values a new subscriber would be replayed.
    pub fn replay_cache(&self) -> Vec<T> {
        let state = self.shared.lock();
        let skip = state.buffer.len().saturating_sub(self.shared.config.replay);
        state.buffer.iter().skip(skip).cloned().collect()
    }

    /// Emit a value, waiting for buffer space under [`BufferOverflow::Suspend`].
    ///
    /// Cancel safe: if the future is dropped while waiting, the value was not emitted.
    pub async fn emit(&self, value: T) -> Emitted {
        let mut value = value;
        loop {
            let consumed = self.shared.consumed.notified();
            match self.push(value) {
                Ok(emitted) => return emitted,
                Err(rejected) => value = rejected,
            }
            consumed.await;
        }
    }

    /// Emit without waiting. Returns the value back if the buffer is full and the
    /// policy is [`BufferOverflow::Suspend`].
    pub fn try_emit(&self, value: T) -> std::result::Result<Emitted, T> {
        self.push(value)
    }

    fn push(&self, value: T) -> std::result::Result<Emitted, T> {
        let config = &self.shared.config;
        let mut state = self.shared.lock();

        if let Some(slowest) = state.slowest() {
            let pending = (state.tail() - slowest) as usize;
            if pending >= config.capacity().max(1) {
                match config.overflow {
                    BufferOverflow::Suspend => return Err(value),
                    BufferOverflow::DropLatest => {
                        debug!(pending, "flow buffer full, dropping latest value");
                        return Ok(Emitted::Dropped);
                    }
                    BufferOverflow::DropOldest => {
                        debug!(pending, "flow buffer full, dropping oldest value");
                        let floor = state.tail() + 1 - config.capacity() as u64;
                        for cursor in state.cursors.values_mut() {
                            if *cursor < floor {
                                *cursor = floor;
                            }
                        }
                    }
                }
            }
        }

        state.buffer.push_back(value);
        state.trim(config.replay);
        drop(state);

        self.shared.emitted.notify_waiters();
        Ok(Emitted::Buffered)
    }
}

/// Receiving side of an [`EventFlow`]. Dropping it unsubscribes.
pub struct Subscriber<T> {
    id: u64,
    shared: Arc<FlowShared<T>>,
}

impl<T: Clone> Subscriber<T> {
    /// Wait for the next value.
    pub async fn recv(&mut self) -> T {
        let shared = Arc::clone(&self.shared);
        loop {
            let emitted = shared.emitted.notified();
            if let Some(value) = self.try_recv() {
                return value;
            }
            emitted.await;
        }
    }

    /// Next value if one is buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        let mut state = self.shared.lock();
        let head = state.head;
        let cursor = state.cursors.get(&self.id).copied()?.max(head);
        if cursor >= state.tail() {
            return None;
        }

        let value = state.buffer[(cursor - head) as usize].clone();
        state.cursors.insert(self.id, cursor + 1);
        state.trim(self.shared.config.replay);
        drop(state);

        self.shared.consumed.notify_waiters();
        Some(value)
    }

    /// Values buffered for this subscriber.
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        state
            .cursors
            .get(&self.id)
            .map_or(0, |cursor| (state.tail() - (*cursor).max(state.head)) as usize)
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.cursors.remove(&self.id);
            state.trim(self.shared.config.replay);
        }
        self.shared.consumed.notify_waiters();
    }
}
