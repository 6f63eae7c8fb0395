use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use reverie_types::{CompletionValue, TerminalError};

use crate::error::Error;

#[derive(Clone, Debug)]
enum SlotState {
    Pending,
    Done(CompletionValue),
    /// Cancelled or the stream closed underneath the await.
    Aborted,
}

#[derive(Debug)]
struct SlotInner {
    state: Mutex<SlotState>,
    notify: Notify,
}

/// One-shot rendezvous between a command and its completion.
///
/// Resolution sticks: awaiters observe exactly one of success payload,
/// failure, or cancellation, no matter how resolution and awaiting
/// interleave.
#[derive(Clone, Debug)]
pub struct CompletionSlot {
    inner: Arc<SlotInner>,
}

impl CompletionSlot {
    fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState::Pending),
                notify: Notify::new(),
            }),
        }
    }

    fn resolve(&self, value: CompletionValue) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Done(value);
        drop(state);
        self.inner.notify.notify_waiters();
        true
    }

    fn abort(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Aborted;
        drop(state);
        self.inner.notify.notify_waiters();
        true
    }

    fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), SlotState::Pending)
    }

    /// Await resolution. Registration with the notifier happens before
    /// the state check, so a resolution racing with this call cannot be
    /// missed.
    pub async fn wait(&self) -> Result<CompletionValue, Error> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock().unwrap();
                match &*state {
                    SlotState::Done(value) => return Ok(value.clone()),
                    SlotState::Aborted => return Err(Error::Aborted),
                    SlotState::Pending => {}
                }
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct ManagerState {
    slots: HashMap<u32, CompletionSlot>,
    closed: bool,
}

/// Index-keyed rendezvous registry.
///
/// Two independent instances exist per invocation: one keyed by journal
/// index, one keyed by signal index. Completions may arrive before the
/// handler registers interest; the slot is created on first touch from
/// either side.
#[derive(Default)]
pub struct CompletionManager {
    state: Mutex<ManagerState>,
}

impl CompletionManager {
    /// Idempotent: repeated calls for one index return the same slot.
    pub fn get_or_register(&self, index: u32) -> CompletionSlot {
        let mut state = self.state.lock().unwrap();
        let slot = state
            .slots
            .entry(index)
            .or_insert_with(CompletionSlot::new)
            .clone();
        if state.closed {
            slot.abort();
        }
        slot
    }

    /// Resolve the rendezvous at `index`; a no-op if already resolved.
    pub fn try_complete(&self, index: u32, value: CompletionValue) {
        self.get_or_register(index).resolve(value);
    }

    /// Resolve the rendezvous at `index` as a failure.
    pub fn try_fail(&self, index: u32, error: TerminalError) {
        self.try_complete(index, CompletionValue::Failure(error));
    }

    /// Fail every pending rendezvous and poison future registrations.
    /// Used at shutdown and when the incoming stream closes.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        for slot in state.slots.values() {
            slot.abort();
        }
    }

    pub fn pending_indexes(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();
        let mut indexes: Vec<u32> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_pending())
            .map(|(idx, _)| *idx)
            .collect();
        indexes.sort_unstable();
        indexes
    }
}
