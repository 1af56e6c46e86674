//! The live-handle set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::handle::ChannelHandle;
use super::ChannelId;

#[derive(Default)]
struct State {
    handles: HashMap<ChannelId, Arc<dyn ChannelHandle>>,
    sealed: bool,
}

/// Live handles of one listener, behind a single lock.
///
/// Iteration is only possible through owned snapshots. Once sealed, inserts
/// are refused until [`HandleSet::unseal`] so a stop's snapshot is complete.
#[derive(Default)]
pub struct HandleSet {
    state: Mutex<State>,
}

impl HandleSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a handle. Returns `false` when the set is sealed.
    pub fn insert(&self, handle: Arc<dyn ChannelHandle>) -> bool {
        let mut state = self.lock();
        if state.sealed {
            return false;
        }
        state.handles.insert(handle.channel_id(), handle);
        true
    }

    pub fn remove(&self, id: ChannelId) -> Option<Arc<dyn ChannelHandle>> {
        self.lock().handles.remove(&id)
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn ChannelHandle>> {
        self.lock().handles.values().cloned().collect()
    }

    /// Refuse further inserts and copy out the current members.
    pub fn seal_and_snapshot(&self) -> Vec<Arc<dyn ChannelHandle>> {
        let mut state = self.lock();
        state.sealed = true;
        state.handles.values().cloned().collect()
    }

    pub fn unseal(&self) {
        self.lock().sealed = false;
    }

    /// Refuse further inserts and remove every member.
    pub fn seal_and_drain(&self) -> Vec<Arc<dyn ChannelHandle>> {
        let mut state = self.lock();
        state.sealed = true;
        state.handles.drain().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
