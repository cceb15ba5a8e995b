use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::types::Envelope;

#[derive(Debug, Default)]
struct RetentionInner {
    entries: HashMap<String, Envelope>,
    order: VecDeque<String>,
}

/// Keyed store of recent envelopes used to answer transport re-delivery lookups.
///
/// Clones share the same storage. Without a capacity the cache only shrinks on
/// [`RetentionCache::clear`]; with one, the oldest insertion is evicted first.
#[derive(Debug, Clone, Default)]
pub struct RetentionCache {
    inner: Arc<Mutex<RetentionInner>>,
    capacity: Option<usize>,
}

impl RetentionCache {
    /// Unbounded cache, cleared only on explicit disconnect.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Cache holding at most `capacity` envelopes (`capacity >= 1`).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Configured capacity, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn put(&self, message_id: impl Into<String>, envelope: Envelope) {
        let message_id = message_id.into();
        let mut inner = self.lock();
        if inner.entries.insert(message_id.clone(), envelope).is_none() {
            inner.order.push_back(message_id);
        }
        self.trim_to_capacity(&mut inner);
    }

    pub fn get(&self, message_id: &str) -> Option<Envelope> {
        self.lock().entries.get(message_id).cloned()
    }

    pub fn remove(&self, message_id: &str) -> Option<Envelope> {
        let mut inner = self.lock();
        let removed = inner.entries.remove(message_id)?;
        inner.order.retain(|id| id != message_id);
        Some(removed)
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn trim_to_capacity(&self, inner: &mut RetentionInner) {
        let Some(capacity) = self.capacity else {
            return;
        };

        while inner.entries.len() > capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RetentionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
