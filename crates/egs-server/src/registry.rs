//! Forwarder registry: at most one live forwarder per channel.
//!
//! Every mutation is a single insert-if-absent or remove-if-present under
//! the map lock. The lock is never held across forwarder I/O.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use egs_core::protocol::ChannelId;

use crate::forwarder::Forwarder;

/// Channel id to forwarder map shared by all channel services of a session.
#[derive(Default)]
pub struct ForwarderRegistry {
    forwarders: Mutex<HashMap<ChannelId, Arc<dyn Forwarder>>>,
}

impl ForwarderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<dyn Forwarder>>> {
        self.forwarders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `forwarder` unless the channel already has one.
    ///
    /// Returns false (and leaves the existing entry alone) on a duplicate.
    pub fn try_insert(&self, channel_id: ChannelId, forwarder: Arc<dyn Forwarder>) -> bool {
        let mut map = self.map();
        if map.contains_key(&channel_id) {
            return false;
        }
        map.insert(channel_id, forwarder);
        true
    }

    pub fn get(&self, channel_id: ChannelId) -> Option<Arc<dyn Forwarder>> {
        self.map().get(&channel_id).cloned()
    }

    pub fn contains(&self, channel_id: ChannelId) -> bool {
        self.map().contains_key(&channel_id)
    }

    /// Remove the channel's forwarder, if present.
    pub fn remove(&self, channel_id: ChannelId) -> Option<Arc<dyn Forwarder>> {
        self.map().remove(&channel_id)
    }

    /// Remove and dispose the channel's forwarder.
    pub fn remove_and_dispose(&self, channel_id: ChannelId) -> bool {
        match self.remove(channel_id) {
            Some(forwarder) => {
                debug!(channel_id = %channel_id, kind = forwarder.kind(), "Disposing forwarder");
                forwarder.dispose();
                true
            }
            None => false,
        }
    }

    /// Dispose every registered forwarder and clear the map.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<_> = self.map().drain().collect();
        let count = drained.len();
        for (_, forwarder) in drained {
            forwarder.dispose();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::{ForwarderPhase, ProcessForwarder};

    fn forwarder() -> Arc<dyn Forwarder> {
        Arc::new(ProcessForwarder::new("true", Vec::new()))
    }

    #[test]
    fn duplicate_insert_is_refused() {
        let registry = ForwarderRegistry::new();
        let id = ChannelId::client(1);
        let first = forwarder();
        assert!(registry.try_insert(id, Arc::clone(&first)));
        assert!(!registry.try_insert(id, forwarder()));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(id).unwrap(), &first));
    }

    #[test]
    fn remove_and_dispose_once() {
        let registry = ForwarderRegistry::new();
        let id = ChannelId::server(0);
        let entry = forwarder();
        registry.try_insert(id, Arc::clone(&entry));

        assert!(registry.remove_and_dispose(id));
        assert!(!registry.remove_and_dispose(id));
        assert_eq!(entry.phase(), ForwarderPhase::Terminal);
        assert!(registry.is_empty());
    }

    #[test]
    fn dispose_all_clears() {
        let registry = ForwarderRegistry::new();
        for n in 0..4 {
            registry.try_insert(ChannelId::client(n), forwarder());
        }
        assert_eq!(registry.dispose_all(), 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_inserts_register_exactly_one() {
        let registry = Arc::new(ForwarderRegistry::new());
        let id = ChannelId::client(9);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.try_insert(id, forwarder()))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
