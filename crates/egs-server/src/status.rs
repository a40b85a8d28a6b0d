//! Service status publication to the host.
//!
//! Publication is fire-and-forget: failures are logged and never stop the
//! service.

use tracing::{debug, info, warn};

use egs_core::constants::{OPERATING_SYSTEM_KEY, STATUS_AVAILABLE, STATUS_KEY, VERSION_KEY};
use egs_core::error::Result;

use crate::kvp::KvpPool;

/// A key/value side channel visible to the host.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, key: &str, value: &str) -> Result<()>;

    fn clear(&self, key: &str) -> Result<()>;
}

/// Writes into the guest-to-host KVP pool file.
pub struct KvpStatusPublisher {
    pool: KvpPool,
}

impl KvpStatusPublisher {
    pub fn new(pool: KvpPool) -> Self {
        Self { pool }
    }
}

impl StatusPublisher for KvpStatusPublisher {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        self.pool.set(key, value)
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.pool.remove(key).map(|_| ())
    }
}

/// Only logs. Used when status publication is disabled or unavailable.
pub struct LogStatusPublisher;

impl StatusPublisher for LogStatusPublisher {
    fn publish(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, value, "Status not published");
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        debug!(key, "Status not cleared");
        Ok(())
    }
}

/// Announce that the service is listening.
pub fn announce(publisher: &dyn StatusPublisher) {
    let items = [
        (OPERATING_SYSTEM_KEY, std::env::consts::OS),
        (VERSION_KEY, env!("CARGO_PKG_VERSION")),
        (STATUS_KEY, STATUS_AVAILABLE),
    ];
    for (key, value) in items {
        if let Err(e) = publisher.publish(key, value) {
            warn!(key, error = %e, "Failed to publish status");
        }
    }
    info!("Service status published");
}

/// Withdraw the availability announcement.
pub fn withdraw(publisher: &dyn StatusPublisher) {
    if let Err(e) = publisher.clear(STATUS_KEY) {
        warn!(key = STATUS_KEY, error = %e, "Failed to clear status");
    }
}
