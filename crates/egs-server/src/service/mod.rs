//! Channel services: request-type dispatch onto forwarders.
//!
//! Each service claims a set of request types and turns a decoded request
//! into an [`Action`]. [`ChannelServices`] owns the flat dispatch table and
//! the per-session [`ForwarderRegistry`], registers forwarders atomically,
//! and removes them again when their channel closes.

mod command;
mod file;
mod list;
mod shell;
mod subsystem;

use std::sync::Arc;

use tracing::{debug, warn};

use egs_core::error::Result;
use egs_core::session::{Channel, IncomingRequest};

use crate::forwarder::Forwarder;
use crate::registry::ForwarderRegistry;

pub use command::CommandService;
pub use file::FileTransferService;
pub use list::ListDirectoryService;
pub use shell::ShellService;
pub use subsystem::{SubsystemService, powershell_command};

/// What to do with an accepted request.
pub enum Action {
    /// Register a new forwarder and start it once the reply is sent.
    Start(Arc<dyn Forwarder>),
    /// Register a new forwarder without starting it.
    Register(Arc<dyn Forwarder>),
    /// Start the forwarder already registered on the channel.
    StartExisting,
    /// Reply success; the request was applied to existing state.
    Accept,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Start(fwd) => write!(f, "Start({})", fwd.kind()),
            Action::Register(fwd) => write!(f, "Register({})", fwd.kind()),
            Action::StartExisting => f.write_str("StartExisting"),
            Action::Accept => f.write_str("Accept"),
        }
    }
}

/// A capability answering one family of channel requests.
pub trait ChannelService: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, request_type: &str) -> bool;

    /// Decode `payload` and decide. An error rejects the request.
    ///
    /// `existing` is the forwarder already registered on the channel.
    fn handle(
        &self,
        request_type: &str,
        payload: &[u8],
        existing: Option<&Arc<dyn Forwarder>>,
    ) -> Result<Action>;
}

/// Dispatch table plus the forwarders of one session.
pub struct ChannelServices {
    services: Vec<Box<dyn ChannelService>>,
    registry: Arc<ForwarderRegistry>,
}

impl ChannelServices {
    pub fn new(services: Vec<Box<dyn ChannelService>>) -> Self {
        Self {
            services,
            registry: Arc::new(ForwarderRegistry::new()),
        }
    }

    /// Every service the guest offers.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(ShellService),
            Box::new(CommandService),
            Box::new(SubsystemService),
            Box::new(FileTransferService),
            Box::new(ListDirectoryService),
        ])
    }

    pub fn registry(&self) -> &Arc<ForwarderRegistry> {
        &self.registry
    }

    fn find(&self, request_type: &str) -> Option<&dyn ChannelService> {
        self.services
            .iter()
            .find(|s| s.handles(request_type))
            .map(|s| s.as_ref())
    }

    /// Answer one channel request.
    pub async fn handle_request(&self, request: IncomingRequest) -> Result<()> {
        let channel_id = request.channel.id();
        let request_type = request.request_type.clone();

        let Some(service) = self.find(&request_type) else {
            debug!(channel_id = %channel_id, request_type = %request_type, "No service for request");
            return request.reject().await;
        };

        let existing = self.registry.get(channel_id);
        let action = match service.handle(&request_type, &request.payload, existing.as_ref()) {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    channel_id = %channel_id,
                    request_type = %request_type,
                    service = service.name(),
                    error = %e,
                    "Request rejected"
                );
                return request.reject().await;
            }
        };
        debug!(channel_id = %channel_id, request_type = %request_type, action = ?action, "Request accepted");

        match action {
            Action::Start(forwarder) => {
                let channel = request.channel.clone();
                if !self.register(&channel, Arc::clone(&forwarder)) {
                    return request.reject().await;
                }
                if let Err(e) = request.accept().await {
                    self.registry.remove_and_dispose(channel_id);
                    return Err(e);
                }
                spawn_forwarder(forwarder, channel);
                Ok(())
            }
            Action::Register(forwarder) => {
                let channel = request.channel.clone();
                if !self.register(&channel, forwarder) {
                    return request.reject().await;
                }
                request.accept().await
            }
            Action::StartExisting => {
                let Some(forwarder) = existing else {
                    return request.reject().await;
                };
                if !forwarder.claim() {
                    debug!(
                        channel_id = %channel_id,
                        request_type = %request_type,
                        phase = ?forwarder.phase(),
                        "Forwarder already started"
                    );
                    return request.reject().await;
                }
                let channel = request.channel.clone();
                request.accept().await?;
                spawn_forwarder(forwarder, channel);
                Ok(())
            }
            Action::Accept => request.accept().await,
        }
    }

    /// Insert-if-absent, then tie the forwarder's lifetime to the channel.
    fn register(&self, channel: &Channel, forwarder: Arc<dyn Forwarder>) -> bool {
        let channel_id = channel.id();
        if !self.registry.try_insert(channel_id, Arc::clone(&forwarder)) {
            debug!(channel_id = %channel_id, kind = forwarder.kind(), "Duplicate forwarder refused");
            forwarder.dispose();
            return false;
        }

        let registry = Arc::clone(&self.registry);
        let channel = channel.clone();
        tokio::spawn(async move {
            channel.closed().await;
            registry.remove_and_dispose(channel.id());
        });
        true
    }

    /// Dispose every forwarder of the session.
    pub fn dispose(&self) {
        let count = self.registry.dispose_all();
        if count > 0 {
            debug!(count, "Disposed forwarders");
        }
    }
}

impl Drop for ChannelServices {
    fn drop(&mut self) {
        self.registry.dispose_all();
    }
}

fn spawn_forwarder(forwarder: Arc<dyn Forwarder>, channel: Channel) {
    tokio::spawn(async move {
        let channel_id = channel.id();
        if let Err(e) = forwarder.start(channel).await {
            debug!(channel_id = %channel_id, kind = forwarder.kind(), error = %e, "Forwarder ended with error");
        }
    });
}

#[cfg(test)]
mod tests;
