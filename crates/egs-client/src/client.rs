//! Connection to a guest.

use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use egs_core::auth::{Signer, key_fingerprint};
use egs_core::error::Result;
use egs_core::protocol::DisconnectReason;
use egs_core::session::{Session, SessionEvent, SessionEvents};
use egs_core::transport::{VmTarget, create_client_endpoint};

/// An authenticated session with a guest service.
///
/// The guest never opens channels or sends requests towards the host, so
/// any that arrive are refused.
pub struct GuestClient {
    session: Session,
    drain: JoinHandle<()>,
}

impl GuestClient {
    /// Connect to `service_id` in the VM named by `target`.
    pub async fn connect(
        target: VmTarget,
        service_id: &Uuid,
        signer: &dyn Signer,
        expected_host_key: Option<&PublicKey>,
    ) -> Result<Self> {
        info!(target = %target, service_id = %service_id, "Connecting");
        let io = create_client_endpoint(target, service_id).await?;
        Self::handshake(io, signer, expected_host_key).await
    }

    /// Authenticate over an already connected stream.
    pub async fn handshake<T>(io: T, signer: &dyn Signer, expected_host_key: Option<&PublicKey>) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (session, events) = Session::connect(io, signer, expected_host_key).await?;
        info!(key = %key_fingerprint(signer.public_key()), "Session established");
        Ok(Self {
            session,
            drain: tokio::spawn(drain_events(events)),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// End the session politely.
    pub async fn disconnect(&self) -> Result<()> {
        self.session
            .disconnect(DisconnectReason::ByApplication, "client finished")
            .await
    }
}

impl Drop for GuestClient {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

async fn drain_events(mut events: SessionEvents) {
    while let Some(event) = events.next().await {
        match event {
            SessionEvent::ChannelOpened(channel) => {
                debug!(channel_id = %channel.id(), "Closing guest-initiated channel");
                let _ = channel.close(None).await;
            }
            SessionEvent::ChannelRequest(request) => {
                debug!(request_type = %request.request_type, "Refusing guest request");
            }
        }
    }
}
