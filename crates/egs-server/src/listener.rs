//! Socket server: accepts hypervisor socket connections and serves sessions.
//!
//! One task per accepted connection runs the handshake and then answers
//! channel requests through [`ChannelServices`]. Failures while setting a
//! session up are reported as [`ServerEvent::ExceptionRaised`] and never
//! stop the accept loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use egs_core::error::Result;
use egs_core::protocol::{ChannelId, DisconnectReason};
use egs_core::session::{Authenticator, Session, SessionEvent, SessionEvents};
use egs_core::transport::{HvListener, HvStream};

use crate::service::ChannelServices;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Capacity of the server event broadcast.
const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Acceptor
// =============================================================================

/// Source of raw connections.
#[async_trait]
pub trait Acceptor: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Wait for the next connection and describe its peer.
    async fn accept(&self) -> Result<(Self::Stream, String)>;
}

#[async_trait]
impl Acceptor for HvListener {
    type Stream = HvStream;

    async fn accept(&self) -> Result<(HvStream, String)> {
        let (stream, peer) = HvListener::accept(self).await?;
        Ok((stream, peer.to_string()))
    }
}

// =============================================================================
// Events
// =============================================================================

/// Notifications for listeners of the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    SessionAuthenticated { session: u64, peer: String },
    ChannelOpened { session: u64, channel_id: ChannelId },
    SessionClosed { session: u64 },
    /// A connection failed before or while its session was set up.
    ExceptionRaised { peer: String, message: String },
}

// =============================================================================
// SocketServer
// =============================================================================

struct ServerShared {
    host_key: PublicKey,
    authenticator: Arc<dyn Authenticator>,
    sessions: Mutex<HashMap<u64, Session>>,
    next_session: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl ServerShared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Accept loop plus the set of live sessions.
#[derive(Clone)]
pub struct SocketServer {
    shared: Arc<ServerShared>,
}

impl SocketServer {
    pub fn new(host_key: PublicKey, authenticator: Arc<dyn Authenticator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(ServerShared {
                host_key,
                authenticator,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                events,
                cancel: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions().len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Accept connections until the server is disposed.
    pub async fn run<A: Acceptor>(&self, acceptor: A) -> Result<()> {
        info!("Accepting sessions");
        loop {
            let accepted = tokio::select! {
                result = acceptor.accept() => result,
                _ = self.shared.cancel.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer)) => self.serve_connection(stream, peer),
                Err(e) => {
                    debug!(error = %e, "Accept error");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        _ = self.shared.cancel.cancelled() => break,
                    }
                }
            }
        }
        info!("Accept loop stopped");
        Ok(())
    }

    /// Serve one accepted connection on its own task.
    pub fn serve_connection<S>(&self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            debug!(peer = %peer, "Connection accepted");
            let accepted =
                Session::accept(stream, &shared.host_key, Arc::clone(&shared.authenticator)).await;
            let (session, events) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Session setup failed");
                    shared.emit(ServerEvent::ExceptionRaised {
                        peer,
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
            shared.sessions().insert(id, session.clone());
            if shared.cancel.is_cancelled() {
                // Disposed while the handshake ran.
                if shared.sessions().remove(&id).is_some() {
                    let _ = session
                        .disconnect(DisconnectReason::ServiceShutdown, "service stopping")
                        .await;
                }
                return;
            }

            info!(session = id, peer = %peer, "Session authenticated");
            shared.emit(ServerEvent::SessionAuthenticated { session: id, peer });

            serve_session(&shared, id, &session, events).await;

            shared.sessions().remove(&id);
            shared.emit(ServerEvent::SessionClosed { session: id });
            info!(session = id, "Session closed");
        });
    }

    /// Stop accepting and disconnect every session. Idempotent.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();

        let sessions: Vec<(u64, Session)> = self.shared.sessions().drain().collect();
        for (id, session) in sessions {
            debug!(session = id, "Disconnecting session");
            if let Err(e) = session
                .disconnect(DisconnectReason::ServiceShutdown, "service stopping")
                .await
            {
                debug!(session = id, error = %e, "Disconnect failed");
            }
        }
    }
}

/// Answer channel requests until the session ends or the server stops.
async fn serve_session(shared: &ServerShared, id: u64, session: &Session, mut events: SessionEvents) {
    let services = ChannelServices::standard();
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = shared.cancel.cancelled() => break,
        };
        match event {
            Some(SessionEvent::ChannelOpened(channel)) => {
                debug!(session = id, channel_id = %channel.id(), "Channel opened");
                shared.emit(ServerEvent::ChannelOpened {
                    session: id,
                    channel_id: channel.id(),
                });
            }
            Some(SessionEvent::ChannelRequest(request)) => {
                if let Err(e) = services.handle_request(request).await {
                    if session.is_closed() {
                        break;
                    }
                    error!(session = id, error = %e, "Failed to answer channel request");
                }
            }
            None => break,
        }
    }
    services.dispose();
}
