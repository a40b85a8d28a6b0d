//! Multiplexed sessions over a single byte stream.
//!
//! A session owns two tasks: a writer draining one ordered outbound queue
//! and a reader dispatching inbound frames to channels. Incoming channel
//! opens and requests surface as [`SessionEvent`]s.

mod channel;
mod handshake;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub use channel::{Channel, ChannelReader, ChannelStream, ChannelWriter};
pub use handshake::Authenticator;

use channel::ChannelShared;

use crate::auth::Signer;
use crate::constants::{HANDSHAKE_TIMEOUT, MAX_PACKET_SIZE, OUTBOUND_QUEUE_DEPTH};
use crate::error::{Error, Result};
use crate::protocol::{
    ChannelClosePayload, ChannelId, ChannelRequestPayload, ChannelSide, Codec, DisconnectPayload,
    DisconnectReason, Message,
};

// =============================================================================
// Events
// =============================================================================

/// Something the peer asked of us.
#[derive(Debug)]
pub enum SessionEvent {
    ChannelOpened(Channel),
    ChannelRequest(IncomingRequest),
}

/// Stream of inbound session events. Ends when the session closes.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

/// A channel request awaiting our verdict.
///
/// Dropping it without answering rejects the request.
#[derive(Debug)]
pub struct IncomingRequest {
    pub channel: Channel,
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Bytes,
    outbound: mpsc::Sender<Message>,
    answered: bool,
}

impl IncomingRequest {
    pub async fn accept(mut self) -> Result<()> {
        self.reply(true).await
    }

    pub async fn reject(mut self) -> Result<()> {
        self.reply(false).await
    }

    async fn reply(&mut self, success: bool) -> Result<()> {
        self.answered = true;
        if !self.want_reply {
            return Ok(());
        }
        self.outbound
            .send(reply_frame(self.channel.id(), success))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl Drop for IncomingRequest {
    fn drop(&mut self) {
        if !self.answered && self.want_reply {
            send_control(&self.outbound, reply_frame(self.channel.id(), false));
        }
    }
}

fn reply_frame(channel_id: ChannelId, success: bool) -> Message {
    if success {
        Message::ChannelSuccess { channel_id }
    } else {
        Message::ChannelFailure { channel_id }
    }
}

/// Queue a control frame without blocking the caller.
///
/// The reader task must never wait on the outbound queue, otherwise two
/// peers with full queues could deadlock each other.
fn send_control(outbound: &mpsc::Sender<Message>, msg: Message) {
    match outbound.try_send(msg) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(msg)) => {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let outbound = outbound.clone();
                handle.spawn(async move {
                    let _ = outbound.send(msg).await;
                });
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

// =============================================================================
// Session
// =============================================================================

struct SessionInner {
    side: ChannelSide,
    outbound: mpsc::Sender<Message>,
    channels: Mutex<HashMap<ChannelId, Arc<ChannelShared>>>,
    pending_opens: Mutex<HashMap<ChannelId, oneshot::Sender<std::result::Result<(), String>>>>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// An authenticated, multiplexed session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Run the accepting handshake and start the session.
    pub async fn accept<T>(
        mut io: T,
        host_key: &PublicKey,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<(Session, SessionEvents)>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake::server_handshake(&mut io, &mut buf, host_key, authenticator),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        Ok(Self::spawn(io, buf, ChannelSide::Server))
    }

    /// Run the connecting handshake and start the session.
    ///
    /// When `expected_host_key` is set, any other host key is refused.
    pub async fn connect<T>(
        mut io: T,
        signer: &dyn Signer,
        expected_host_key: Option<&PublicKey>,
    ) -> Result<(Session, SessionEvents)>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
        tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            handshake::client_handshake(&mut io, &mut buf, signer, expected_host_key),
        )
        .await
        .map_err(|_| Error::Timeout)??;
        Ok(Self::spawn(io, buf, ChannelSide::Client))
    }

    fn spawn<T>(io: T, leftover: BytesMut, side: ChannelSide) -> (Session, SessionEvents)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            side,
            outbound: outbound_tx,
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });

        let (reader, writer) = tokio::io::split(io);
        tokio::spawn(write_loop(writer, outbound_rx, inner.cancel.clone()));
        tokio::spawn(read_loop(reader, leftover, Arc::clone(&inner), events_tx));

        (Session { inner }, SessionEvents { rx: events_rx })
    }

    /// Open a channel to the peer.
    pub async fn open_channel(&self) -> Result<Channel> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let seq = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id = match self.inner.side {
            ChannelSide::Client => ChannelId::client(seq),
            ChannelSide::Server => ChannelId::server(seq),
        };
        let shared = ChannelShared::new(id, self.inner.outbound.clone(), MAX_PACKET_SIZE);
        let (tx, rx) = oneshot::channel();

        self.inner.lock_channels().insert(id, Arc::clone(&shared));
        self.inner.lock_pending_opens().insert(id, tx);

        let sent = self
            .inner
            .outbound
            .send(Message::ChannelOpen {
                channel_id: id,
                max_packet_size: MAX_PACKET_SIZE as u32,
            })
            .await;
        if sent.is_err() {
            self.inner.forget(id);
            return Err(Error::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(())) => {
                debug!(channel_id = %id, "Channel opened");
                Ok(Channel::from_shared(shared))
            }
            Ok(Err(reason)) => {
                self.inner.lock_channels().remove(&id);
                Err(Error::Channel {
                    message: format!("peer refused channel {}: {}", id, reason),
                })
            }
            Err(_) => Err(Error::ConnectionClosed),
        }
    }

    /// Send a disconnect and end the session.
    pub async fn disconnect(&self, reason: DisconnectReason, message: &str) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        debug!(reason = %reason, message, "Disconnecting session");
        let msg = Message::Disconnect(DisconnectPayload {
            reason,
            message: message.to_string(),
        });
        if self.inner.outbound.send(msg).await.is_err() {
            self.inner.cancel.cancel();
        }
        Ok(())
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Number of channels not yet closed by both sides.
    pub fn channel_count(&self) -> usize {
        self.inner.lock_channels().len()
    }
}

impl SessionInner {
    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, Arc<ChannelShared>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending_opens(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<ChannelId, oneshot::Sender<std::result::Result<(), String>>>>
    {
        self.pending_opens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self, id: &ChannelId) -> Option<Arc<ChannelShared>> {
        self.lock_channels().get(id).cloned()
    }

    fn forget(&self, id: ChannelId) {
        self.lock_channels().remove(&id);
        self.lock_pending_opens().remove(&id);
    }

    /// Handle one inbound frame. Returns false when the session must end.
    fn dispatch(&self, msg: Message, events: &mpsc::UnboundedSender<SessionEvent>) -> bool {
        trace!(kind = msg.kind(), "Received frame");
        match msg {
            Message::ChannelOpen {
                channel_id,
                max_packet_size,
            } => {
                if channel_id.side == self.side || self.lock_channels().contains_key(&channel_id) {
                    warn!(channel_id = %channel_id, "Refusing invalid channel open");
                    send_control(
                        &self.outbound,
                        Message::ChannelOpenFailure {
                            channel_id,
                            reason: "invalid channel id".to_string(),
                        },
                    );
                    return true;
                }
                let packet = (max_packet_size as usize).min(MAX_PACKET_SIZE);
                let shared = ChannelShared::new(channel_id, self.outbound.clone(), packet);
                self.lock_channels().insert(channel_id, Arc::clone(&shared));
                send_control(&self.outbound, Message::ChannelOpenConfirm { channel_id });
                debug!(channel_id = %channel_id, "Peer opened channel");
                let _ = events.send(SessionEvent::ChannelOpened(Channel::from_shared(shared)));
            }
            Message::ChannelOpenConfirm { channel_id } => {
                if let Some(tx) = self.lock_pending_opens().remove(&channel_id) {
                    let _ = tx.send(Ok(()));
                }
            }
            Message::ChannelOpenFailure { channel_id, reason } => {
                if let Some(tx) = self.lock_pending_opens().remove(&channel_id) {
                    let _ = tx.send(Err(reason));
                }
            }
            Message::ChannelRequest(ChannelRequestPayload {
                channel_id,
                request_type,
                want_reply,
                payload,
            }) => match self.channel(&channel_id) {
                Some(shared) => {
                    let request = IncomingRequest {
                        channel: Channel::from_shared(shared),
                        request_type,
                        want_reply,
                        payload: Bytes::from(payload),
                        outbound: self.outbound.clone(),
                        answered: false,
                    };
                    // A dropped receiver rejects through IncomingRequest's Drop.
                    let _ = events.send(SessionEvent::ChannelRequest(request));
                }
                None => {
                    debug!(channel_id = %channel_id, request_type = %request_type, "Request for unknown channel");
                    if want_reply {
                        send_control(&self.outbound, Message::ChannelFailure { channel_id });
                    }
                }
            },
            Message::ChannelSuccess { channel_id } | Message::ChannelFailure { channel_id } => {
                let success = matches!(msg, Message::ChannelSuccess { .. });
                let handled = self
                    .channel(&channel_id)
                    .map(|shared| shared.complete_reply(success))
                    .unwrap_or(false);
                if !handled {
                    debug!(channel_id = %channel_id, "Unsolicited request reply");
                }
            }
            Message::ChannelData { channel_id, data } => match self.channel(&channel_id) {
                Some(shared) => {
                    if !shared.push_data(Bytes::from(data)) {
                        debug!(channel_id = %channel_id, "Data after EOF dropped");
                    }
                }
                None => debug!(channel_id = %channel_id, "Data for unknown channel dropped"),
            },
            Message::ChannelEof { channel_id } => {
                if let Some(shared) = self.channel(&channel_id) {
                    shared.push_eof();
                }
            }
            Message::ChannelClose(ChannelClosePayload { channel_id, exit }) => {
                let removed = self.lock_channels().remove(&channel_id);
                if let Some(shared) = removed {
                    debug!(channel_id = %channel_id, exit = ?exit, "Peer closed channel");
                    shared.mark_closed(exit);
                    if shared.claim_close() {
                        send_control(
                            &self.outbound,
                            Message::ChannelClose(ChannelClosePayload {
                                channel_id,
                                exit: None,
                            }),
                        );
                    }
                }
                if let Some(tx) = self.lock_pending_opens().remove(&channel_id) {
                    let _ = tx.send(Err("closed before confirmation".to_string()));
                }
            }
            Message::Disconnect(DisconnectPayload { reason, message }) => {
                debug!(reason = %reason, message = %message, "Peer disconnected");
                return false;
            }
            other @ (Message::ServerHello(_) | Message::ClientHello(_) | Message::HelloAck(_)) => {
                warn!(kind = other.kind(), "Handshake frame after handshake");
                send_control(
                    &self.outbound,
                    Message::Disconnect(DisconnectPayload {
                        reason: DisconnectReason::ProtocolError,
                        message: format!("unexpected {}", other.kind()),
                    }),
                );
                return false;
            }
        }
        true
    }

    fn teardown(&self) {
        self.cancel.cancel();
        let channels: Vec<_> = self.lock_channels().drain().map(|(_, c)| c).collect();
        for shared in channels {
            shared.mark_closed(None);
        }
        self.lock_pending_opens().clear();
    }
}

// =============================================================================
// I/O tasks
// =============================================================================

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Message>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => msg,
            _ = cancel.cancelled() => None,
        };
        let Some(msg) = msg else { break };

        let is_disconnect = matches!(msg, Message::Disconnect(_));
        let bytes = match Codec::encode(&msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, kind = msg.kind(), "Failed to encode frame");
                break;
            }
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(error = %e, "Session write failed");
            break;
        }
        if is_disconnect {
            break;
        }
        if rx.is_empty() {
            if let Err(e) = writer.flush().await {
                debug!(error = %e, "Session flush failed");
                break;
            }
        }
    }

    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    cancel.cancel();
}

async fn read_loop<R>(
    mut reader: R,
    mut buf: BytesMut,
    inner: Arc<SessionInner>,
    events: mpsc::UnboundedSender<SessionEvent>,
) where
    R: AsyncRead + Unpin,
{
    'session: loop {
        loop {
            match Codec::decode(&mut buf) {
                Ok(Some(msg)) => {
                    if !inner.dispatch(msg, &events) {
                        break 'session;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Malformed frame, closing session");
                    send_control(
                        &inner.outbound,
                        Message::Disconnect(DisconnectPayload {
                            reason: DisconnectReason::ProtocolError,
                            message: e.to_string(),
                        }),
                    );
                    break 'session;
                }
            }
        }

        let read = tokio::select! {
            read = reader.read_buf(&mut buf) => read,
            _ = inner.cancel.cancelled() => break,
        };
        match read {
            Ok(0) => {
                debug!("Session stream closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Session read failed");
                break;
            }
        }
    }

    inner.teardown();
}
