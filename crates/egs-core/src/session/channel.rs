//! Channels multiplexed over one session.
//!
//! A [`Channel`] is a cheap handle; the byte stream is taken once through
//! [`Channel::stream`]. All outbound frames for a session share one ordered
//! queue, so a close sent after data never overtakes that data.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{
    ChannelClosePayload, ChannelExit, ChannelId, ChannelRequestPayload, Message, RequestMessage,
};

// =============================================================================
// Shared channel state
// =============================================================================

pub(crate) struct ChannelShared {
    pub(crate) id: ChannelId,
    outbound: mpsc::Sender<Message>,
    /// Dropped on peer EOF or close so readers observe end of stream.
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    /// Cancelled when the peer closes the channel or the session ends.
    closed: CancellationToken,
    exit: Mutex<Option<ChannelExit>>,
    close_sent: AtomicBool,
    /// Replies arrive in request order.
    pending_replies: Mutex<VecDeque<oneshot::Sender<bool>>>,
    request_lock: tokio::sync::Mutex<()>,
    max_packet_size: usize,
}

impl ChannelShared {
    pub(crate) fn new(id: ChannelId, outbound: mpsc::Sender<Message>, max_packet_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            outbound,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
            exit: Mutex::new(None),
            close_sent: AtomicBool::new(false),
            pending_replies: Mutex::new(VecDeque::new()),
            request_lock: tokio::sync::Mutex::new(()),
            max_packet_size: max_packet_size.max(1),
        })
    }

    /// Route inbound data. Returns false if the channel already saw EOF.
    pub(crate) fn push_data(&self, data: Bytes) -> bool {
        let guard = self.inbound_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                // A dropped reader means nobody wants the data; discard it.
                let _ = tx.send(data);
                true
            }
            None => false,
        }
    }

    pub(crate) fn push_eof(&self) {
        self.inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub(crate) fn complete_reply(&self, success: bool) -> bool {
        let next = self
            .pending_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(tx) => {
                let _ = tx.send(success);
                true
            }
            None => false,
        }
    }

    /// Mark the channel closed by the peer (or by session teardown).
    pub(crate) fn mark_closed(&self, exit: Option<ChannelExit>) {
        if let Some(exit) = exit {
            let mut slot = self.exit.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(exit);
            }
        }
        self.push_eof();
        self.pending_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.closed.cancel();
    }

    /// Claim the right to send the close frame. True exactly once.
    pub(crate) fn claim_close(&self) -> bool {
        !self.close_sent.swap(true, Ordering::AcqRel)
    }
}

// =============================================================================
// Channel handle
// =============================================================================

/// Handle to an open channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Send a channel request and wait for the peer's verdict.
    pub async fn request(&self, request_type: &str, payload: Bytes) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::Channel {
                message: format!("channel {} is closed", self.shared.id),
            });
        }

        let (tx, rx) = oneshot::channel();
        {
            let _order = self.shared.request_lock.lock().await;
            self.shared
                .pending_replies
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(tx);
            self.send(Message::ChannelRequest(ChannelRequestPayload {
                channel_id: self.shared.id,
                request_type: request_type.to_string(),
                want_reply: true,
                payload: payload.to_vec(),
            }))
            .await?;
        }

        trace!(channel_id = %self.shared.id, request_type, "Awaiting request reply");
        rx.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Send a typed request and wait for the verdict.
    pub async fn send_request<M: RequestMessage>(&self, message: &M) -> Result<bool> {
        self.request(M::REQUEST_TYPE, message.encode()?).await
    }

    /// Take the channel byte stream. Only the first call succeeds.
    pub fn stream(&self) -> Result<ChannelStream> {
        let rx = self
            .shared
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Channel {
                message: format!("stream of channel {} already taken", self.shared.id),
            })?;
        Ok(ChannelStream {
            reader: ChannelReader { rx, pending: None },
            writer: ChannelWriter {
                id: self.shared.id,
                sender: PollSender::new(self.shared.outbound.clone()),
                max_packet_size: self.shared.max_packet_size,
                eof_sent: false,
            },
        })
    }

    /// Close the channel. Later calls are no-ops.
    pub async fn close(&self, exit: Option<ChannelExit>) -> Result<()> {
        if !self.shared.claim_close() {
            return Ok(());
        }
        debug!(channel_id = %self.shared.id, exit = ?exit, "Closing channel");
        let msg = Message::ChannelClose(ChannelClosePayload {
            channel_id: self.shared.id,
            exit,
        });
        match self.send(msg).await {
            Ok(()) => Ok(()),
            // Session already gone; the channel is closed either way.
            Err(Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn close_with_status(&self, status: u32) -> Result<()> {
        self.close(Some(ChannelExit::Status(status))).await
    }

    pub async fn close_with_signal(&self, signal: &str, message: impl Into<String>) -> Result<()> {
        self.close(Some(ChannelExit::Signal {
            signal: signal.to_string(),
            message: message.into(),
        }))
        .await
    }

    /// Resolves once the peer closed the channel or the session ended.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Exit reported by the peer's close, if any.
    pub fn exit(&self) -> Option<ChannelExit> {
        self.shared
            .exit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.shared
            .outbound
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

// =============================================================================
// Byte stream
// =============================================================================

/// Read half of a channel stream.
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Option<Bytes>,
}

/// Write half of a channel stream.
pub struct ChannelWriter {
    id: ChannelId,
    sender: PollSender<Message>,
    max_packet_size: usize,
    eof_sent: bool,
}

/// Bidirectional byte stream over a channel.
pub struct ChannelStream {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl ChannelStream {
    pub fn into_split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(chunk) = self.pending.as_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    self.pending = None;
                }
                return Poll::Ready(Ok(()));
            }

            match ready!(self.rx.poll_recv(cx)) {
                Some(chunk) if chunk.is_empty() => continue,
                Some(chunk) => self.pending = Some(chunk),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.eof_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(self.sender.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let n = buf.len().min(self.max_packet_size);
        let msg = Message::ChannelData {
            channel_id: self.id,
            data: buf[..n].to_vec(),
        };
        self.sender.send_item(msg).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are already queued in order; the session writer flushes.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.eof_sent {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        let msg = Message::ChannelEof { channel_id: self.id };
        self.sender.send_item(msg).map_err(|_| broken_pipe())?;
        self.eof_sent = true;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ChannelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChannelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn channel_with_queue(max_packet: usize) -> (Channel, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let shared = ChannelShared::new(ChannelId::client(1), tx, max_packet);
        (Channel::from_shared(shared), rx)
    }

    #[tokio::test]
    async fn writes_are_chunked_to_packet_size() {
        let (channel, mut rx) = channel_with_queue(4);
        let mut stream = channel.stream().unwrap();
        stream.write_all(b"abcdefghij").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut sizes = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::ChannelData { data, .. } => sizes.push(data.len()),
                Message::ChannelEof { .. } => sizes.push(0),
                other => panic!("unexpected frame {}", other.kind()),
            }
        }
        assert_eq!(sizes, vec![4, 4, 2, 0]);
    }

    #[tokio::test]
    async fn reader_sees_eof_after_push_eof() {
        let (channel, _rx) = channel_with_queue(1024);
        let mut stream = channel.stream().unwrap();
        assert!(channel.shared.push_data(Bytes::from_static(b"hello ")));
        assert!(channel.shared.push_data(Bytes::from_static(b"world")));
        channel.shared.push_eof();
        assert!(!channel.shared.push_data(Bytes::from_static(b"late")));

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn stream_can_only_be_taken_once() {
        let (channel, _rx) = channel_with_queue(1024);
        assert!(channel.stream().is_ok());
        assert!(channel.stream().is_err());
    }

    #[tokio::test]
    async fn close_is_sent_once() {
        let (channel, mut rx) = channel_with_queue(1024);
        channel.close_with_status(0).await.unwrap();
        channel.close_with_status(1).await.unwrap();

        let first = rx.try_recv().unwrap();
        assert!(matches!(
            first,
            Message::ChannelClose(ChannelClosePayload { exit: Some(ChannelExit::Status(0)), .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mark_closed_fails_pending_requests() {
        let (channel, mut rx) = channel_with_queue(1024);
        let requester = channel.clone();
        let pending = tokio::spawn(async move { requester.request("exec", Bytes::new()).await });

        // Wait until the request frame is queued.
        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind(), "channel-request");

        channel.shared.mark_closed(Some(ChannelExit::Status(7)));
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert_eq!(channel.exit(), Some(ChannelExit::Status(7)));
        assert!(channel.is_closed());
    }
}
