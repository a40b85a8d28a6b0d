//! Guest-to-host file download.

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use egs_core::constants::FILE_BUFFER_SIZE;
use egs_core::error::Result;
use egs_core::protocol::DownloadFileRequest;
use egs_core::session::Channel;
use egs_core::status;

use super::{Forwarder, ForwarderPhase, ForwarderState, cancelled, run_forwarder};

/// Streams a guest file into the channel.
pub struct DownloadForwarder {
    request: DownloadFileRequest,
    state: ForwarderState,
}

impl DownloadForwarder {
    pub fn new(request: DownloadFileRequest) -> Self {
        Self {
            request,
            state: ForwarderState::new(),
        }
    }
}

#[async_trait]
impl Forwarder for DownloadForwarder {
    fn kind(&self) -> &'static str {
        "download"
    }

    async fn start(&self, channel: Channel) -> Result<()> {
        let request = &self.request;
        run_forwarder(&self.state, self.kind(), channel, |mut stream, cancel| async move {
            let code = send_file(request, &mut stream, &cancel).await?;
            stream.shutdown().await?;
            Ok(code)
        })
        .await
    }

    fn claim(&self) -> bool {
        self.state.claim()
    }

    fn dispose(&self) {
        self.state.dispose();
    }

    fn phase(&self) -> ForwarderPhase {
        self.state.phase()
    }
}

async fn send_file<W>(request: &DownloadFileRequest, sink: &mut W, cancel: &CancellationToken) -> Result<u32>
where
    W: AsyncWrite + Unpin,
{
    let source = request.source_path();
    let is_file = match fs::metadata(&source).await {
        Ok(metadata) => metadata.is_file(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e.into()),
    };
    if !is_file {
        info!(path = %source.display(), "Download source not found");
        return Ok(status::FILE_NOT_FOUND);
    }

    let mut file = File::open(&source).await?;
    let sent = copy_to_end(&mut file, sink, cancel).await?;
    sink.flush().await?;
    debug!(path = %source.display(), bytes = sent, "Download complete");
    Ok(status::SUCCESS)
}

async fn copy_to_end<R, W>(source: &mut R, sink: &mut W, cancel: &CancellationToken) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; FILE_BUFFER_SIZE];
    let mut sent = 0u64;
    loop {
        let n = tokio::select! {
            n = source.read(&mut buf) => n?,
            _ = cancel.cancelled() => return Err(cancelled()),
        };
        if n == 0 {
            return Ok(sent);
        }
        tokio::select! {
            written = sink.write_all(&buf[..n]) => written?,
            _ = cancel.cancelled() => return Err(cancelled()),
        }
        sent += n as u64;
    }
}
