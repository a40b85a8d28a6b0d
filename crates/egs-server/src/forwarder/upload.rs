//! Host-to-guest file upload.

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use egs_core::constants::FILE_BUFFER_SIZE;
use egs_core::error::Result;
use egs_core::protocol::UploadFileRequest;
use egs_core::session::Channel;
use egs_core::status;

use super::{Forwarder, ForwarderPhase, ForwarderState, cancelled, run_forwarder};

/// Writes the channel's bytes into a guest file.
pub struct UploadForwarder {
    request: UploadFileRequest,
    state: ForwarderState,
}

impl UploadForwarder {
    pub fn new(request: UploadFileRequest) -> Self {
        Self {
            request,
            state: ForwarderState::new(),
        }
    }
}

#[async_trait]
impl Forwarder for UploadForwarder {
    fn kind(&self) -> &'static str {
        "upload"
    }

    async fn start(&self, channel: Channel) -> Result<()> {
        let request = &self.request;
        run_forwarder(&self.state, self.kind(), channel, |mut stream, cancel| async move {
            receive_file(request, &mut stream, &cancel).await
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

async fn receive_file<R>(request: &UploadFileRequest, source: &mut R, cancel: &CancellationToken) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let target = request.target_path();

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true);
    if request.overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }

    let mut file = match options.open(&target).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            info!(path = %target.display(), "Upload target exists, not overwriting");
            return Ok(status::FILE_EXISTS);
        }
        Err(e) => return Err(e.into()),
    };

    match copy_bounded(source, &mut file, request.length, cancel).await {
        Ok(received) => {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            if received < request.length {
                warn!(
                    path = %target.display(),
                    expected = request.length,
                    received,
                    "Upload ended early"
                );
            } else {
                debug!(path = %target.display(), bytes = received, "Upload complete");
            }
            Ok(status::SUCCESS)
        }
        Err(e) => {
            drop(file);
            remove_partial(&target).await;
            Err(e)
        }
    }
}

/// Copy up to `length` bytes, stopping early when the source reaches EOF.
async fn copy_bounded<R>(
    source: &mut R,
    file: &mut File,
    length: u64,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; FILE_BUFFER_SIZE];
    let mut received = 0u64;

    while received < length {
        let want = (length - received).min(buf.len() as u64) as usize;
        let n = tokio::select! {
            n = source.read(&mut buf[..want]) => n?,
            _ = cancel.cancelled() => return Err(cancelled()),
        };
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }

    Ok(received)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "Failed to remove partial upload");
    }
}
