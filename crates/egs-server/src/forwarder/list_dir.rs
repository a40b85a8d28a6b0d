//! Directory listing.

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use egs_core::error::Result;
use egs_core::protocol::{ListDirectoryRequest, RemoteFileInfo, encode_listing};
use egs_core::session::Channel;
use egs_core::status;

use super::{Forwarder, ForwarderPhase, ForwarderState, run_forwarder};

/// Sends one JSON snapshot of a directory's immediate children.
pub struct ListDirectoryForwarder {
    request: ListDirectoryRequest,
    state: ForwarderState,
}

impl ListDirectoryForwarder {
    pub fn new(request: ListDirectoryRequest) -> Self {
        Self {
            request,
            state: ForwarderState::new(),
        }
    }
}

#[async_trait]
impl Forwarder for ListDirectoryForwarder {
    fn kind(&self) -> &'static str {
        "list-directory"
    }

    async fn start(&self, channel: Channel) -> Result<()> {
        let path = Path::new(&self.request.path);
        run_forwarder(&self.state, self.kind(), channel, |mut stream, cancel| async move {
            let Some(entries) = read_listing(path).await? else {
                return Ok(status::FILE_NOT_FOUND);
            };
            if cancel.is_cancelled() {
                return Err(super::cancelled());
            }
            stream.write_all(&encode_listing(&entries)?).await?;
            stream.flush().await?;
            stream.shutdown().await?;
            Ok(status::SUCCESS)
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

/// Immediate children of `path`, or `None` when it is not a directory.
///
/// Children that cannot be inspected for lack of permission are skipped.
pub(crate) async fn read_listing(path: &Path) -> Result<Option<Vec<RemoteFileInfo>>> {
    match fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            info!(path = %path.display(), "Listing target is not a directory");
            return Ok(None);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "Listing target not found");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let mut entries = Vec::new();
    let mut dir = fs::read_dir(path).await?;
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let child = entry.path();
        match fs::metadata(&child).await {
            Ok(metadata) => entries.push(RemoteFileInfo::from_metadata(&child, &metadata)),
            Err(e) if e.kind() == ErrorKind::PermissionDenied || e.kind() == ErrorKind::NotFound => {
                // Access denied, or a dangling link / entry removed mid-listing.
                debug!(path = %child.display(), error = %e, "Skipping entry");
            }
            Err(e) => return Err(e.into()),
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Some(entries))
}
