//! Upload and download requests.

use std::sync::Arc;

use tracing::info;

use egs_core::constants::request_types;
use egs_core::error::{Error, Result};
use egs_core::protocol::{DownloadFileRequest, RequestMessage, UploadFileRequest};

use super::{Action, ChannelService};
use crate::forwarder::{DownloadForwarder, Forwarder, UploadForwarder};

/// Selects the pump direction from the request type.
pub struct FileTransferService;

impl ChannelService for FileTransferService {
    fn name(&self) -> &'static str {
        "file-transfer"
    }

    fn handles(&self, request_type: &str) -> bool {
        request_type == request_types::UPLOAD_FILE || request_type == request_types::DOWNLOAD_FILE
    }

    fn handle(
        &self,
        request_type: &str,
        payload: &[u8],
        existing: Option<&Arc<dyn Forwarder>>,
    ) -> Result<Action> {
        if existing.is_some() {
            return Err(Error::ChannelRejected {
                request_type: request_type.to_string(),
            });
        }

        let forwarder: Arc<dyn Forwarder> = if request_type == request_types::UPLOAD_FILE {
            let request = UploadFileRequest::decode(payload)?;
            info!(
                target = %request.target_path().display(),
                length = request.length,
                overwrite = request.overwrite,
                "Upload requested"
            );
            Arc::new(UploadForwarder::new(request))
        } else {
            let request = DownloadFileRequest::decode(payload)?;
            info!(source = %request.source_path().display(), "Download requested");
            Arc::new(DownloadForwarder::new(request))
        };
        Ok(Action::Start(forwarder))
    }
}
