//! `list-directory@eryph.io` requests.

use std::sync::Arc;

use tracing::debug;

use egs_core::constants::request_types;
use egs_core::error::{Error, Result};
use egs_core::protocol::{ListDirectoryRequest, RequestMessage};

use super::{Action, ChannelService};
use crate::forwarder::{Forwarder, ListDirectoryForwarder};

pub struct ListDirectoryService;

impl ChannelService for ListDirectoryService {
    fn name(&self) -> &'static str {
        "list-directory"
    }

    fn handles(&self, request_type: &str) -> bool {
        request_type == request_types::LIST_DIRECTORY
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
        let request = ListDirectoryRequest::decode(payload)?;
        debug!(path = %request.path, "Listing requested");
        Ok(Action::Start(Arc::new(ListDirectoryForwarder::new(request))))
    }
}
