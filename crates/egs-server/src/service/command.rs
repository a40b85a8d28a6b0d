//! `exec` requests.

use std::sync::Arc;

use tracing::info;

use egs_core::constants::request_types;
use egs_core::error::{Error, Result};
use egs_core::protocol::{ExecRequest, RequestMessage};

use super::{Action, ChannelService};
use crate::forwarder::{Forwarder, ProcessForwarder};

/// Runs a command line through a process forwarder.
pub struct CommandService;

impl ChannelService for CommandService {
    fn name(&self) -> &'static str {
        "command"
    }

    fn handles(&self, request_type: &str) -> bool {
        request_type == request_types::EXEC
    }

    fn handle(
        &self,
        _request_type: &str,
        payload: &[u8],
        existing: Option<&Arc<dyn Forwarder>>,
    ) -> Result<Action> {
        if existing.is_some() {
            return Err(Error::ChannelRejected {
                request_type: request_types::EXEC.to_string(),
            });
        }
        let request = ExecRequest::decode(payload)?;
        let forwarder = ProcessForwarder::from_command_line(&request.command)?;
        info!(program = forwarder.program(), "Exec requested");
        Ok(Action::Start(Arc::new(forwarder)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_builds_process_forwarder() {
        let payload = ExecRequest {
            command: "echo hi".into(),
        }
        .encode()
        .unwrap();
        let action = CommandService.handle(request_types::EXEC, &payload, None).unwrap();
        match action {
            Action::Start(fwd) => assert_eq!(fwd.kind(), "process"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        let payload = ExecRequest {
            command: "  ".into(),
        }
        .encode()
        .unwrap();
        assert!(CommandService.handle(request_types::EXEC, &payload, None).is_err());
    }

    #[test]
    fn garbled_payload_is_rejected() {
        assert!(CommandService.handle(request_types::EXEC, &[0, 0], None).is_err());
    }
}
