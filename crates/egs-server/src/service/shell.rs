//! `pty-req`, `shell` and `window-change` requests.
//!
//! A `pty-req` registers a PTY forwarder without starting it; `shell`
//! starts it. Without a prior `pty-req`, `shell` runs the login shell on
//! plain pipes.

use std::sync::Arc;

use tracing::{debug, info};

use egs_core::constants::request_types;
use egs_core::error::{Error, Result};
use egs_core::protocol::{PtyRequest, RequestMessage, ShellRequest, WindowChangeRequest};

use super::{Action, ChannelService};
use crate::forwarder::{Forwarder, ProcessForwarder, PtyForwarder, ShellCommand};

pub struct ShellService;

fn rejected(request_type: &str) -> Error {
    Error::ChannelRejected {
        request_type: request_type.to_string(),
    }
}

impl ChannelService for ShellService {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn handles(&self, request_type: &str) -> bool {
        matches!(
            request_type,
            request_types::PTY | request_types::SHELL | request_types::WINDOW_CHANGE
        )
    }

    fn handle(
        &self,
        request_type: &str,
        payload: &[u8],
        existing: Option<&Arc<dyn Forwarder>>,
    ) -> Result<Action> {
        match request_type {
            request_types::PTY => {
                let request = PtyRequest::decode(payload)?;
                if existing.is_some() {
                    return Err(rejected(request_type));
                }
                info!(term = %request.term, columns = request.columns, rows = request.rows, "PTY requested");
                Ok(Action::Register(Arc::new(PtyForwarder::new(
                    request.columns,
                    request.rows,
                ))))
            }
            request_types::SHELL => {
                ShellRequest::decode(payload)?;
                match existing {
                    Some(fwd) if fwd.as_pty().is_some() => Ok(Action::StartExisting),
                    Some(_) => Err(rejected(request_type)),
                    None => {
                        let shell = ShellCommand::default_shell();
                        debug!(program = %shell.program, "Shell without PTY");
                        Ok(Action::Start(Arc::new(ProcessForwarder::new(
                            shell.program,
                            shell.args,
                        ))))
                    }
                }
            }
            request_types::WINDOW_CHANGE => {
                let request = WindowChangeRequest::decode(payload)?;
                let pty = existing
                    .and_then(|fwd| fwd.as_pty())
                    .ok_or_else(|| rejected(request_type))?;
                pty.resize(request.columns, request.rows)?;
                Ok(Action::Accept)
            }
            other => Err(rejected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pty_payload(columns: u32, rows: u32) -> bytes::Bytes {
        PtyRequest {
            columns,
            rows,
            ..Default::default()
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn pty_req_registers_sized_forwarder() {
        let action = ShellService
            .handle(request_types::PTY, &pty_payload(120, 40), None)
            .unwrap();
        let Action::Register(fwd) = action else {
            panic!("expected register");
        };
        assert_eq!(fwd.as_pty().unwrap().size(), (120, 40));
    }

    #[test]
    fn shell_after_pty_starts_existing() {
        let existing: Arc<dyn Forwarder> = Arc::new(PtyForwarder::new(80, 25));
        let payload = ShellRequest.encode().unwrap();
        let action = ShellService
            .handle(request_types::SHELL, &payload, Some(&existing))
            .unwrap();
        assert!(matches!(action, Action::StartExisting));
    }

    #[test]
    fn shell_without_pty_uses_pipes() {
        let payload = ShellRequest.encode().unwrap();
        let action = ShellService.handle(request_types::SHELL, &payload, None).unwrap();
        match action {
            Action::Start(fwd) => assert_eq!(fwd.kind(), "process"),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn window_change_resizes_registered_pty() {
        let existing: Arc<dyn Forwarder> = Arc::new(PtyForwarder::new(80, 25));
        let payload = WindowChangeRequest {
            columns: 200,
            rows: 50,
            width_pixels: 0,
            height_pixels: 0,
        }
        .encode()
        .unwrap();
        let action = ShellService
            .handle(request_types::WINDOW_CHANGE, &payload, Some(&existing))
            .unwrap();
        assert!(matches!(action, Action::Accept));
        assert_eq!(existing.as_pty().unwrap().size(), (200, 50));

        assert!(
            ShellService
                .handle(request_types::WINDOW_CHANGE, &payload, None)
                .is_err()
        );
    }

    #[test]
    fn second_pty_req_is_rejected() {
        let existing: Arc<dyn Forwarder> = Arc::new(PtyForwarder::new(80, 25));
        assert!(
            ShellService
                .handle(request_types::PTY, &pty_payload(80, 25), Some(&existing))
                .is_err()
        );
    }
}
