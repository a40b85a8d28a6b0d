//! `subsystem` requests. Only PowerShell remoting is offered.

use std::sync::Arc;

use tracing::info;

use egs_core::constants::{POWERSHELL_SUBSYSTEM, request_types};
use egs_core::error::{Error, Result};
use egs_core::protocol::{RequestMessage, SubsystemRequest};

use super::{Action, ChannelService};
use crate::forwarder::{Forwarder, ProcessForwarder};

/// PowerShell in SSH server mode.
pub fn powershell_command() -> (String, Vec<String>) {
    let program = if cfg!(windows) {
        "pwsh.exe"
    } else {
        "/usr/bin/pwsh"
    };
    (
        program.to_string(),
        vec!["-sshs".to_string(), "-NoLogo".to_string()],
    )
}

pub struct SubsystemService;

impl ChannelService for SubsystemService {
    fn name(&self) -> &'static str {
        "subsystem"
    }

    fn handles(&self, request_type: &str) -> bool {
        request_type == request_types::SUBSYSTEM
    }

    fn handle(
        &self,
        _request_type: &str,
        payload: &[u8],
        existing: Option<&Arc<dyn Forwarder>>,
    ) -> Result<Action> {
        let request = SubsystemRequest::decode(payload)?;
        if existing.is_some() || request.name != POWERSHELL_SUBSYSTEM {
            return Err(Error::ChannelRejected {
                request_type: format!("{} {}", request_types::SUBSYSTEM, request.name),
            });
        }
        let (program, args) = powershell_command();
        info!(subsystem = %request.name, program, "Subsystem requested");
        Ok(Action::Start(Arc::new(ProcessForwarder::new(program, args))))
    }
}
