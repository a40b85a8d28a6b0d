//! Per-channel forwarders.
//!
//! A forwarder owns one channel's byte stream and pumps it to or from a
//! local resource (process stdio, PTY, file, directory snapshot). Every
//! forwarder follows the same lifecycle:
//!
//! ```text
//! NotStarted --claim--> Starting --start--> Running --(EOF | error | cancel)--> Terminal
//! ```
//!
//! `claim` is optional; a request handler claims a registered forwarder
//! before replying so a second start request can be refused synchronously.
//!
//! `dispose` is valid from any phase and is idempotent.

mod download;
mod list_dir;
mod process;
mod shell;
mod upload;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use egs_core::constants::EXCEPTION_SIGNAL;
use egs_core::error::{Error, Result};
use egs_core::session::{Channel, ChannelStream};

pub use download::DownloadForwarder;
pub use list_dir::ListDirectoryForwarder;
pub use process::{ProcessForwarder, parse_command_line};
pub(crate) use process::exit_code;
pub use shell::{PtyForwarder, ShellCommand};
pub use upload::UploadForwarder;

/// How long output may keep flowing after the child exited. Background
/// processes can hold the output open indefinitely.
pub(crate) const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Lifecycle
// =============================================================================

/// Lifecycle phase of a forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderPhase {
    NotStarted,
    Starting,
    Running,
    Terminal,
}

const NOT_STARTED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const TERMINAL: u8 = 3;

/// Single-start guard plus the forwarder's own cancellation source.
#[derive(Debug)]
pub struct ForwarderState {
    phase: AtomicU8,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl Default for ForwarderState {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwarderState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(NOT_STARTED),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Reserve the single start: `NotStarted -> Starting`.
    ///
    /// Returns false if the forwarder was already claimed, started or
    /// disposed.
    pub fn claim(&self) -> bool {
        self.phase
            .compare_exchange(NOT_STARTED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move `NotStarted | Starting -> Running`. Any other phase fails.
    pub fn begin(&self) -> Result<()> {
        self.phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| match phase {
                NOT_STARTED | STARTING => Some(RUNNING),
                _ => None,
            })
            .map(|_| ())
            .map_err(|_| Error::AlreadyStarted)
    }

    pub fn finish(&self) {
        self.phase.store(TERMINAL, Ordering::Release);
    }

    pub fn phase(&self) -> ForwarderPhase {
        match self.phase.load(Ordering::Acquire) {
            NOT_STARTED => ForwarderPhase::NotStarted,
            STARTING => ForwarderPhase::Starting,
            RUNNING => ForwarderPhase::Running,
            _ => ForwarderPhase::Terminal,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the pumps. Returns true only for the first call.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        // A forwarder disposed before it ran can never start.
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |phase| match phase {
                NOT_STARTED | STARTING => Some(TERMINAL),
                _ => None,
            });
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

// =============================================================================
// Forwarder trait
// =============================================================================

/// A worker bound to exactly one channel.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Short name for logging.
    fn kind(&self) -> &'static str;

    /// Run the forwarder to completion against `channel`.
    ///
    /// Returns `Error::AlreadyStarted` on a second call. Every other failure
    /// is reported to the peer through the channel close.
    async fn start(&self, channel: Channel) -> Result<()>;

    /// Reserve the start ahead of [`Forwarder::start`]. False if it is taken.
    fn claim(&self) -> bool;

    /// Stop the pumps and release owned resources. Safe to call repeatedly.
    fn dispose(&self);

    fn phase(&self) -> ForwarderPhase;

    /// Downcast for the PTY follow-up requests.
    fn as_pty(&self) -> Option<&PtyForwarder> {
        None
    }
}

/// Drive one forwarder body and translate its outcome into the channel close.
///
/// `Ok(status)` closes with that status, a cancelled run closes without an
/// exit, and any other error closes with the exception signal.
pub(crate) async fn run_forwarder<F, Fut>(
    state: &ForwarderState,
    kind: &'static str,
    channel: Channel,
    body: F,
) -> Result<()>
where
    F: FnOnce(ChannelStream, CancellationToken) -> Fut,
    Fut: Future<Output = Result<u32>>,
{
    state.begin()?;
    let cancel = state.cancel_token();
    let channel_id = channel.id();

    let outcome = match channel.stream() {
        Ok(stream) => body(stream, cancel.clone()).await,
        Err(e) => Err(e),
    };

    let closed = match outcome {
        Ok(status) => {
            debug!(channel_id = %channel_id, kind, status, "Forwarder finished");
            channel.close_with_status(status).await
        }
        Err(e) if cancel.is_cancelled() => {
            debug!(channel_id = %channel_id, kind, error = %e, "Forwarder cancelled");
            channel.close(None).await
        }
        Err(e) => {
            warn!(channel_id = %channel_id, kind, error = %e, "Forwarder failed");
            channel.close_with_signal(EXCEPTION_SIGNAL, e.to_string()).await
        }
    };

    state.finish();
    closed
}

/// Error returned by pumps that stop because of cancellation.
pub(crate) fn cancelled() -> Error {
    Error::Channel {
        message: "forwarder cancelled".to_string(),
    }
}
