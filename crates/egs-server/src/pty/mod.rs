//! Pseudo-terminal provider.
//!
//! One [`Pty`] interface with three backends:
//! - `Native`: openpty + fork on Unix
//! - `ConPty`: the Windows pseudo-console API (build 17763 and later)
//! - `Fallback`: an external `ssh-shellhost.exe ---pty` helper
//!
//! [`create_pty`] picks the backend once per PTY; callers only see the trait.

mod fallback;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use egs_core::error::Result;

pub use fallback::FallbackPty;
#[cfg(unix)]
pub use unix::NativePty;
#[cfg(windows)]
pub use windows::ConPty;

/// Byte streams of a started PTY.
pub struct PtyIo {
    /// Terminal input (keystrokes to the child).
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Terminal output (what the child prints).
    pub output: Box<dyn AsyncRead + Send + Unpin>,
}

impl fmt::Debug for PtyIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyIo").finish_non_exhaustive()
    }
}

/// A child process attached to a pseudo-terminal.
///
/// Lifecycle: created -> started -> exited. `dispose` kills the child if it
/// is still running and releases every platform handle.
#[async_trait]
pub trait Pty: Send + Sync {
    fn backend(&self) -> PtyBackend;

    /// Spawn `command` attached to a new terminal of the given size.
    fn start(&self, columns: u32, rows: u32, command: &str, args: &[String]) -> Result<PtyIo>;

    /// Change the terminal size of a started PTY.
    fn resize(&self, columns: u32, rows: u32) -> Result<()>;

    /// Wait until the child exits and return its exit code.
    async fn wait_for_exit(&self, cancel: &CancellationToken) -> Result<u32>;

    fn dispose(&self);
}

/// Available PTY implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyBackend {
    Native,
    ConPty,
    Fallback,
}

impl fmt::Display for PtyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PtyBackend::Native => "native",
            PtyBackend::ConPty => "conpty",
            PtyBackend::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

/// First Windows build with the pseudo-console API (1809).
pub const CONPTY_MIN_BUILD: u32 = 17763;

/// Backend for the current host.
pub fn select_backend() -> PtyBackend {
    #[cfg(unix)]
    {
        PtyBackend::Native
    }

    #[cfg(windows)]
    {
        backend_for_windows_build(windows::os_build_number())
    }

    #[cfg(not(any(unix, windows)))]
    {
        PtyBackend::Fallback
    }
}

/// Windows backend choice for a given OS build number.
pub fn backend_for_windows_build(build: u32) -> PtyBackend {
    if build >= CONPTY_MIN_BUILD {
        PtyBackend::ConPty
    } else {
        PtyBackend::Fallback
    }
}

/// Create a PTY using the backend selected for this host.
pub fn create_pty() -> Box<dyn Pty> {
    match select_backend() {
        #[cfg(unix)]
        PtyBackend::Native => Box::new(NativePty::new()),
        #[cfg(windows)]
        PtyBackend::ConPty => Box::new(ConPty::new()),
        _ => Box::new(FallbackPty::new()),
    }
}

/// Clamp a 32-bit dimension to what terminal size structs can carry.
pub(crate) fn clamp_dimension(value: u32) -> u16 {
    value.clamp(1, u16::MAX as u32) as u16
}
