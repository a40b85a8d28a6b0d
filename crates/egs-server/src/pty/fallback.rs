//! PTY through an external helper binary.
//!
//! Used on Windows builds without the pseudo-console API. The helper
//! (`ssh-shellhost.exe ---pty <command>`) allocates the terminal itself and
//! talks over plain pipes, so the terminal size cannot be changed: resize
//! is accepted and ignored.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use egs_core::error::{Error, Result};

use super::{Pty, PtyBackend, PtyIo};

/// Name of the helper shipped with OpenSSH for Windows.
pub const SHELL_HOST: &str = "ssh-shellhost.exe";

enum State {
    Created,
    Running(Child),
    Exited(u32),
    Disposed,
}

/// Helper-process PTY; see the module docs.
pub struct FallbackPty {
    helper: PathBuf,
    state: Mutex<State>,
    // Held across the wait so dispose can interrupt it.
    disposed: CancellationToken,
}

impl Default for FallbackPty {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackPty {
    pub fn new() -> Self {
        Self::with_helper(SHELL_HOST)
    }

    pub fn with_helper(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            state: Mutex::new(State::Created),
            disposed: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Pty for FallbackPty {
    fn backend(&self) -> PtyBackend {
        PtyBackend::Fallback
    }

    fn start(&self, columns: u32, rows: u32, command: &str, args: &[String]) -> Result<PtyIo> {
        let mut state = self.lock();
        match *state {
            State::Created => {}
            State::Disposed => {
                return Err(Error::Pty {
                    message: "pty already disposed".to_string(),
                });
            }
            _ => return Err(Error::AlreadyStarted),
        }

        let mut child = Command::new(&self.helper)
            .arg("---pty")
            .arg(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Pty {
                message: format!("failed to start {}: {}", self.helper.display(), e),
            })?;

        let (Some(input), Some(output)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Pty {
                message: "helper stdio not captured".to_string(),
            });
        };

        info!(helper = %self.helper.display(), command, columns, rows, "Fallback PTY started");
        *state = State::Running(child);
        Ok(PtyIo {
            input: Box::new(input),
            output: Box::new(output),
        })
    }

    fn resize(&self, columns: u32, rows: u32) -> Result<()> {
        debug!(columns, rows, "Fallback PTY cannot resize; ignoring");
        Ok(())
    }

    async fn wait_for_exit(&self, cancel: &CancellationToken) -> Result<u32> {
        loop {
            let polled = {
                let mut state = self.lock();
                match &mut *state {
                    State::Created => {
                        return Err(Error::Pty {
                            message: "pty not started".to_string(),
                        });
                    }
                    State::Disposed => {
                        return Err(Error::Pty {
                            message: "pty disposed".to_string(),
                        });
                    }
                    State::Exited(code) => return Ok(*code),
                    State::Running(child) => child.try_wait()?,
                }
            };

            if let Some(status) = polled {
                let code = crate::forwarder::exit_code(status);
                *self.lock() = State::Exited(code);
                return Ok(code);
            }

            tokio::select! {
                _ = tokio::time::sleep(egs_core::constants::CHILD_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Pty {
                        message: "wait for exit cancelled".to_string(),
                    });
                }
                _ = self.disposed.cancelled() => {
                    return Err(Error::Pty {
                        message: "pty disposed".to_string(),
                    });
                }
            }
        }
    }

    fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.lock(), State::Disposed);
        self.disposed.cancel();
        if let State::Running(mut child) = previous {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Fallback PTY helper already gone");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_helper_fails_to_start() {
        let pty = FallbackPty::with_helper("/nonexistent/egs-shellhost");
        let result = pty.start(80, 25, "powershell.exe", &[]);
        assert!(matches!(result, Err(Error::Pty { .. })));
    }

    #[test]
    fn resize_is_accepted() {
        let pty = FallbackPty::new();
        pty.resize(100, 50).unwrap();
        assert_eq!(pty.backend(), PtyBackend::Fallback);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let pty = FallbackPty::new();
        pty.dispose();
        pty.dispose();
        assert!(pty.start(80, 25, "cmd", &[]).is_err());
        assert!(pty.wait_for_exit(&CancellationToken::new()).await.is_err());
    }
}
