//! PTY backed shell forwarder.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use egs_core::constants::{DEFAULT_COLS, DEFAULT_ROWS};
use egs_core::error::Result;
use egs_core::session::{Channel, ChannelStream};
use egs_core::status;

use super::{OUTPUT_DRAIN_TIMEOUT, Forwarder, ForwarderPhase, ForwarderState, cancelled, run_forwarder};
use crate::pty::{Pty, PtyIo, create_pty};

/// Time allowed for buffered terminal output after the child exits.

/// Program and arguments of the interactive shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The platform login shell.
    ///
    /// `$SHELL` (default `/bin/bash`) with `-i` on Unix, hidden PowerShell on Windows.
    pub fn default_shell() -> Self {
        #[cfg(windows)]
        {
            Self::new(
                "powershell.exe",
                vec!["-WindowStyle".to_string(), "Hidden".to_string()],
            )
        }

        #[cfg(not(windows))]
        {
            let program = std::env::var("SHELL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "/bin/bash".to_string());
            Self::new(program, vec!["-i".to_string()])
        }
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::default_shell()
    }
}

/// Runs a shell on a pseudo-terminal.
pub struct PtyForwarder {
    state: ForwarderState,
    size: Mutex<(u32, u32)>,
    pty: Mutex<Option<Arc<dyn Pty>>>,
    shell: ShellCommand,
}

impl PtyForwarder {
    pub fn new(columns: u32, rows: u32) -> Self {
        Self::with_shell(columns, rows, ShellCommand::default_shell())
    }

    pub fn with_shell(columns: u32, rows: u32, shell: ShellCommand) -> Self {
        Self {
            state: ForwarderState::new(),
            size: Mutex::new((columns, rows)),
            pty: Mutex::new(None),
            shell,
        }
    }

    pub fn shell(&self) -> &ShellCommand {
        &self.shell
    }

    /// Last requested terminal size.
    pub fn size(&self) -> (u32, u32) {
        *lock(&self.size)
    }

    /// Record a new terminal size and apply it to the live PTY, if any.
    pub fn resize(&self, columns: u32, rows: u32) -> Result<()> {
        *lock(&self.size) = (columns, rows);
        let pty = lock(&self.pty).clone();
        match pty {
            Some(pty) => pty.resize(columns, rows),
            None => {
                debug!(columns, rows, "Resize stored until the PTY starts");
                Ok(())
            }
        }
    }

    async fn run(&self, stream: ChannelStream, cancel: CancellationToken) -> Result<u32> {
        let pty: Arc<dyn Pty> = Arc::from(create_pty());
        let (columns, rows) = self.size();

        let io = match pty.start(columns, rows, &self.shell.program, &self.shell.args) {
            Ok(io) => io,
            Err(e) => {
                warn!(backend = %pty.backend(), error = %e, "Failed to start PTY");
                pty.dispose();
                return Ok(status::PTY_GENERIC_ERROR);
            }
        };
        info!(backend = %pty.backend(), program = %self.shell.program, columns, rows, "Shell started");

        *lock(&self.pty) = Some(Arc::clone(&pty));
        // Dispose may have run between start and publishing the handle.
        if self.state.is_disposed() {
            pty.dispose();
            return Err(cancelled());
        }

        let PtyIo {
            mut input,
            mut output,
        } = io;
        let (mut reader, mut writer) = stream.into_split();

        let input_pump = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut reader, &mut input).await;
        });
        let mut output_pump = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut output, &mut writer).await;
            let _ = writer.shutdown().await;
            copied
        });

        let exited = pty.wait_for_exit(&cancel).await;
        input_pump.abort();

        let code = match exited {
            Ok(code) => code,
            Err(_) if cancel.is_cancelled() => {
                output_pump.abort();
                return Err(cancelled());
            }
            Err(e) => {
                output_pump.abort();
                return Err(e);
            }
        };

        match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut output_pump).await {
            Ok(Ok(Ok(bytes))) => debug!(bytes, "PTY output drained"),
            Ok(Ok(Err(e))) => debug!(error = %e, "PTY output ended with error"),
            Ok(Err(e)) => debug!(error = %e, "PTY output pump failed"),
            Err(_) => {
                debug!("PTY output still open after exit");
                output_pump.abort();
            }
        }

        info!(code, "Shell exited");
        Ok(code)
    }
}

impl Default for PtyForwarder {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

#[async_trait]
impl Forwarder for PtyForwarder {
    fn kind(&self) -> &'static str {
        "pty"
    }

    async fn start(&self, channel: Channel) -> Result<()> {
        run_forwarder(&self.state, self.kind(), channel, |stream, cancel| {
            self.run(stream, cancel)
        })
        .await
    }

    fn claim(&self) -> bool {
        self.state.claim()
    }

    fn dispose(&self) {
        if !self.state.dispose() {
            return;
        }
        if let Some(pty) = lock(&self.pty).take() {
            pty.dispose();
        }
    }

    fn phase(&self) -> ForwarderPhase {
        self.state.phase()
    }

    fn as_pty(&self) -> Option<&PtyForwarder> {
        Some(self)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use egs_core::protocol::ChannelExit;
    use egs_test_utils::{next_opened, session_pair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn resize_before_start_is_stored() {
        let forwarder = PtyForwarder::new(80, 25);
        forwarder.resize(132, 43).unwrap();
        assert_eq!(forwarder.size(), (132, 43));
        assert_eq!(forwarder.phase(), ForwarderPhase::NotStarted);
    }

    #[cfg(unix)]
    #[test]
    fn default_shell_is_interactive() {
        let shell = ShellCommand::default_shell();
        assert!(!shell.program.is_empty());
        assert_eq!(shell.args, vec!["-i".to_string()]);
    }

    #[test]
    fn dispose_twice_is_harmless() {
        let forwarder = PtyForwarder::default();
        forwarder.dispose();
        forwarder.dispose();
        assert_eq!(forwarder.phase(), ForwarderPhase::Terminal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_exit_code_closes_channel() {
        let mut pair = session_pair().await;
        let client = pair.client.open_channel().await.unwrap();
        let server = next_opened(&mut pair.server_events).await;

        let shell = ShellCommand::new("/bin/sh", vec!["-c".into(), "echo pty-out; exit 5".into()]);
        let forwarder = Arc::new(PtyForwarder::with_shell(100, 30, shell));
        let task = {
            let forwarder = Arc::clone(&forwarder);
            tokio::spawn(async move { forwarder.start(server).await })
        };

        let mut stream = client.stream().unwrap();
        let mut output = Vec::new();
        let _ = stream.read_to_end(&mut output).await;
        client.closed().await;
        task.await.unwrap().unwrap();

        match client.exit() {
            // CI without a pseudo-terminal device.
            Some(ChannelExit::Status(code)) if code == status::PTY_GENERIC_ERROR => {}
            Some(ChannelExit::Status(code)) => {
                assert_eq!(code, 5);
                assert!(String::from_utf8_lossy(&output).contains("pty-out"));
            }
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(forwarder.phase(), ForwarderPhase::Terminal);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_typed_through_channel_sets_exit_code() {
        let mut pair = session_pair().await;
        let client = pair.client.open_channel().await.unwrap();
        let server = next_opened(&mut pair.server_events).await;

        let forwarder = Arc::new(PtyForwarder::with_shell(80, 25, ShellCommand::new("/bin/sh", Vec::new())));
        let task = {
            let forwarder = Arc::clone(&forwarder);
            tokio::spawn(async move { forwarder.start(server).await })
        };

        let (mut reader, mut writer) = client.stream().unwrap().into_split();
        writer.write_all(b"exit 3\n").await.unwrap();
        let mut output = Vec::new();
        let _ = reader.read_to_end(&mut output).await;
        client.closed().await;
        task.await.unwrap().unwrap();

        match client.exit() {
            Some(ChannelExit::Status(code)) if code == status::PTY_GENERIC_ERROR => {}
            Some(ChannelExit::Status(code)) => assert_eq!(code, 3),
            other => panic!("unexpected exit {:?}", other),
        }
    }
}
