//! Process forwarder for exec, subsystem and PTY-less shell requests.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use egs_core::constants::MAX_PACKET_SIZE;
use egs_core::error::{Error, Result};
use egs_core::session::{Channel, ChannelStream, ChannelWriter};

use super::{OUTPUT_DRAIN_TIMEOUT, Forwarder, ForwarderPhase, ForwarderState, cancelled, run_forwarder};

/// Split a command line at the first space into program and arguments.
///
/// The argument string is split on whitespace; no quoting is interpreted.
pub fn parse_command_line(line: &str) -> Result<(String, Vec<String>)> {
    let line = line.trim();
    if line.is_empty() {
        return Err(Error::Channel {
            message: "empty command line".to_string(),
        });
    }
    match line.split_once(' ') {
        Some((program, rest)) => Ok((
            program.to_string(),
            rest.split_whitespace().map(str::to_string).collect(),
        )),
        None => Ok((line.to_string(), Vec::new())),
    }
}

/// Runs a child process and pumps its stdio through the channel.
pub struct ProcessForwarder {
    program: String,
    args: Vec<String>,
    state: ForwarderState,
}

impl ProcessForwarder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            state: ForwarderState::new(),
        }
    }

    /// Build from a command line like `ls -la /tmp`.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let (program, args) = parse_command_line(line)?;
        Ok(Self::new(program, args))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Forwarder for ProcessForwarder {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn start(&self, channel: Channel) -> Result<()> {
        run_forwarder(&self.state, self.kind(), channel, |stream, cancel| {
            run_process(&self.program, &self.args, stream, cancel)
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

async fn run_process(
    program: &str,
    args: &[String],
    stream: ChannelStream,
    cancel: CancellationToken,
) -> Result<u32> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Channel {
            message: format!("failed to start {}: {}", program, e),
        })?;
    info!(program, pid = ?child.id(), "Process started");

    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let mut stdin = child.stdin.take();
    let input = tokio::spawn(async move {
        if let Some(stdin) = stdin.as_mut() {
            let _ = tokio::io::copy(&mut reader, stdin).await;
            let _ = stdin.shutdown().await;
        }
        // Dropping stdin delivers EOF to the child.
        drop(stdin);
    });

    let stdout = child.stdout.take().map(|out| tokio::spawn(pump_output(out, Arc::clone(&writer))));
    let stderr = child.stderr.take().map(|err| tokio::spawn(pump_output(err, Arc::clone(&writer))));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            // kill_on_drop terminates the child on return.
            input.abort();
            return Err(cancelled());
        }
    };
    input.abort();

    // The close must follow every byte the child wrote, unless a leftover
    // background process keeps the pipes open.
    let mut pumps: Vec<_> = [stdout, stderr].into_iter().flatten().collect();
    let drain = async {
        for pump in pumps.iter_mut() {
            let _ = pump.await;
        }
    };
    let drained = tokio::select! {
        drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain) => Some(drained.is_ok()),
        _ = cancel.cancelled() => None,
    };
    match drained {
        Some(true) => {}
        Some(false) => debug!(program, "Output still open after exit"),
        None => {
            pumps.iter().for_each(|pump| pump.abort());
            return Err(cancelled());
        }
    }
    pumps.iter().for_each(|pump| pump.abort());
    writer.lock().await.shutdown().await?;

    let status = status?;
    let code = exit_code(status);
    debug!(program, code, "Process exited");
    Ok(code)
}

async fn pump_output<R>(mut source: R, sink: Arc<Mutex<ChannelWriter>>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.lock().await.write_all(&buf[..n]).await?;
    }
}

/// Exit status as the unsigned value carried by the channel close.
///
/// Unix processes killed by a signal report `128 + signal` like a shell.
pub(crate) fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    u32::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_splits_at_first_space() {
        let (program, args) = parse_command_line("ls  -la   /tmp").unwrap();
        assert_eq!(program, "ls");
        assert_eq!(args, vec!["-la", "/tmp"]);

        let (program, args) = parse_command_line("  whoami ").unwrap();
        assert_eq!(program, "whoami");
        assert!(args.is_empty());

        assert!(parse_command_line("   ").is_err());
    }

    proptest::proptest! {
        #[test]
        fn command_line_keeps_every_word(words in proptest::collection::vec("[a-z0-9/._-]{1,12}", 1..8)) {
            let (program, args) = parse_command_line(&words.join("  ")).unwrap();
            proptest::prop_assert_eq!(&program, &words[0]);
            proptest::prop_assert_eq!(args, words[1..].to_vec());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_of_signalled_process() {
        let status = Command::new("/bin/sh")
            .args(["-c", "kill -9 $$"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code(status), 128 + 9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_passthrough() {
        let status = Command::new("/bin/sh")
            .args(["-c", "exit 42"])
            .status()
            .await
            .unwrap();
        assert_eq!(exit_code(status), 42);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_child_does_not_hold_the_channel_open() {
        use egs_core::protocol::ChannelExit;
        use egs_test_utils::{next_opened, session_pair};

        let mut pair = session_pair().await;
        let client = pair.client.open_channel().await.unwrap();
        let server = next_opened(&mut pair.server_events).await;

        let forwarder = ProcessForwarder::new(
            "/bin/sh",
            vec!["-c".into(), "sleep 20 & echo started; exit 4".into()],
        );
        let task = tokio::spawn(async move { forwarder.start(server).await });

        let mut output = Vec::new();
        let mut stream = client.stream().unwrap();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let _ = stream.read_to_end(&mut output).await;
            client.closed().await;
        })
        .await;
        assert!(closed.is_ok(), "channel still open after the shell exited");
        task.await.unwrap().unwrap();

        assert_eq!(client.exit(), Some(ChannelExit::Status(4)));
        assert!(String::from_utf8_lossy(&output).contains("started"));
    }
}
