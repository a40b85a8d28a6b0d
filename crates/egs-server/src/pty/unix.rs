//! Native Unix PTY backend.
//!
//! Uses openpty + fork so the child gets the slave as its controlling
//! terminal. The child was not spawned through `std::process`, so it is
//! reaped with a non-blocking `waitpid` loop.

use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::raw::c_char;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::signal::{Signal, kill};
use nix::sys::termios::Termios;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, close, dup2, fork, setsid};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use egs_core::constants::{CHILD_POLL_INTERVAL, DEFAULT_TERM};
use egs_core::error::{Error, Result};

use super::{Pty, PtyBackend, PtyIo, clamp_dimension};

#[derive(Default)]
struct State {
    pid: Option<Pid>,
    master: Option<Arc<AsyncFd<OwnedFd>>>,
    exit: Option<u32>,
    disposed: bool,
}

/// openpty/fork based PTY.
#[derive(Default)]
pub struct NativePty {
    state: Mutex<State>,
}

impl NativePty {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_exit(&self, code: u32) -> u32 {
        let mut state = self.lock();
        *state.exit.get_or_insert(code)
    }
}

fn winsize(columns: u32, rows: u32) -> Winsize {
    Winsize {
        ws_row: clamp_dimension(rows),
        ws_col: clamp_dimension(columns),
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Line discipline for an interactive login-like terminal.
fn default_termios() -> Termios {
    // SAFETY: termios is plain old data; all-zero is a valid starting point.
    let mut t: libc::termios = unsafe { std::mem::zeroed() };
    t.c_iflag = libc::ICRNL | libc::IXON | libc::IXANY | libc::IMAXBEL | libc::BRKINT | libc::IUTF8;
    t.c_oflag = libc::OPOST | libc::ONLCR;
    t.c_cflag = libc::CS8 | libc::CREAD | libc::HUPCL;
    t.c_lflag = libc::ECHOKE
        | libc::ECHOE
        | libc::ECHOK
        | libc::ECHO
        | libc::ECHOCTL
        | libc::ISIG
        | libc::ICANON
        | libc::IEXTEN;

    t.c_cc[libc::VINTR] = 3;
    t.c_cc[libc::VQUIT] = 0x1c;
    t.c_cc[libc::VERASE] = 0x7f;
    t.c_cc[libc::VKILL] = 21;
    t.c_cc[libc::VEOF] = 4;
    t.c_cc[libc::VEOL] = 255;
    t.c_cc[libc::VEOL2] = 255;
    t.c_cc[libc::VSTART] = 17;
    t.c_cc[libc::VSTOP] = 19;
    t.c_cc[libc::VSUSP] = 26;
    t.c_cc[libc::VREPRINT] = 18;
    t.c_cc[libc::VWERASE] = 23;
    t.c_cc[libc::VLNEXT] = 22;
    t.c_cc[libc::VDISCARD] = 15;
    t.c_cc[libc::VMIN] = 1;
    t.c_cc[libc::VTIME] = 0;

    // SAFETY: `t` is a valid termios.
    unsafe {
        libc::cfsetispeed(&mut t, libc::B38400);
        libc::cfsetospeed(&mut t, libc::B38400);
    }
    Termios::from(t)
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(|e| Error::Pty {
        message: format!("fcntl F_GETFL failed: {}", e),
    })?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(|e| Error::Pty {
        message: format!("fcntl F_SETFL failed: {}", e),
    })?;
    Ok(())
}

fn cstring(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|e| Error::Pty {
        message: format!("invalid {}: {}", what, e),
    })
}

/// Locate `command` on `PATH` unless it already names a path.
fn resolve_program(command: &str) -> Result<CString> {
    if command.contains('/') {
        return cstring(command, "command");
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| Error::Pty {
            message: format!("{} not found on PATH", command),
        })
        .and_then(|found| cstring(&found.to_string_lossy(), "command"))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Environment of the parent, with `TERM` defaulted when unset.
fn child_environment() -> Result<Vec<CString>> {
    let mut has_term = false;
    let mut envp = Vec::new();
    for (key, value) in std::env::vars_os() {
        has_term |= key.as_bytes() == b"TERM";
        let mut entry = key.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        // Entries with interior NULs cannot be passed to exec.
        if let Ok(entry) = CString::new(entry) {
            envp.push(entry);
        }
    }
    if !has_term {
        envp.push(cstring(&format!("TERM={}", DEFAULT_TERM), "environment entry")?);
    }
    Ok(envp)
}

fn null_terminated(values: &[CString]) -> Vec<*const c_char> {
    values
        .iter()
        .map(|v| v.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Child side of the fork: attach the slave as controlling terminal and exec.
fn exec_child(
    master_fd: RawFd,
    slave_fd: RawFd,
    program: &CStr,
    argv: &[*const c_char],
    envp: &[*const c_char],
) -> ! {
    let attached = setsid().is_ok()
        // SAFETY: TIOCSCTTY takes an int argument; slave_fd is open.
        && unsafe { libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) } != -1
        && dup2(slave_fd, libc::STDIN_FILENO).is_ok()
        && dup2(slave_fd, libc::STDOUT_FILENO).is_ok()
        && dup2(slave_fd, libc::STDERR_FILENO).is_ok();
    if attached {
        if slave_fd > libc::STDERR_FILENO {
            let _ = close(slave_fd);
        }
        let _ = close(master_fd);
        // SAFETY: argv and envp are null-terminated arrays of pointers into
        // CStrings the parent built before fork.
        unsafe { libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
    }
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(127) }
}

fn decode_wait(status: WaitStatus) -> Option<u32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code as u32),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32 as u32),
        _ => None,
    }
}

#[async_trait]
impl Pty for NativePty {
    fn backend(&self) -> PtyBackend {
        PtyBackend::Native
    }

    fn start(&self, columns: u32, rows: u32, command: &str, args: &[String]) -> Result<PtyIo> {
        let mut state = self.lock();
        if state.disposed {
            return Err(Error::Pty {
                message: "pty already disposed".to_string(),
            });
        }
        if state.pid.is_some() {
            return Err(Error::AlreadyStarted);
        }

        // Everything the child needs is allocated before fork.
        let program = resolve_program(command)?;
        let mut argv_owned = vec![cstring(command, "command")?];
        for arg in args {
            argv_owned.push(cstring(arg, "argument")?);
        }
        let envp_owned = child_environment()?;
        let argv = null_terminated(&argv_owned);
        let envp = null_terminated(&envp_owned);

        let pair = openpty(&winsize(columns, rows), &default_termios()).map_err(|e| Error::Pty {
            message: format!("failed to open pty: {}", e),
        })?;
        let master_fd = pair.master.as_raw_fd();
        let slave_fd = pair.slave.as_raw_fd();

        // SAFETY: the child does not allocate; it only makes async-signal-safe
        // calls before exec or _exit.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => exec_child(master_fd, slave_fd, &program, &argv, &envp),
            Ok(ForkResult::Parent { child }) => {
                drop(pair.slave);
                set_nonblocking(&pair.master)?;
                let master = Arc::new(AsyncFd::new(pair.master).map_err(|e| Error::Pty {
                    message: format!("failed to register pty: {}", e),
                })?);

                info!(command, pid = child.as_raw(), columns, rows, "PTY started");
                state.pid = Some(child);
                state.master = Some(Arc::clone(&master));

                Ok(PtyIo {
                    input: Box::new(PtyWriter {
                        fd: Arc::clone(&master),
                    }),
                    output: Box::new(PtyReader { fd: master }),
                })
            }
            Err(e) => Err(Error::Pty {
                message: format!("fork failed: {}", e),
            }),
        }
    }

    fn resize(&self, columns: u32, rows: u32) -> Result<()> {
        let state = self.lock();
        let Some(master) = state.master.as_ref() else {
            debug!(columns, rows, "Resize before start ignored");
            return Ok(());
        };

        let size = winsize(columns, rows);
        // SAFETY: TIOCSWINSZ reads a winsize from the pointer.
        let rc = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc == -1 {
            return Err(Error::Pty {
                message: format!("failed to resize pty: {}", io::Error::last_os_error()),
            });
        }
        debug!(columns, rows, "PTY resized");
        Ok(())
    }

    async fn wait_for_exit(&self, cancel: &CancellationToken) -> Result<u32> {
        loop {
            let pid = {
                let state = self.lock();
                if let Some(code) = state.exit {
                    return Ok(code);
                }
                state.pid.ok_or_else(|| Error::Pty {
                    message: "pty not started".to_string(),
                })?
            };

            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    if let Some(code) = decode_wait(status) {
                        info!(pid = pid.as_raw(), exit_code = code, "PTY child exited");
                        return Ok(self.record_exit(code));
                    }
                }
                // Reaped elsewhere (dispose); use whatever it recorded.
                Err(Errno::ECHILD) => return Ok(self.record_exit(0)),
                Err(e) => {
                    return Err(Error::Pty {
                        message: format!("failed to check child status: {}", e),
                    });
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(CHILD_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::Pty {
                        message: "wait for exit cancelled".to_string(),
                    });
                }
            }
        }
    }

    fn dispose(&self) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.master.take();

        let Some(pid) = state.pid else { return };
        if state.exit.is_some() {
            return;
        }
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!(pid = pid.as_raw(), error = %e, "Failed to kill PTY child");
            }
        }
        match waitpid(pid, None) {
            Ok(status) => state.exit = decode_wait(status),
            Err(e) => debug!(pid = pid.as_raw(), error = %e, "PTY child already reaped"),
        }
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Master fd streams
// =============================================================================

struct PtyReader {
    fd: Arc<AsyncFd<OwnedFd>>,
}

struct PtyWriter {
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl AsyncRead for PtyReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        unfilled.as_mut_ptr() as *mut libc::c_void,
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // EIO once every slave handle is closed: the shell is gone.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Poll::Ready(Ok(())),
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn shell(pty: &NativePty, script: &str) -> Option<PtyIo> {
        match pty.start(80, 25, "/bin/sh", &["-c".to_string(), script.to_string()]) {
            Ok(io) => Some(io),
            Err(e) => {
                // Containers without /dev/ptmx cannot run these tests.
                eprintln!("PTY start failed (may be expected in CI): {}", e);
                None
            }
        }
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let pty = NativePty::new();
        let Some(_io) = shell(&pty, "exit 7") else { return };
        let code = pty.wait_for_exit(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn exit_typed_into_interactive_shell() {
        let pty = NativePty::new();
        let mut io = match pty.start(80, 25, "/bin/sh", &[]) {
            Ok(io) => io,
            Err(e) => {
                eprintln!("PTY start failed (may be expected in CI): {}", e);
                return;
            }
        };

        io.input.write_all(b"exit 3\n").await.unwrap();
        let mut out = Vec::new();
        let _ = io.output.read_to_end(&mut out).await;
        let code = pty.wait_for_exit(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn programs_resolve_on_path() {
        assert_eq!(resolve_program("/bin/sh").unwrap().to_str().unwrap(), "/bin/sh");
        let sh = resolve_program("sh").unwrap();
        assert!(sh.to_str().unwrap().ends_with("/sh"));
        assert!(resolve_program("no-such-program-egs").is_err());
    }

    #[test]
    fn environment_always_carries_term() {
        let envp = child_environment().unwrap();
        assert!(envp.iter().any(|e| e.as_bytes().starts_with(b"TERM=")));
    }

    #[tokio::test]
    async fn output_reaches_the_reader() {
        let pty = NativePty::new();
        let Some(mut io) = shell(&pty, "printf hello-pty") else { return };
        let mut out = Vec::new();
        io.output.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("hello-pty"));
        assert_eq!(pty.wait_for_exit(&CancellationToken::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resize_before_start_is_a_no_op() {
        let pty = NativePty::new();
        pty.resize(120, 40).unwrap();
        let Some(_io) = shell(&pty, "exit 0") else { return };
        pty.resize(100, 30).unwrap();
    }

    #[tokio::test]
    async fn second_start_fails() {
        let pty = NativePty::new();
        let Some(_io) = shell(&pty, "exit 0") else { return };
        assert!(matches!(
            pty.start(80, 25, "/bin/sh", &[]),
            Err(Error::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn dispose_kills_running_child() {
        let pty = NativePty::new();
        let Some(_io) = shell(&pty, "sleep 30") else { return };
        pty.dispose();
        pty.dispose();
        let code = pty.wait_for_exit(&CancellationToken::new()).await.unwrap();
        assert_eq!(code, 128 + 9);
    }

    #[tokio::test]
    async fn wait_before_start_fails() {
        let pty = NativePty::new();
        assert!(pty.wait_for_exit(&CancellationToken::new()).await.is_err());
    }
}
