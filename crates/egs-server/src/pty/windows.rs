//! Windows pseudo-console (ConPTY) backend.
//!
//! The pseudo-console is bound to one pipe pair. Our pipe ends are pumped
//! on blocking threads and bridged into tokio through duplex pipes.
//!
//! Release order matters: pipes before the pseudo-console (otherwise
//! `ClosePseudoConsole` can deadlock on older builds), and the process is
//! terminated before its handle is closed.

use std::ffi::c_void;
use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use windows_sys::Wdk::System::SystemServices::RtlGetVersion;
use windows_sys::Win32::Foundation::{HANDLE, WAIT_OBJECT_0};
use windows_sys::Win32::System::Console::{
    COORD, ClosePseudoConsole, CreatePseudoConsole, HPCON, ResizePseudoConsole,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::SystemInformation::OSVERSIONINFOW;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT,
    GetExitCodeProcess, InitializeProcThreadAttributeList, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
    PROCESS_INFORMATION, STARTUPINFOEXW, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject,
};

use egs_core::constants::{CHILD_POLL_INTERVAL, MAX_PACKET_SIZE};
use egs_core::error::{Error, Result};

use super::{Pty, PtyBackend, PtyIo, clamp_dimension};

/// Windows build number from `RtlGetVersion` (not subject to manifest shims).
pub fn os_build_number() -> u32 {
    // SAFETY: OSVERSIONINFOW is plain old data sized before the call.
    let mut info: OSVERSIONINFOW = unsafe { mem::zeroed() };
    info.dwOSVersionInfoSize = mem::size_of::<OSVERSIONINFOW>() as u32;
    let status = unsafe { RtlGetVersion(&mut info) };
    if status < 0 {
        warn!(status, "RtlGetVersion failed");
        return 0;
    }
    info.dwBuildNumber
}

fn last_error(what: &str) -> Error {
    Error::Pty {
        message: format!("{} failed: {}", what, std::io::Error::last_os_error()),
    }
}

fn owned(handle: HANDLE) -> OwnedHandle {
    // SAFETY: callers pass freshly created handles they own.
    unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) }
}

fn pipe() -> Result<(OwnedHandle, OwnedHandle)> {
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    if unsafe { CreatePipe(&mut read, &mut write, ptr::null(), 0) } == 0 {
        return Err(last_error("CreatePipe"));
    }
    Ok((owned(read), owned(write)))
}

fn coord(columns: u32, rows: u32) -> COORD {
    COORD {
        X: clamp_dimension(columns).min(i16::MAX as u16) as i16,
        Y: clamp_dimension(rows).min(i16::MAX as u16) as i16,
    }
}

fn command_line(command: &str, args: &[String]) -> Vec<u16> {
    let mut line = if command.contains(' ') {
        format!("\"{}\"", command)
    } else {
        command.to_string()
    };
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line.encode_utf16().chain(std::iter::once(0)).collect()
}

// =============================================================================
// Owned platform resources
// =============================================================================

struct PseudoConsole(HPCON);

// SAFETY: an HPCON is a process-wide handle usable from any thread.
unsafe impl Send for PseudoConsole {}
unsafe impl Sync for PseudoConsole {}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        unsafe { ClosePseudoConsole(self.0) };
    }
}

struct AttributeList(Vec<u8>);

impl AttributeList {
    fn with_pseudo_console(console: &PseudoConsole) -> Result<Self> {
        let mut size = 0usize;
        // First call only reports the required size.
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size) };
        let mut buf = vec![0u8; size];
        let list = buf.as_mut_ptr() as *mut c_void;
        if unsafe { InitializeProcThreadAttributeList(list as _, 1, 0, &mut size) } == 0 {
            return Err(last_error("InitializeProcThreadAttributeList"));
        }
        let this = Self(buf);
        let ok = unsafe {
            UpdateProcThreadAttribute(
                this.as_ptr() as _,
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                console.0 as *const c_void,
                mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(last_error("UpdateProcThreadAttribute"));
        }
        Ok(this)
    }

    fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr() as *mut c_void
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_ptr() as _) };
    }
}

// SAFETY: the list is only touched during start and drop.
unsafe impl Send for AttributeList {}
unsafe impl Sync for AttributeList {}

struct Running {
    // Field order is release order.
    pty_input: Option<OwnedHandle>,
    pty_output: Option<OwnedHandle>,
    console: Option<PseudoConsole>,
    process: OwnedHandle,
    _thread: OwnedHandle,
    _attributes: AttributeList,
}

impl Running {
    fn release(&mut self) {
        self.pty_input.take();
        self.pty_output.take();
        self.console.take();
        unsafe { TerminateProcess(self.process.as_raw_handle() as HANDLE, 1) };
    }
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    exit: Option<u32>,
    disposed: bool,
}

/// ConPTY backed PTY.
#[derive(Default)]
pub struct ConPty {
    state: Mutex<State>,
}

impl ConPty {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Pty for ConPty {
    fn backend(&self) -> PtyBackend {
        PtyBackend::ConPty
    }

    fn start(&self, columns: u32, rows: u32, command: &str, args: &[String]) -> Result<PtyIo> {
        let mut state = self.lock();
        if state.disposed {
            return Err(Error::Pty {
                message: "pty already disposed".to_string(),
            });
        }
        if state.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let (pty_input, our_input) = pipe()?;
        let (our_output, pty_output) = pipe()?;

        let mut hpcon: HPCON = 0 as HPCON;
        let hr = unsafe {
            CreatePseudoConsole(
                coord(columns, rows),
                pty_input.as_raw_handle() as HANDLE,
                pty_output.as_raw_handle() as HANDLE,
                0,
                &mut hpcon,
            )
        };
        if hr < 0 {
            return Err(Error::Pty {
                message: format!("CreatePseudoConsole failed: {:#x}", hr),
            });
        }
        let console = PseudoConsole(hpcon);
        let attributes = AttributeList::with_pseudo_console(&console)?;

        // SAFETY: plain old data, sized below.
        let mut startup: STARTUPINFOEXW = unsafe { mem::zeroed() };
        startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
        startup.lpAttributeList = attributes.as_ptr() as _;
        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        let mut line = command_line(command, args);

        let ok = unsafe {
            CreateProcessW(
                ptr::null(),
                line.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                0,
                EXTENDED_STARTUPINFO_PRESENT,
                ptr::null(),
                ptr::null(),
                &startup.StartupInfo,
                &mut info,
            )
        };
        if ok == 0 {
            return Err(last_error("CreateProcessW"));
        }

        info!(command, pid = info.dwProcessId, columns, rows, "ConPTY started");
        state.running = Some(Running {
            pty_input: Some(pty_input),
            pty_output: Some(pty_output),
            console: Some(console),
            process: owned(info.hProcess),
            _thread: owned(info.hThread),
            _attributes: attributes,
        });

        Ok(bridge(our_input, our_output))
    }

    fn resize(&self, columns: u32, rows: u32) -> Result<()> {
        let state = self.lock();
        let Some(console) = state.running.as_ref().and_then(|r| r.console.as_ref()) else {
            debug!(columns, rows, "Resize before start ignored");
            return Ok(());
        };
        let hr = unsafe { ResizePseudoConsole(console.0, coord(columns, rows)) };
        if hr < 0 {
            return Err(Error::Pty {
                message: format!("ResizePseudoConsole failed: {:#x}", hr),
            });
        }
        Ok(())
    }

    async fn wait_for_exit(&self, cancel: &CancellationToken) -> Result<u32> {
        loop {
            {
                let mut state = self.lock();
                if let Some(code) = state.exit {
                    return Ok(code);
                }
                let Some(running) = state.running.as_ref() else {
                    return Err(Error::Pty {
                        message: "pty not started".to_string(),
                    });
                };
                let process = running.process.as_raw_handle() as HANDLE;
                if unsafe { WaitForSingleObject(process, 0) } == WAIT_OBJECT_0 {
                    let mut code = 0u32;
                    if unsafe { GetExitCodeProcess(process, &mut code) } == 0 {
                        return Err(last_error("GetExitCodeProcess"));
                    }
                    state.exit = Some(code);
                    // The console must close for the output pipe to drain to EOF.
                    if let Some(running) = state.running.as_mut() {
                        running.pty_input.take();
                        running.pty_output.take();
                        running.console.take();
                    }
                    return Ok(code);
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
        if let Some(mut running) = state.running.take() {
            running.release();
            drop(running);
        }
    }
}

impl Drop for ConPty {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Pipe bridge
// =============================================================================

fn bridge(input: OwnedHandle, output: OwnedHandle) -> PtyIo {
    let handle = Handle::current();

    let (input_near, input_far) = tokio::io::duplex(MAX_PACKET_SIZE);
    let (output_near, output_far) = tokio::io::duplex(MAX_PACKET_SIZE);

    let mut input_file = File::from(input);
    let mut output_file = File::from(output);

    let input_handle = handle.clone();
    tokio::task::spawn_blocking(move || {
        let mut far = input_far;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match input_handle.block_on(far.read(&mut buf)) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if input_file.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        let mut far = output_far;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match output_file.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if handle.block_on(far.write_all(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = handle.block_on(far.shutdown());
    });

    PtyIo {
        input: Box::new(input_near),
        output: Box::new(output_near),
    }
}
