//! AF_HYPERV stream sockets on Windows.
//!
//! WinSock sockets are used in blocking mode on dedicated threads and
//! bridged into tokio through an in-memory duplex pipe.

use std::io;
use std::mem;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tracing::{debug, trace};
use windows_sys::Win32::Networking::WinSock::{
    INVALID_SOCKET, SD_SEND, SOCK_STREAM, SOCKADDR, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR,
    WSADATA, WSAGetLastError, WSAStartup, accept, bind, closesocket, connect, listen, recv, send,
    shutdown, socket,
};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::{Error, Result};
use crate::transport::address::{AF_HYPERV, HV_PROTOCOL_RAW, HYPERV_ADDRESS_LEN, HyperVAddress};

static WSA_INIT: Once = Once::new();

fn ensure_winsock() {
    WSA_INIT.call_once(|| {
        // SAFETY: WSADATA is plain old data filled in by WSAStartup.
        let mut data: WSADATA = unsafe { mem::zeroed() };
        let rc = unsafe { WSAStartup(0x0202, &mut data) };
        if rc != 0 {
            debug!(error = rc, "WSAStartup failed");
        }
    });
}

fn last_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

/// A socket handle closed exactly once.
struct OwnedSocket {
    raw: AtomicUsize,
}

impl OwnedSocket {
    fn new(raw: SOCKET) -> Self {
        Self {
            raw: AtomicUsize::new(raw as usize),
        }
    }

    fn get(&self) -> SOCKET {
        self.raw.load(Ordering::Acquire) as SOCKET
    }

    fn close(&self) {
        let raw = self.raw.swap(INVALID_SOCKET as usize, Ordering::AcqRel) as SOCKET;
        if raw != INVALID_SOCKET {
            unsafe { closesocket(raw) };
        }
    }
}

impl Drop for OwnedSocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn new_socket() -> io::Result<OwnedSocket> {
    ensure_winsock();
    let raw = unsafe { socket(AF_HYPERV as i32, SOCK_STREAM as _, HV_PROTOCOL_RAW) };
    if raw == INVALID_SOCKET {
        return Err(last_error());
    }
    Ok(OwnedSocket::new(raw))
}

fn to_storage(addr: &HyperVAddress) -> SOCKADDR_STORAGE {
    let bytes = addr.to_bytes();
    // SAFETY: SOCKADDR_STORAGE is plain old data and larger than 36 bytes.
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut storage as *mut SOCKADDR_STORAGE as *mut u8,
            bytes.len(),
        );
    }
    storage
}

// =============================================================================
// Listener
// =============================================================================

/// A listening AF_HYPERV socket.
pub struct HyperVListener {
    socket: Arc<OwnedSocket>,
    local: HyperVAddress,
}

impl HyperVListener {
    pub fn bind(addr: HyperVAddress, backlog: i32) -> Result<Self> {
        let socket = new_socket().map_err(|e| Error::Transport {
            message: format!("failed to create hyper-v socket: {}", e),
        })?;
        let storage = to_storage(&addr);
        let rc = unsafe {
            bind(
                socket.get(),
                &storage as *const SOCKADDR_STORAGE as *const SOCKADDR,
                HYPERV_ADDRESS_LEN as i32,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(Error::Transport {
                message: format!("failed to bind {}: {}", addr, last_error()),
            });
        }
        if unsafe { listen(socket.get(), backlog) } == SOCKET_ERROR {
            return Err(Error::Transport {
                message: format!("failed to listen on {}: {}", addr, last_error()),
            });
        }
        Ok(Self {
            socket: Arc::new(socket),
            local: addr,
        })
    }

    pub fn local_addr(&self) -> HyperVAddress {
        self.local
    }

    /// Accept one connection on a blocking thread.
    pub async fn accept(&self) -> Result<(DuplexStream, HyperVAddress)> {
        let listener = Arc::clone(&self.socket);
        let (raw, peer) = tokio::task::spawn_blocking(move || -> Result<(SOCKET, HyperVAddress)> {
            // SAFETY: zeroed storage is valid; accept fills it in.
            let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
            let raw = unsafe {
                accept(
                    listener.get(),
                    &mut storage as *mut SOCKADDR_STORAGE as *mut SOCKADDR,
                    &mut len,
                )
            };
            if raw == INVALID_SOCKET {
                return Err(Error::Transport {
                    message: format!("accept failed: {}", last_error()),
                });
            }
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    &storage as *const SOCKADDR_STORAGE as *const u8,
                    (len as usize).min(mem::size_of::<SOCKADDR_STORAGE>()),
                )
            };
            match HyperVAddress::from_bytes(bytes) {
                Ok(peer) => Ok((raw, peer)),
                Err(e) => {
                    unsafe { closesocket(raw) };
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| Error::Transport {
            message: format!("accept task failed: {}", e),
        })??;

        Ok((bridge(OwnedSocket::new(raw)), peer))
    }
}

impl Drop for HyperVListener {
    fn drop(&mut self) {
        // Unblocks a pending accept.
        self.socket.close();
    }
}

/// Connect to a Hyper-V socket endpoint.
pub async fn connect_hyperv(addr: HyperVAddress) -> Result<DuplexStream> {
    let socket = tokio::task::spawn_blocking(move || -> Result<OwnedSocket> {
        let socket = new_socket().map_err(|e| Error::Transport {
            message: format!("failed to create hyper-v socket: {}", e),
        })?;
        let storage = to_storage(&addr);
        let rc = unsafe {
            connect(
                socket.get(),
                &storage as *const SOCKADDR_STORAGE as *const SOCKADDR,
                HYPERV_ADDRESS_LEN as i32,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(Error::Transport {
                message: format!("failed to connect to {}: {}", addr, last_error()),
            });
        }
        Ok(socket)
    })
    .await
    .map_err(|e| Error::Transport {
        message: format!("connect task failed: {}", e),
    })??;
    Ok(bridge(socket))
}

// =============================================================================
// Blocking bridge
// =============================================================================

/// Pump a blocking socket through a duplex pipe and return the async end.
fn bridge(socket: OwnedSocket) -> DuplexStream {
    let (near, far) = tokio::io::duplex(MAX_PACKET_SIZE * 2);
    let (mut far_read, mut far_write) = tokio::io::split(far);
    let socket = Arc::new(socket);
    let handle = Handle::current();

    let inbound_socket = Arc::clone(&socket);
    let inbound_handle = handle.clone();
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = unsafe {
                recv(
                    inbound_socket.get(),
                    buf.as_mut_ptr(),
                    buf.len() as i32,
                    0,
                )
            };
            if n <= 0 {
                if n < 0 {
                    trace!(error = %last_error(), "hyper-v recv ended");
                }
                let _ = inbound_handle.block_on(far_write.shutdown());
                break;
            }
            if inbound_handle
                .block_on(far_write.write_all(&buf[..n as usize]))
                .is_err()
            {
                break;
            }
        }
    });

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = match handle.block_on(far_read.read(&mut buf)) {
                Ok(0) | Err(_) => {
                    unsafe { shutdown(socket.get(), SD_SEND as _) };
                    break;
                }
                Ok(n) => n,
            };
            let mut sent = 0;
            while sent < n {
                let rc = unsafe {
                    send(
                        socket.get(),
                        buf[sent..n].as_ptr(),
                        (n - sent) as i32,
                        0,
                    )
                };
                if rc == SOCKET_ERROR || rc == 0 {
                    trace!(error = %last_error(), "hyper-v send failed");
                    return;
                }
                sent += rc as usize;
            }
        }
    });

    near
}
