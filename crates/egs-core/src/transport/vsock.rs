//! AF_VSOCK stream sockets on Linux.
//!
//! Sockets are created through libc (there is no std support for the
//! family) and driven by tokio's reactor through `AsyncFd`.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::transport::address::{AF_VSOCK, VSOCK_ADDRESS_LEN, VsockAddress};

fn new_socket() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            AF_VSOCK as libc::c_int,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: socket() returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Copy an encoded address into a `sockaddr_storage`.
fn to_storage(addr: &VsockAddress) -> (libc::sockaddr_storage, libc::socklen_t) {
    let bytes = addr.to_bytes();
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    // SAFETY: sockaddr_storage is larger than the 16 encoded bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            bytes.len(),
        );
    }
    (storage, VSOCK_ADDRESS_LEN as libc::socklen_t)
}

fn from_storage(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<VsockAddress> {
    let len = (len as usize).min(mem::size_of::<libc::sockaddr_storage>());
    // SAFETY: the kernel initialized `len` bytes of the storage.
    let bytes =
        unsafe { std::slice::from_raw_parts(storage as *const _ as *const u8, len) };
    VsockAddress::from_bytes(bytes)
}

fn socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

// =============================================================================
// Listener
// =============================================================================

/// A listening AF_VSOCK socket.
pub struct VsockListener {
    fd: AsyncFd<OwnedFd>,
    local: VsockAddress,
}

impl VsockListener {
    /// Bind and listen. Fails fast on any socket error.
    pub fn bind(addr: VsockAddress, backlog: i32) -> Result<Self> {
        let fd = new_socket().map_err(|e| Error::Transport {
            message: format!("failed to create vsock socket: {}", e),
        })?;
        let (storage, len) = to_storage(&addr);
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc < 0 {
            return Err(Error::Transport {
                message: format!("failed to bind {}: {}", addr, io::Error::last_os_error()),
            });
        }
        if unsafe { libc::listen(fd.as_raw_fd(), backlog) } < 0 {
            return Err(Error::Transport {
                message: format!("failed to listen on {}: {}", addr, io::Error::last_os_error()),
            });
        }
        let fd = AsyncFd::new(fd).map_err(|e| Error::Transport {
            message: format!("failed to register vsock listener: {}", e),
        })?;
        Ok(Self { fd, local: addr })
    }

    pub fn local_addr(&self) -> VsockAddress {
        self.local
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<(VsockStream, VsockAddress)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let accepted = guard.try_io(|inner| {
                // SAFETY: zeroed sockaddr_storage is valid; accept4 fills it.
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let fd = unsafe {
                    libc::accept4(
                        inner.as_raw_fd(),
                        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                        &mut len,
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: accept4 returned a fresh descriptor we now own.
                Ok((unsafe { OwnedFd::from_raw_fd(fd) }, storage, len))
            });

            match accepted {
                Ok(Ok((fd, storage, len))) => {
                    let peer = from_storage(&storage, len)?;
                    return Ok((VsockStream::from_owned(fd)?, peer));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

// =============================================================================
// Stream
// =============================================================================

/// A connected AF_VSOCK stream.
#[derive(Debug)]
pub struct VsockStream {
    fd: AsyncFd<OwnedFd>,
}

impl VsockStream {
    fn from_owned(fd: OwnedFd) -> Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Connect to a VM socket endpoint.
    pub async fn connect(addr: VsockAddress) -> Result<Self> {
        let fd = new_socket().map_err(|e| Error::Transport {
            message: format!("failed to create vsock socket: {}", e),
        })?;
        let (storage, len) = to_storage(&addr);
        let rc = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(Error::Transport {
                    message: format!("failed to connect to {}: {}", addr, err),
                });
            }
        }

        let stream = Self::from_owned(fd)?;
        let guard = stream.fd.writable().await?;
        drop(guard);
        socket_error(stream.fd.as_raw_fd()).map_err(|e| Error::Transport {
            message: format!("failed to connect to {}: {}", addr, e),
        })?;
        Ok(stream)
    }
}

impl AsyncRead for VsockStream {
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
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        libc::MSG_NOSIGNAL,
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
        if unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_WR) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Poll::Ready(Err(err));
            }
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_roundtrip() {
        let addr = VsockAddress::new(42, 5002);
        let (storage, len) = to_storage(&addr);
        assert_eq!(len as usize, VSOCK_ADDRESS_LEN);
        assert_eq!(from_storage(&storage, len).unwrap(), addr);
    }

    #[test]
    fn short_storage_is_rejected() {
        let (storage, _) = to_storage(&VsockAddress::new(1, 1));
        assert!(from_storage(&storage, 8).is_err());
    }

    #[tokio::test]
    async fn loopback_bind_is_best_effort() {
        // Hosts without the vsock module return EAFNOSUPPORT.
        let addr = VsockAddress::new(crate::transport::VMADDR_CID_LOCAL, 0xFFFF_0001);
        match VsockListener::bind(addr, 1) {
            Ok(listener) => assert_eq!(listener.local_addr(), addr),
            Err(e) => eprintln!("vsock unavailable (expected in CI): {}", e),
        }
    }
}
