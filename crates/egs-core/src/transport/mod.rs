//! Hypervisor socket transport.
//!
//! Linux guests speak AF_VSOCK, Windows guests AF_HYPERV. Both are exposed
//! through [`HvListener`] and [`HvStream`] so the service layer never sees
//! the platform difference.

pub mod address;

#[cfg(target_os = "linux")]
mod vsock;

#[cfg(windows)]
mod hyperv;

use std::fmt;

use tracing::{debug, warn};
use uuid::Uuid;

pub use address::{
    HyperVAddress, ListenScope, VMADDR_CID_ANY, VMADDR_CID_HOST, VMADDR_CID_LOCAL, VmTarget,
    VsockAddress, VsockBinding, hyperv_ids, port_to_service_id, service_id_to_port,
};

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
pub use vsock::{VsockListener, VsockStream};

#[cfg(windows)]
pub use hyperv::{HyperVListener, connect_hyperv};

/// A connected hypervisor socket.
#[cfg(target_os = "linux")]
pub type HvStream = VsockStream;

/// A connected hypervisor socket.
#[cfg(not(target_os = "linux"))]
pub type HvStream = tokio::io::DuplexStream;

/// Address of an accepted peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddress {
    Vsock(VsockAddress),
    HyperV(HyperVAddress),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Vsock(addr) => addr.fmt(f),
            PeerAddress::HyperV(addr) => addr.fmt(f),
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// A listening hypervisor socket.
pub struct HvListener {
    #[cfg(target_os = "linux")]
    inner: VsockListener,
    #[cfg(target_os = "linux")]
    required_peer_cid: Option<u32>,

    #[cfg(windows)]
    inner: HyperVListener,

    #[cfg(not(any(target_os = "linux", windows)))]
    _never: std::convert::Infallible,
}

impl HvListener {
    /// Accept the next admissible connection.
    ///
    /// On VSock, peers outside the bound scope are logged and dropped.
    pub async fn accept(&self) -> Result<(HvStream, PeerAddress)> {
        #[cfg(target_os = "linux")]
        loop {
            let (stream, peer) = self.inner.accept().await?;
            if let Some(required) = self.required_peer_cid {
                if peer.cid != required {
                    warn!(peer = %peer, required_cid = required, "Rejecting connection from outside scope");
                    drop(stream);
                    continue;
                }
            }
            debug!(peer = %peer, "Accepted vsock connection");
            return Ok((stream, PeerAddress::Vsock(peer)));
        }

        #[cfg(windows)]
        {
            let (stream, peer) = self.inner.accept().await?;
            debug!(peer = %peer, "Accepted hyper-v connection");
            Ok((stream, PeerAddress::HyperV(peer)))
        }

        #[cfg(not(any(target_os = "linux", windows)))]
        match self._never {}
    }

    /// Human readable bound address.
    pub fn local_description(&self) -> String {
        #[cfg(any(target_os = "linux", windows))]
        {
            self.inner.local_addr().to_string()
        }

        #[cfg(not(any(target_os = "linux", windows)))]
        match self._never {}
    }
}

/// Create the listening endpoint for `service_id` within `scope`.
pub fn create_server_endpoint(
    scope: ListenScope,
    service_id: &Uuid,
    backlog: i32,
) -> Result<HvListener> {
    #[cfg(target_os = "linux")]
    {
        let port = service_id_to_port(service_id)?;
        let binding = scope.vsock_binding(port)?;
        let inner = VsockListener::bind(binding.address, backlog)?;
        debug!(scope = %scope, address = %binding.address, "Listening on vsock");
        Ok(HvListener {
            inner,
            required_peer_cid: binding.required_peer_cid,
        })
    }

    #[cfg(windows)]
    {
        let address = HyperVAddress::new(scope.hyperv_vm_id(), *service_id);
        let inner = HyperVListener::bind(address, backlog)?;
        debug!(scope = %scope, address = %address, "Listening on hyper-v socket");
        Ok(HvListener { inner })
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (scope, service_id, backlog);
        Err(Error::Unsupported {
            message: "hypervisor sockets are not available on this platform".into(),
        })
    }
}

/// Connect to `service_id` inside the VM named by `target`.
pub async fn create_client_endpoint(target: VmTarget, service_id: &Uuid) -> Result<HvStream> {
    #[cfg(target_os = "linux")]
    {
        match target {
            VmTarget::Cid(cid) => {
                let port = service_id_to_port(service_id)?;
                VsockStream::connect(VsockAddress::new(cid, port)).await
            }
            VmTarget::HyperV(vm_id) => Err(Error::Unsupported {
                message: format!("cannot address VM {vm_id} by id over vsock; use a context id"),
            }),
        }
    }

    #[cfg(windows)]
    {
        match target {
            VmTarget::HyperV(vm_id) => connect_hyperv(HyperVAddress::new(vm_id, *service_id)).await,
            VmTarget::Cid(cid) => Err(Error::Unsupported {
                message: format!("cannot address context id {cid} over hyper-v sockets"),
            }),
        }
    }

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (target, service_id);
        Err(Error::Unsupported {
            message: "hypervisor sockets are not available on this platform".into(),
        })
    }
}
