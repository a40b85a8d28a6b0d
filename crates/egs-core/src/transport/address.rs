//! Hypervisor socket addresses.
//!
//! Two incompatible encodings exist:
//! - `SOCKADDR_HV` (Windows, AF_HYPERV): 36 bytes carrying a VM id and a service id
//! - `sockaddr_vm` (Linux, AF_VSOCK): 16 bytes carrying a context id and a port
//!
//! GUIDs use the little-endian field layout Windows stores them in. VSock
//! ports are derived from service ids that follow the Hyper-V integration
//! template `xxxxxxxx-facb-11e6-bd58-64006a7986d3`.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Address family of Hyper-V sockets.
pub const AF_HYPERV: u16 = 34;

/// Raw Hyper-V socket protocol.
pub const HV_PROTOCOL_RAW: i32 = 1;

/// Encoded size of `SOCKADDR_HV`.
pub const HYPERV_ADDRESS_LEN: usize = 36;

/// Address family of VM sockets.
pub const AF_VSOCK: u16 = 40;

/// Encoded size of `sockaddr_vm`.
pub const VSOCK_ADDRESS_LEN: usize = 16;

/// Bind to any context id.
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Local loopback context id.
pub const VMADDR_CID_LOCAL: u32 = 1;

/// Context id of the hypervisor host.
pub const VMADDR_CID_HOST: u32 = 2;

/// Well-known Hyper-V VM ids used as listen wildcards.
pub mod hyperv_ids {
    use uuid::Uuid;

    /// Accept connections from any partition.
    pub const WILDCARD: Uuid = Uuid::nil();
    /// Accept connections from child partitions.
    pub const CHILDREN: Uuid = Uuid::from_u128(0x90db8b89_0d35_4f79_8ce9_49ea0ac8b7cd);
    /// Accept connections from the parent partition.
    pub const PARENT: Uuid = Uuid::from_u128(0xa42e7cda_d03f_480c_9cc2_a4de20abb878);
    /// Accept loopback connections.
    pub const LOOPBACK: Uuid = Uuid::from_u128(0xe0e16197_dd56_4a10_9195_5ee7a155a838);
}

/// Template every VSock-compatible service id must follow.
const SERVICE_ID_TEMPLATE: Uuid = Uuid::from_u128(0x00000000_facb_11e6_bd58_64006a7986d3);

// =============================================================================
// Service id <-> port
// =============================================================================

/// Derive the VSock port from a Hyper-V integration service id.
pub fn service_id_to_port(service_id: &Uuid) -> Result<u32> {
    let bytes = service_id.to_bytes_le();
    let template = SERVICE_ID_TEMPLATE.to_bytes_le();
    if bytes[4..] != template[4..] {
        return Err(Error::Address {
            message: format!("service id {service_id} does not match the integration template"),
        });
    }
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Build the integration service id for a VSock port.
pub fn port_to_service_id(port: u32) -> Uuid {
    let mut bytes = SERVICE_ID_TEMPLATE.to_bytes_le();
    bytes[..4].copy_from_slice(&port.to_le_bytes());
    Uuid::from_bytes_le(bytes)
}

// =============================================================================
// SOCKADDR_HV
// =============================================================================

/// A Hyper-V socket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HyperVAddress {
    pub vm_id: Uuid,
    pub service_id: Uuid,
}

impl HyperVAddress {
    pub fn new(vm_id: Uuid, service_id: Uuid) -> Self {
        Self { vm_id, service_id }
    }

    /// Encode as `SOCKADDR_HV`.
    pub fn to_bytes(&self) -> [u8; HYPERV_ADDRESS_LEN] {
        let mut buf = [0u8; HYPERV_ADDRESS_LEN];
        buf[0..2].copy_from_slice(&AF_HYPERV.to_le_bytes());
        buf[4..20].copy_from_slice(&self.vm_id.to_bytes_le());
        buf[20..36].copy_from_slice(&self.service_id.to_bytes_le());
        buf
    }

    /// Decode a `SOCKADDR_HV`, validating length and family.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HYPERV_ADDRESS_LEN {
            return Err(Error::Address {
                message: format!(
                    "hyper-v address must be {HYPERV_ADDRESS_LEN} bytes, got {}",
                    data.len()
                ),
            });
        }
        let family = u16::from_le_bytes([data[0], data[1]]);
        if family != AF_HYPERV {
            return Err(Error::Address {
                message: format!("expected address family {AF_HYPERV}, got {family}"),
            });
        }
        let mut vm_id = [0u8; 16];
        vm_id.copy_from_slice(&data[4..20]);
        let mut service_id = [0u8; 16];
        service_id.copy_from_slice(&data[20..36]);
        Ok(Self {
            vm_id: Uuid::from_bytes_le(vm_id),
            service_id: Uuid::from_bytes_le(service_id),
        })
    }
}

impl fmt::Display for HyperVAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hv:{}/{}", self.vm_id, self.service_id)
    }
}

// =============================================================================
// sockaddr_vm
// =============================================================================

/// A VM socket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsockAddress {
    pub cid: u32,
    pub port: u32,
}

impl VsockAddress {
    pub fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }

    /// Encode as `sockaddr_vm`.
    pub fn to_bytes(&self) -> [u8; VSOCK_ADDRESS_LEN] {
        let mut buf = [0u8; VSOCK_ADDRESS_LEN];
        buf[0..2].copy_from_slice(&AF_VSOCK.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.port.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.cid.to_ne_bytes());
        buf
    }

    /// Decode a `sockaddr_vm`, validating length and family.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != VSOCK_ADDRESS_LEN {
            return Err(Error::Address {
                message: format!(
                    "vsock address must be {VSOCK_ADDRESS_LEN} bytes, got {}",
                    data.len()
                ),
            });
        }
        let family = u16::from_ne_bytes([data[0], data[1]]);
        if family != AF_VSOCK {
            return Err(Error::Address {
                message: format!("expected address family {AF_VSOCK}, got {family}"),
            });
        }
        Ok(Self {
            port: u32::from_ne_bytes([data[4], data[5], data[6], data[7]]),
            cid: u32::from_ne_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

impl fmt::Display for VsockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vsock:{}:{}", self.cid, self.port)
    }
}

// =============================================================================
// Listen scope and targets
// =============================================================================

/// Which peers may connect to a listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenScope {
    Any,
    Children,
    #[default]
    Parent,
    Loopback,
}

/// A concrete bind request for VM sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockBinding {
    pub address: VsockAddress,
    /// When set, accepted peers with a different cid are dropped.
    pub required_peer_cid: Option<u32>,
}

impl ListenScope {
    /// Hyper-V wildcard VM id for this scope.
    pub fn hyperv_vm_id(self) -> Uuid {
        match self {
            ListenScope::Any => hyperv_ids::WILDCARD,
            ListenScope::Children => hyperv_ids::CHILDREN,
            ListenScope::Parent => hyperv_ids::PARENT,
            ListenScope::Loopback => hyperv_ids::LOOPBACK,
        }
    }

    /// VSock bind address for this scope.
    ///
    /// VSock has no child wildcard. A guest cannot bind to the host cid, so
    /// `Parent` binds to any cid and filters accepted peers instead.
    pub fn vsock_binding(self, port: u32) -> Result<VsockBinding> {
        let (cid, required_peer_cid) = match self {
            ListenScope::Any => (VMADDR_CID_ANY, None),
            ListenScope::Parent => (VMADDR_CID_ANY, Some(VMADDR_CID_HOST)),
            ListenScope::Loopback => (VMADDR_CID_LOCAL, None),
            ListenScope::Children => {
                return Err(Error::Unsupported {
                    message: "listening for child partitions is not supported on vsock".into(),
                });
            }
        };
        Ok(VsockBinding {
            address: VsockAddress::new(cid, port),
            required_peer_cid,
        })
    }
}

impl FromStr for ListenScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(ListenScope::Any),
            "children" => Ok(ListenScope::Children),
            "parent" => Ok(ListenScope::Parent),
            "loopback" => Ok(ListenScope::Loopback),
            other => Err(Error::Address {
                message: format!("unknown listen scope {other:?}"),
            }),
        }
    }
}

impl fmt::Display for ListenScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenScope::Any => "any",
            ListenScope::Children => "children",
            ListenScope::Parent => "parent",
            ListenScope::Loopback => "loopback",
        };
        f.write_str(name)
    }
}

/// The VM a client connects to: a Hyper-V VM id or a VSock context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmTarget {
    HyperV(Uuid),
    Cid(u32),
}

impl FromStr for VmTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(cid) = s.parse::<u32>() {
            return Ok(VmTarget::Cid(cid));
        }
        Uuid::parse_str(s)
            .map(VmTarget::HyperV)
            .map_err(|e| Error::Address {
                message: format!("{s:?} is neither a VM id nor a context id: {e}"),
            })
    }
}

impl fmt::Display for VmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmTarget::HyperV(id) => write!(f, "{id}"),
            VmTarget::Cid(cid) => write!(f, "cid {cid}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_id() -> Uuid {
        Uuid::parse_str(crate::constants::SERVICE_ID).unwrap()
    }

    #[test]
    fn service_id_maps_to_port_5002() {
        assert_eq!(service_id_to_port(&service_id()).unwrap(), 5002);
        assert_eq!(port_to_service_id(5002), service_id());
    }

    #[test]
    fn foreign_service_id_rejected() {
        let id = Uuid::parse_str("0000138a-0000-11e6-bd58-64006a7986d3").unwrap();
        assert!(matches!(service_id_to_port(&id), Err(Error::Address { .. })));
    }

    #[test]
    fn hyperv_layout() {
        let addr = HyperVAddress::new(hyperv_ids::PARENT, service_id());
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), 36);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), AF_HYPERV);
        assert_eq!(&bytes[2..4], &[0, 0]);
        // Little-endian GUID layout: data1 of a42e7cda is stored reversed.
        assert_eq!(&bytes[4..8], &[0xda, 0x7c, 0x2e, 0xa4]);
        assert_eq!(&bytes[20..24], &[0x8a, 0x13, 0x00, 0x00]);
        assert_eq!(HyperVAddress::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn hyperv_rejects_bad_length_and_family() {
        let addr = HyperVAddress::new(hyperv_ids::WILDCARD, service_id());
        let bytes = addr.to_bytes();
        assert!(HyperVAddress::from_bytes(&bytes[..35]).is_err());

        let mut wrong = bytes;
        wrong[0] = 2;
        assert!(HyperVAddress::from_bytes(&wrong).is_err());
    }

    #[test]
    fn vsock_layout() {
        let addr = VsockAddress::new(3, 5002);
        let bytes = addr.to_bytes();
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), AF_VSOCK);
        assert_eq!(u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 5002);
        assert_eq!(u32::from_ne_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 3);
        assert_eq!(&bytes[12..], &[0, 0, 0, 0]);
        assert_eq!(VsockAddress::from_bytes(&bytes).unwrap(), addr);
    }

    #[test]
    fn vsock_rejects_bad_length_and_family() {
        let bytes = VsockAddress::new(2, 1).to_bytes();
        assert!(VsockAddress::from_bytes(&bytes[..12]).is_err());
        let mut wrong = bytes;
        wrong[0] = 34;
        wrong[1] = 0;
        assert!(VsockAddress::from_bytes(&wrong).is_err());
    }

    #[test]
    fn scope_bindings() {
        let parent = ListenScope::Parent.vsock_binding(5002).unwrap();
        assert_eq!(parent.address.cid, VMADDR_CID_ANY);
        assert_eq!(parent.required_peer_cid, Some(VMADDR_CID_HOST));

        let loopback = ListenScope::Loopback.vsock_binding(5002).unwrap();
        assert_eq!(loopback.address.cid, VMADDR_CID_LOCAL);

        assert!(matches!(
            ListenScope::Children.vsock_binding(5002),
            Err(Error::Unsupported { .. })
        ));
        assert_eq!(ListenScope::Any.hyperv_vm_id(), Uuid::nil());
    }

    #[test]
    fn scope_parse() {
        assert_eq!("Parent".parse::<ListenScope>().unwrap(), ListenScope::Parent);
        assert!("nowhere".parse::<ListenScope>().is_err());
        assert_eq!(ListenScope::Loopback.to_string(), "loopback");
    }

    #[test]
    fn vm_target_parse() {
        assert_eq!("3".parse::<VmTarget>().unwrap(), VmTarget::Cid(3));
        let id = "a42e7cda-d03f-480c-9cc2-a4de20abb878";
        assert_eq!(
            id.parse::<VmTarget>().unwrap(),
            VmTarget::HyperV(hyperv_ids::PARENT)
        );
        assert!("vm-1".parse::<VmTarget>().is_err());
    }
}
