//! egs-server: Guest side of eryph guest services.
//!
//! Provides:
//! - Forwarders pumping channels to processes, PTYs, files and listings
//! - Channel services dispatching requests onto forwarders
//! - PTY provider with native, ConPTY and helper backends
//! - Socket server accepting hypervisor socket sessions
//! - Client authentication and status publication via KVP

pub mod auth;
pub mod cli;
pub mod forwarder;
pub mod kvp;
pub mod listener;
pub mod pty;
pub mod registry;
pub mod service;
pub mod status;

pub use auth::{ClientKeyProvider, ClientKeySource, GuestAuthenticator, load_host_key};
pub use cli::{Cli, CliLogFormat, CliScope};
pub use forwarder::{Forwarder, ForwarderPhase};
pub use listener::{Acceptor, ServerEvent, SocketServer};
pub use registry::ForwarderRegistry;
pub use service::{ChannelService, ChannelServices};
