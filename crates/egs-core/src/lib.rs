//! egs-core: Shared library for eryph guest services.
//!
//! This crate provides:
//! - Session frames, the frame codec and channel-request payloads
//! - The multiplexed session layer with key-based authentication
//! - Hypervisor socket addressing and transport (AF_VSOCK / AF_HYPERV)
//! - Application status codes, constants and logging setup

pub mod auth;
pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use session::{Channel, ChannelStream, Session, SessionEvent, SessionEvents};
