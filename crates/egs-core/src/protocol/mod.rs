//! Protocol module for the guest services wire formats.
//!
//! This module provides:
//! - Session frames and the length-prefixed bincode codec
//! - SSH-style encoding of channel-request payloads
//! - Typed request messages and directory listing entries

mod codec;
mod file_info;
mod frame;
mod requests;
mod wire;

#[cfg(test)]
mod proptest;

pub use codec::{Codec, FRAME_HEADER_LEN};
pub use file_info::{RemoteFileInfo, decode_listing, encode_listing};
pub use frame::*;
pub use requests::*;
pub use wire::{WireReader, WireWriter};
