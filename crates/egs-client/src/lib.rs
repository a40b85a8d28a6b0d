//! Host-side client for eryph guest services.
//!
//! [`GuestClient`] connects to the guest service of a VM and hands out the
//! underlying session; the functions in [`ops`] and [`directory`] each run
//! one operation over it.

pub mod cli;
pub mod client;
pub mod directory;
pub mod ops;

#[cfg(test)]
mod testing;

pub use cli::{Cli, CliLogFormat, Command, DirectoryArgs};
pub use client::GuestClient;
pub use directory::{DirectoryTransferReport, download_directory, upload_directory};
pub use ops::{
    Listing, Transfer, download_file, download_stream, exec, list_directory, upload_file,
    upload_stream,
};
