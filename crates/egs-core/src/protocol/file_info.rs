//! Directory listing entries exchanged by the list-directory channel.

use std::fs::Metadata;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One entry of a remote directory listing.
///
/// Serialized as JSON with camelCase field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileInfo {
    pub name: String,
    pub full_path: String,
    pub is_directory: bool,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl RemoteFileInfo {
    /// Build an entry from a path and its metadata.
    pub fn from_metadata(path: &Path, metadata: &Metadata) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let is_directory = metadata.is_dir();
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Self {
            name,
            full_path: path.to_string_lossy().into_owned(),
            is_directory,
            size: if is_directory { 0 } else { metadata.len() },
            last_modified,
        }
    }
}

/// Serialize a listing for the channel stream.
pub fn encode_listing(entries: &[RemoteFileInfo]) -> Result<Vec<u8>> {
    serde_json::to_vec(entries).map_err(|e| Error::Codec {
        message: format!("failed to serialize listing: {e}"),
    })
}

/// Parse a listing received from the channel stream. Empty input is an empty listing.
pub fn decode_listing(data: &[u8]) -> Result<Vec<RemoteFileInfo>> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(data).map_err(|e| Error::Codec {
        message: format!("failed to parse listing: {e}"),
    })
}
