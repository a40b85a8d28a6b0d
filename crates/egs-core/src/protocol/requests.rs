//! Typed channel-request payloads.
//!
//! Field order is part of the wire contract and must not change.

use std::path::PathBuf;

use bytes::Bytes;

use crate::constants::{DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM, request_types};
use crate::error::Result;
use crate::protocol::wire::{WireReader, WireWriter};

/// A channel-request payload with a fixed field layout.
pub trait RequestMessage: Sized {
    /// Request-type token selecting this payload.
    const REQUEST_TYPE: &'static str;

    fn write(&self, w: &mut WireWriter) -> Result<()>;

    fn read(r: &mut WireReader<'_>) -> Result<Self>;

    /// Encode into a standalone payload.
    fn encode(&self) -> Result<Bytes> {
        let mut w = WireWriter::new();
        self.write(&mut w)?;
        Ok(w.finish())
    }

    /// Decode a complete payload, rejecting trailing bytes.
    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let msg = Self::read(&mut r)?;
        r.finish()?;
        Ok(msg)
    }
}

/// Join `relative` onto `base` using `/` as the relative separator.
fn join_relative(base: &str, relative: &str) -> PathBuf {
    if base.is_empty() {
        return PathBuf::from(relative);
    }
    let mut path = PathBuf::from(base);
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        path.push(segment);
    }
    path
}

// =============================================================================
// File transfer
// =============================================================================

/// Upload a file into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadFileRequest {
    /// Target directory; when empty, `path` is used as-is.
    pub base_path: String,
    /// Target path, relative to `base_path` with `/` separators when a base is set.
    pub path: String,
    /// Number of bytes the client will send.
    pub length: u64,
    /// Replace an existing target.
    pub overwrite: bool,
}

impl UploadFileRequest {
    /// Resolved target path.
    pub fn target_path(&self) -> PathBuf {
        join_relative(&self.base_path, &self.path)
    }
}

impl RequestMessage for UploadFileRequest {
    const REQUEST_TYPE: &'static str = request_types::UPLOAD_FILE;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_string(&self.base_path)?
            .write_string(&self.path)?
            .write_u64(self.length)
            .write_bool(self.overwrite);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            base_path: r.read_string()?,
            path: r.read_string()?,
            length: r.read_u64()?,
            overwrite: r.read_bool()?,
        })
    }
}

/// Download a file from the guest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadFileRequest {
    pub path: String,
    /// Optional file name joined onto `path`.
    pub file_name: String,
}

impl DownloadFileRequest {
    /// Resolved source path.
    pub fn source_path(&self) -> PathBuf {
        join_relative(&self.path, &self.file_name)
    }
}

impl RequestMessage for DownloadFileRequest {
    const REQUEST_TYPE: &'static str = request_types::DOWNLOAD_FILE;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_string(&self.path)?.write_string(&self.file_name)?;
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            path: r.read_string()?,
            file_name: r.read_string()?,
        })
    }
}

/// List the immediate children of a guest directory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListDirectoryRequest {
    pub path: String,
}

impl RequestMessage for ListDirectoryRequest {
    const REQUEST_TYPE: &'static str = request_types::LIST_DIRECTORY;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_string(&self.path)?;
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            path: r.read_string()?,
        })
    }
}

// =============================================================================
// Terminal and process requests
// =============================================================================

/// Terminal resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowChangeRequest {
    pub columns: u32,
    pub rows: u32,
    pub width_pixels: u32,
    pub height_pixels: u32,
}

impl RequestMessage for WindowChangeRequest {
    const REQUEST_TYPE: &'static str = request_types::WINDOW_CHANGE;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_u32(self.columns)
            .write_u32(self.rows)
            .write_u32(self.width_pixels)
            .write_u32(self.height_pixels);
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            columns: r.read_u32()?,
            rows: r.read_u32()?,
            width_pixels: r.read_u32()?,
            height_pixels: r.read_u32()?,
        })
    }
}

/// Pseudo-terminal allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub columns: u32,
    pub rows: u32,
    pub width_pixels: u32,
    pub height_pixels: u32,
    /// Encoded terminal modes, passed through untouched.
    pub modes: Vec<u8>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: DEFAULT_TERM.to_string(),
            columns: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            width_pixels: 0,
            height_pixels: 0,
            modes: Vec::new(),
        }
    }
}

impl RequestMessage for PtyRequest {
    const REQUEST_TYPE: &'static str = request_types::PTY;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_string(&self.term)?
            .write_u32(self.columns)
            .write_u32(self.rows)
            .write_u32(self.width_pixels)
            .write_u32(self.height_pixels)
            .write_bytes(&self.modes)?;
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            term: r.read_string()?,
            columns: r.read_u32()?,
            rows: r.read_u32()?,
            width_pixels: r.read_u32()?,
            height_pixels: r.read_u32()?,
            modes: r.read_bytes()?.to_vec(),
        })
    }
}

/// Start the login shell; carries no fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShellRequest;

impl RequestMessage for ShellRequest {
    const REQUEST_TYPE: &'static str = request_types::SHELL;

    fn write(&self, _w: &mut WireWriter) -> Result<()> {
        Ok(())
    }

    fn read(_r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self)
    }
}

/// Run a command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    pub command: String,
}

impl RequestMessage for ExecRequest {
    const REQUEST_TYPE: &'static str = request_types::EXEC;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_string(&self.command)?;
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            command: r.read_string()?,
        })
    }
}

/// Select a named subsystem. The name is an ASCII token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubsystemRequest {
    pub name: String,
}

impl RequestMessage for SubsystemRequest {
    const REQUEST_TYPE: &'static str = request_types::SUBSYSTEM;

    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_ascii(&self.name)?;
        Ok(())
    }

    fn read(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            name: r.read_ascii()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn upload_field_order() {
        let msg = UploadFileRequest {
            base_path: "b".into(),
            path: "p".into(),
            length: 7,
            overwrite: true,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[0, 0, 0, 1, b'b', 0, 0, 0, 1, b'p', 0, 0, 0, 0, 0, 0, 0, 7, 1]
        );
    }

    #[test]
    fn upload_roundtrip_extremes() {
        let msg = UploadFileRequest {
            base_path: String::new(),
            path: String::new(),
            length: u64::MAX,
            overwrite: false,
        };
        let decoded = UploadFileRequest::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn upload_truncated_payload_fails() {
        let msg = UploadFileRequest {
            base_path: "/tmp".into(),
            path: "a.txt".into(),
            length: 10,
            overwrite: true,
        };
        let bytes = msg.encode().unwrap();
        // Dropping the overwrite flag must not default it.
        let err = UploadFileRequest::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Wire { .. }));
    }

    #[test]
    fn upload_target_path_joins_relative_segments() {
        let msg = UploadFileRequest {
            base_path: "/srv/data".into(),
            path: "nested/dir/file.bin".into(),
            ..Default::default()
        };
        assert_eq!(
            msg.target_path(),
            PathBuf::from("/srv/data").join("nested").join("dir").join("file.bin")
        );

        let bare = UploadFileRequest {
            path: "/tmp/x".into(),
            ..Default::default()
        };
        assert_eq!(bare.target_path(), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn download_source_path() {
        let plain = DownloadFileRequest {
            path: "/var/log/syslog".into(),
            file_name: String::new(),
        };
        assert_eq!(plain.source_path(), PathBuf::from("/var/log/syslog"));

        let joined = DownloadFileRequest {
            path: "/var/log".into(),
            file_name: "syslog".into(),
        };
        assert_eq!(joined.source_path(), PathBuf::from("/var/log").join("syslog"));
    }

    #[test]
    fn window_change_is_four_u32() {
        let msg = WindowChangeRequest {
            columns: 120,
            rows: 40,
            width_pixels: 0,
            height_pixels: u32::MAX,
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(WindowChangeRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn shell_rejects_payload() {
        assert!(ShellRequest::decode(&[]).is_ok());
        assert!(ShellRequest::decode(&[0]).is_err());
    }

    #[test]
    fn subsystem_must_be_ascii() {
        let msg = SubsystemRequest {
            name: "powershell".into(),
        };
        assert_eq!(SubsystemRequest::decode(&msg.encode().unwrap()).unwrap(), msg);

        let bad = SubsystemRequest {
            name: "pöwershell".into(),
        };
        assert!(bad.encode().is_err());
    }

    #[test]
    fn pty_request_defaults() {
        let msg = PtyRequest::default();
        assert_eq!((msg.columns, msg.rows), (80, 25));
        assert_eq!(PtyRequest::decode(&msg.encode().unwrap()).unwrap(), msg);
    }
}
