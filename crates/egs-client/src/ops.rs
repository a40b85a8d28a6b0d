//! Single-channel operations against a guest session.
//!
//! Every operation opens one channel, sends one request and reads the
//! result from the channel close: a numeric status (process exit code,
//! `0` for success, or an application error code) or an exception signal.

use std::path::Path;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use egs_core::error::{Error, Result};
use egs_core::protocol::{
    ChannelExit, DownloadFileRequest, ExecRequest, ListDirectoryRequest, RemoteFileInfo,
    RequestMessage, UploadFileRequest, decode_listing,
};
use egs_core::session::{Channel, Session};
use egs_core::status;

/// Result of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Close status reported by the guest.
    pub status: u32,
    /// Bytes moved over the channel.
    pub bytes: u64,
}

impl Transfer {
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }
}

/// Open a channel and send `request`, failing if the guest rejects it.
async fn open_with<M: RequestMessage>(session: &Session, request: &M) -> Result<Channel> {
    let channel = session.open_channel().await?;
    if !channel.send_request(request).await? {
        let _ = channel.close(None).await;
        return Err(Error::ChannelRejected {
            request_type: M::REQUEST_TYPE.to_string(),
        });
    }
    Ok(channel)
}

/// Wait for the guest to close the channel and decode its exit.
async fn finish(channel: &Channel) -> Result<u32> {
    channel.closed().await;
    match channel.exit() {
        Some(ChannelExit::Status(code)) => Ok(code),
        Some(ChannelExit::Signal { signal, message }) => Err(Error::Channel {
            message: format!("{}: {}", signal, message),
        }),
        None => Err(Error::ConnectionClosed),
    }
}

// =============================================================================
// Upload
// =============================================================================

/// Upload `request.length` bytes from `source`.
///
/// Stops sending as soon as the guest closes the channel, for example when
/// the target exists and overwriting was not requested.
pub async fn upload_stream<R>(session: &Session, request: &UploadFileRequest, source: R) -> Result<Transfer>
where
    R: AsyncRead + Unpin,
{
    let channel = open_with(session, request).await?;
    let mut stream = channel.stream()?;
    let mut limited = source.take(request.length);

    let copied = tokio::select! {
        result = tokio::io::copy(&mut limited, &mut stream) => Some(result),
        _ = channel.closed() => None,
    };
    let bytes = match copied {
        Some(Ok(bytes)) => {
            let _ = stream.shutdown().await;
            bytes
        }
        Some(Err(e)) if !channel.is_closed() => {
            let _ = channel.close(None).await;
            return Err(e.into());
        }
        _ => 0,
    };

    let code = finish(&channel).await?;
    debug!(target = %request.target_path().display(), bytes, status = code, "Upload finished");
    Ok(Transfer { status: code, bytes })
}

/// Upload a local file to `base_path`/`path` in the guest.
pub async fn upload_file(
    session: &Session,
    local: &Path,
    base_path: &str,
    path: &str,
    overwrite: bool,
) -> Result<Transfer> {
    let file = tokio::fs::File::open(local).await?;
    let length = file.metadata().await?.len();
    let request = UploadFileRequest {
        base_path: base_path.to_string(),
        path: path.to_string(),
        length,
        overwrite,
    };
    upload_stream(session, &request, file).await
}

// =============================================================================
// Download
// =============================================================================

/// Download into `sink`. A missing source writes nothing.
pub async fn download_stream<W>(session: &Session, request: &DownloadFileRequest, sink: &mut W) -> Result<Transfer>
where
    W: AsyncWrite + Unpin,
{
    let channel = open_with(session, request).await?;
    let mut stream = channel.stream()?;
    let bytes = tokio::io::copy(&mut stream, sink).await?;
    sink.flush().await?;

    let code = finish(&channel).await?;
    debug!(source = %request.source_path().display(), bytes, status = code, "Download finished");
    Ok(Transfer { status: code, bytes })
}

/// Download a guest file to `local`. The local file is removed unless the
/// transfer succeeds.
pub async fn download_file(session: &Session, remote: &str, local: &Path) -> Result<Transfer> {
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let request = DownloadFileRequest {
        path: remote.to_string(),
        file_name: String::new(),
    };

    let mut file = tokio::fs::File::create(local).await?;
    let result = download_stream(session, &request, &mut file).await;
    drop(file);

    let keep = matches!(&result, Ok(transfer) if transfer.is_success());
    if !keep {
        if let Err(e) = tokio::fs::remove_file(local).await {
            warn!(path = %local.display(), error = %e, "Failed to remove partial download");
        }
    }
    result
}

// =============================================================================
// Listing and exec
// =============================================================================

/// Immediate children of a guest directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub status: u32,
    /// Empty unless `status` is success.
    pub entries: Vec<RemoteFileInfo>,
}

pub async fn list_directory(session: &Session, path: &str) -> Result<Listing> {
    let request = ListDirectoryRequest {
        path: path.to_string(),
    };
    let channel = open_with(session, &request).await?;
    let mut data = Vec::new();
    channel.stream()?.read_to_end(&mut data).await?;

    let code = finish(&channel).await?;
    let entries = if code == status::SUCCESS {
        decode_listing(&data)?
    } else {
        Vec::new()
    };
    Ok(Listing {
        status: code,
        entries,
    })
}

/// Run `command` in the guest, copying its output to `output`.
///
/// Returns the process exit code. The command gets an empty stdin.
pub async fn exec<W>(session: &Session, command: &str, output: &mut W) -> Result<u32>
where
    W: AsyncWrite + Unpin,
{
    let request = ExecRequest {
        command: command.to_string(),
    };
    let channel = open_with(session, &request).await?;
    let mut stream = channel.stream()?;
    stream.shutdown().await?;
    tokio::io::copy(&mut stream, output).await?;
    output.flush().await?;
    finish(&channel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::served_session;
    use egs_test_utils::{pseudo_random_bytes, temp_dir, write_file};

    #[tokio::test]
    async fn upload_then_download_file() {
        let (session, _guard) = served_session().await;
        let local = temp_dir();
        let remote = temp_dir();
        let data = pseudo_random_bytes(300_000, 7);
        let source = write_file(local.path(), "in.bin", &data);
        let remote_base = remote.path().to_string_lossy().into_owned();

        let up = upload_file(&session, &source, &remote_base, "dir/out.bin", false)
            .await
            .unwrap();
        assert!(up.is_success());
        assert_eq!(up.bytes, data.len() as u64);

        let remote_file = remote.path().join("dir/out.bin").to_string_lossy().into_owned();
        let target = local.path().join("back.bin");
        let down = download_file(&session, &remote_file, &target).await.unwrap();
        assert!(down.is_success());
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn upload_refuses_existing_without_overwrite() {
        let (session, _guard) = served_session().await;
        let local = temp_dir();
        let remote = temp_dir();
        let source = write_file(local.path(), "new.txt", b"new contents");
        write_file(remote.path(), "same.txt", b"old");
        let remote_base = remote.path().to_string_lossy().into_owned();

        let refused = upload_file(&session, &source, &remote_base, "same.txt", false)
            .await
            .unwrap();
        assert_eq!(refused.status, status::FILE_EXISTS);
        assert_eq!(std::fs::read(remote.path().join("same.txt")).unwrap(), b"old");

        let replaced = upload_file(&session, &source, &remote_base, "same.txt", true)
            .await
            .unwrap();
        assert!(replaced.is_success());
        assert_eq!(
            std::fs::read(remote.path().join("same.txt")).unwrap(),
            b"new contents"
        );
    }

    #[tokio::test]
    async fn missing_download_leaves_no_local_file() {
        let (session, _guard) = served_session().await;
        let dir = temp_dir();
        let remote = dir.path().join("absent.txt").to_string_lossy().into_owned();
        let target = dir.path().join("local.txt");

        let transfer = download_file(&session, &remote, &target).await.unwrap();
        assert_eq!(transfer.status, status::FILE_NOT_FOUND);
        assert_eq!(transfer.bytes, 0);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn list_directory_reports_children() {
        let (session, _guard) = served_session().await;
        let dir = temp_dir();
        write_file(dir.path(), "a.txt", b"a");
        write_file(dir.path(), "b.txt", b"bb");
        write_file(dir.path(), "sub/c.txt", b"ccc");

        let listing = list_directory(&session, &dir.path().to_string_lossy())
            .await
            .unwrap();
        assert_eq!(listing.status, status::SUCCESS);
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

        let missing = list_directory(&session, &dir.path().join("nope").to_string_lossy())
            .await
            .unwrap();
        assert_eq!(missing.status, status::FILE_NOT_FOUND);
        assert!(missing.entries.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exec_returns_output_and_exit_code() {
        let (session, _guard) = served_session().await;
        let mut output = Vec::new();
        let code = exec(&session, "echo hello", &mut output).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(String::from_utf8_lossy(&output).trim(), "hello");

        let mut ignored = Vec::new();
        assert_eq!(exec(&session, "false", &mut ignored).await.unwrap(), 1);
    }
}
