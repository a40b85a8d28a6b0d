use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use egs_core::constants::request_types;
use egs_core::protocol::{
    ChannelExit, ListDirectoryRequest, RequestMessage, UploadFileRequest, decode_listing,
};
use egs_core::session::{Session, SessionEvent, SessionEvents};
use egs_core::status;
use egs_test_utils::{SessionPair, session_pair, temp_dir, write_file};

use super::*;
use crate::forwarder::ForwarderPhase;

/// Answer requests with the standard services until the session ends.
fn serve(mut events: SessionEvents) -> Arc<ForwarderRegistry> {
    let services = ChannelServices::standard();
    let registry = Arc::clone(services.registry());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if let SessionEvent::ChannelRequest(request) = event {
                let _ = services.handle_request(request).await;
            }
        }
    });
    registry
}

async fn served() -> (Session, Session, Arc<ForwarderRegistry>) {
    let SessionPair {
        client,
        server,
        server_events,
        ..
    } = session_pair().await;
    let registry = serve(server_events);
    (client, server, registry)
}

async fn wait_until_empty(registry: &ForwarderRegistry) {
    for _ in 0..100 {
        if registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry still holds {} forwarders", registry.len());
}

#[tokio::test]
async fn unknown_request_is_rejected() {
    let (client, _server, registry) = served().await;
    let channel = client.open_channel().await.unwrap();
    assert!(!channel.request("env", Bytes::new()).await.unwrap());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn second_start_on_same_channel_is_rejected() {
    let dir = temp_dir();
    let (client, _server, _registry) = served().await;
    let channel = client.open_channel().await.unwrap();

    let upload = UploadFileRequest {
        base_path: dir.path().to_string_lossy().into_owned(),
        path: "once.txt".into(),
        length: 4,
        overwrite: false,
    };
    let listing = ListDirectoryRequest {
        path: dir.path().to_string_lossy().into_owned(),
    };
    assert!(channel.send_request(&upload).await.unwrap());
    assert!(!channel.send_request(&listing).await.unwrap());

    let mut stream = channel.stream().unwrap();
    stream.write_all(b"data").await.unwrap();
    stream.shutdown().await.unwrap();
    channel.closed().await;

    assert_eq!(channel.exit(), Some(ChannelExit::Status(status::SUCCESS)));
    assert_eq!(std::fs::read(dir.path().join("once.txt")).unwrap(), b"data");
}

#[tokio::test]
async fn forwarder_is_removed_when_channel_closes() {
    let dir = temp_dir();
    write_file(dir.path(), "a.txt", b"1");
    write_file(dir.path(), "sub/b.txt", b"22");
    let (client, _server, registry) = served().await;

    let channel = client.open_channel().await.unwrap();
    let request = ListDirectoryRequest {
        path: dir.path().to_string_lossy().into_owned(),
    };
    assert!(channel.send_request(&request).await.unwrap());

    let mut data = Vec::new();
    channel.stream().unwrap().read_to_end(&mut data).await.unwrap();
    channel.closed().await;

    let entries = decode_listing(&data).unwrap();
    assert_eq!(entries.len(), 2);
    wait_until_empty(&registry).await;
}

#[tokio::test]
async fn window_change_without_pty_is_rejected() {
    let (client, _server, _registry) = served().await;
    let channel = client.open_channel().await.unwrap();
    let payload = egs_core::protocol::WindowChangeRequest {
        columns: 100,
        rows: 30,
        width_pixels: 0,
        height_pixels: 0,
    }
    .encode()
    .unwrap();
    assert!(!channel.request(request_types::WINDOW_CHANGE, payload).await.unwrap());
}

#[tokio::test]
async fn pty_request_then_resize_is_accepted() {
    let (client, _server, registry) = served().await;
    let channel = client.open_channel().await.unwrap();

    let pty = egs_core::protocol::PtyRequest {
        columns: 90,
        rows: 20,
        ..Default::default()
    };
    assert!(channel.send_request(&pty).await.unwrap());
    assert!(!channel.send_request(&pty).await.unwrap());

    let resize = egs_core::protocol::WindowChangeRequest {
        columns: 132,
        rows: 43,
        width_pixels: 0,
        height_pixels: 0,
    };
    assert!(channel.send_request(&resize).await.unwrap());

    let forwarder = registry.get(channel.id()).unwrap();
    assert_eq!(forwarder.as_pty().unwrap().size(), (132, 43));
    assert_eq!(forwarder.phase(), ForwarderPhase::NotStarted);

    channel.close(None).await.unwrap();
    wait_until_empty(&registry).await;
    assert_eq!(forwarder.phase(), ForwarderPhase::Terminal);
}

#[tokio::test]
async fn pipelined_shell_requests_start_once() {
    let (client, _server, registry) = served().await;
    let channel = client.open_channel().await.unwrap();
    let pty = egs_core::protocol::PtyRequest::default();
    assert!(channel.send_request(&pty).await.unwrap());

    let shell = egs_core::protocol::ShellRequest;
    let (first, second) = tokio::join!(channel.send_request(&shell), channel.send_request(&shell));
    let accepted = [first.unwrap(), second.unwrap()];
    assert_eq!(accepted.iter().filter(|ok| **ok).count(), 1);

    // A later request is refused as well, or finds the channel already
    // closed when no terminal is available.
    assert!(!channel.send_request(&shell).await.unwrap_or(false));

    let _ = channel.close(None).await;
    wait_until_empty(&registry).await;
}

#[cfg(unix)]
#[tokio::test]
async fn exec_reports_exit_code() {
    let (client, _server, _registry) = served().await;
    let channel = client.open_channel().await.unwrap();
    let exec = egs_core::protocol::ExecRequest {
        command: "sh -c exit".into(),
    };
    assert!(channel.send_request(&exec).await.unwrap());

    let mut out = Vec::new();
    channel.stream().unwrap().read_to_end(&mut out).await.unwrap();
    channel.closed().await;
    assert_eq!(channel.exit(), Some(ChannelExit::Status(0)));
}
