//! Session and channel behaviour through the full client and server stack.

use std::time::Duration;

use tokio::io::AsyncWriteExt;

use egs_client::{exec, list_directory};
use egs_core::error::Error;
use egs_core::protocol::{ChannelExit, ListDirectoryRequest, UploadFileRequest};
use egs_core::status;
use egs_e2e::Harness;
use egs_server::ServerEvent;
use egs_test_utils::{TestKeys, temp_dir, write_file};

#[tokio::test]
async fn listing_reports_three_entries() {
    let harness = Harness::new();
    let client = harness.connect().await.unwrap();
    let dir = temp_dir();
    write_file(dir.path(), "one.txt", b"1");
    write_file(dir.path(), "two.txt", b"22");
    write_file(dir.path(), "three/inner.txt", b"333");

    let listing = list_directory(client.session(), &dir.path().to_string_lossy())
        .await
        .unwrap();
    assert_eq!(listing.status, status::SUCCESS);
    let entries: Vec<_> = listing
        .entries
        .iter()
        .map(|e| (e.name.as_str(), e.is_directory, e.size))
        .collect();
    assert_eq!(
        entries,
        vec![("one.txt", false, 1), ("three", true, 0), ("two.txt", false, 2)]
    );
}

#[tokio::test]
async fn duplicate_request_on_channel_is_rejected() {
    let harness = Harness::new();
    let client = harness.connect().await.unwrap();
    let dir = temp_dir();
    let channel = client.session().open_channel().await.unwrap();

    let upload = UploadFileRequest {
        base_path: dir.path().to_string_lossy().into_owned(),
        path: "first.txt".into(),
        length: 5,
        overwrite: false,
    };
    let listing = ListDirectoryRequest {
        path: upload.base_path.clone(),
    };
    assert!(channel.send_request(&upload).await.unwrap());
    assert!(!channel.send_request(&listing).await.unwrap());

    let mut stream = channel.stream().unwrap();
    stream.write_all(b"first").await.unwrap();
    stream.shutdown().await.unwrap();
    channel.closed().await;

    assert_eq!(channel.exit(), Some(ChannelExit::Status(status::SUCCESS)));
    assert_eq!(std::fs::read(dir.path().join("first.txt")).unwrap(), b"first");
}

#[tokio::test]
async fn unauthorized_key_is_refused() {
    let harness = Harness::new();
    let mut events = harness.server.subscribe();
    let stranger = TestKeys::generate();

    assert!(harness.connect_as(&stranger).await.is_err());

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, ServerEvent::ExceptionRaised { .. }));
    assert_eq!(harness.server.session_count(), 0);
}

#[tokio::test]
async fn dispose_disconnects_clients() {
    let harness = Harness::new();
    let client = harness.connect().await.unwrap();
    let other = harness.connect().await.unwrap();

    for _ in 0..100 {
        if harness.server.session_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.server.session_count(), 2);

    harness.server.dispose().await;
    tokio::time::timeout(Duration::from_secs(5), client.session().closed())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), other.session().closed())
        .await
        .unwrap();

    let err = list_directory(client.session(), "/").await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
}

#[cfg(unix)]
#[tokio::test]
async fn exec_streams_output() {
    let harness = Harness::new();
    let client = harness.connect().await.unwrap();
    let mut output = Vec::new();
    let code = exec(client.session(), "echo from-guest", &mut output).await.unwrap();
    assert_eq!(code, 0);
    assert_eq!(String::from_utf8_lossy(&output).trim(), "from-guest");
}
