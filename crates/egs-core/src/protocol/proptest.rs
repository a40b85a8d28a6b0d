//! Property-based tests for request payloads and the frame codec.
//!
//! These tests verify:
//! - Every request message survives encode then decode field for field
//! - Decoding arbitrary bytes never panics
//! - Any strict prefix of an encoded upload request is rejected

#![cfg(test)]

use proptest::prelude::*;

use crate::protocol::{
    ChannelId, Codec, DownloadFileRequest, ExecRequest, ListDirectoryRequest, Message,
    PtyRequest, RequestMessage, SubsystemRequest, UploadFileRequest, WindowChangeRequest,
};

// =============================================================================
// Arbitrary Generators
// =============================================================================

prop_compose! {
    fn arb_upload()(
        base_path in ".{0,40}",
        path in ".{0,40}",
        length in any::<u64>(),
        overwrite in any::<bool>(),
    ) -> UploadFileRequest {
        UploadFileRequest { base_path, path, length, overwrite }
    }
}

prop_compose! {
    fn arb_window_change()(
        columns in any::<u32>(),
        rows in any::<u32>(),
        width_pixels in any::<u32>(),
        height_pixels in any::<u32>(),
    ) -> WindowChangeRequest {
        WindowChangeRequest { columns, rows, width_pixels, height_pixels }
    }
}

prop_compose! {
    fn arb_pty()(
        term in "[a-z0-9-]{0,20}",
        columns in any::<u32>(),
        rows in any::<u32>(),
        width_pixels in any::<u32>(),
        height_pixels in any::<u32>(),
        modes in prop::collection::vec(any::<u8>(), 0..64),
    ) -> PtyRequest {
        PtyRequest { term, columns, rows, width_pixels, height_pixels, modes }
    }
}

proptest! {
    #[test]
    fn upload_roundtrip(msg in arb_upload()) {
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(UploadFileRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn upload_prefix_rejected(msg in arb_upload(), cut in 0usize..1000) {
        let bytes = msg.encode().unwrap();
        let cut = cut % bytes.len();
        prop_assert!(UploadFileRequest::decode(&bytes[..cut]).is_err());
    }

    #[test]
    fn download_roundtrip(path in ".{0,60}", file_name in ".{0,30}") {
        let msg = DownloadFileRequest { path, file_name };
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(DownloadFileRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn list_directory_roundtrip(path in ".{0,80}") {
        let msg = ListDirectoryRequest { path };
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(ListDirectoryRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn window_change_roundtrip(msg in arb_window_change()) {
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(WindowChangeRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn pty_roundtrip(msg in arb_pty()) {
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(PtyRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn subsystem_roundtrip(name in "[ -~]{0,32}") {
        let msg = SubsystemRequest { name };
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(SubsystemRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn exec_roundtrip(command in ".{0,120}") {
        let msg = ExecRequest { command };
        let bytes = msg.encode().unwrap();
        prop_assert_eq!(ExecRequest::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn request_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = UploadFileRequest::decode(&data);
        let _ = DownloadFileRequest::decode(&data);
        let _ = WindowChangeRequest::decode(&data);
        let _ = PtyRequest::decode(&data);
        let _ = SubsystemRequest::decode(&data);
    }

    #[test]
    fn codec_decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Codec::decode_slice(&data);
    }

    #[test]
    fn data_frame_roundtrip(id in any::<u64>(), data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let msg = Message::ChannelData { channel_id: ChannelId::client(id), data };
        let encoded = Codec::encode(&msg).unwrap();
        prop_assert_eq!(Codec::decode_slice(&encoded).unwrap().unwrap(), msg);
    }
}
