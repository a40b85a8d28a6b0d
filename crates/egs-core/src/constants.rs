//! Protocol and configuration constants for eryph guest services.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Current session protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum data carried by one channel data frame.
pub const MAX_PACKET_SIZE: usize = 32 * 1024;

/// Copy buffer used by file forwarders.
pub const FILE_BUFFER_SIZE: usize = 2 * MAX_PACKET_SIZE;

/// Depth of the per-session outbound frame queue.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Length of the handshake nonce.
pub const AUTH_NONCE_LEN: usize = 32;

/// SSHSIG namespace used for session authentication.
pub const AUTH_NAMESPACE: &str = "egs-auth";

/// The only user name accepted by the guest service.
pub const CLIENT_USERNAME: &str = "egs";

/// Hyper-V integration service id of the guest services (VSock port 5002).
pub const SERVICE_ID: &str = "0000138a-facb-11e6-bd58-64006a7986d3";

/// Human-readable service name.
pub const SERVICE_NAME: &str = "Eryph Guest Services";

// =============================================================================
// Timing Constants
// =============================================================================

/// Time allowed for the session handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval used when reaping PTY children.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Terminal Defaults
// =============================================================================

/// Default terminal columns.
pub const DEFAULT_COLS: u32 = 80;

/// Default terminal rows.
pub const DEFAULT_ROWS: u32 = 25;

/// Default TERM environment variable.
pub const DEFAULT_TERM: &str = "xterm-256color";

// =============================================================================
// Channel Request Types
// =============================================================================

/// Request-type tokens carried by channel requests.
pub mod request_types {
    /// Upload a file from the host into the guest.
    pub const UPLOAD_FILE: &str = "upload-file@eryph.io";
    /// Download a file from the guest to the host.
    pub const DOWNLOAD_FILE: &str = "download-file@eryph.io";
    /// List the immediate children of a guest directory.
    pub const LIST_DIRECTORY: &str = "list-directory@eryph.io";
    pub const SHELL: &str = "shell";
    pub const EXEC: &str = "exec";
    pub const PTY: &str = "pty-req";
    pub const WINDOW_CHANGE: &str = "window-change";
    pub const SUBSYSTEM: &str = "subsystem";
}

/// Signal name used when a forwarder fails with an unexpected error.
pub const EXCEPTION_SIGNAL: &str = "exception";

/// The only subsystem the guest service knows.
pub const POWERSHELL_SUBSYSTEM: &str = "powershell";

// =============================================================================
// Data Exchange (KVP) Constants
// =============================================================================

/// KVP key announcing the guest service status.
pub const STATUS_KEY: &str = "eryph:guest-services:status";

/// Status value published while the service is listening.
pub const STATUS_AVAILABLE: &str = "available";

/// KVP key holding the operating system of the guest.
pub const OPERATING_SYSTEM_KEY: &str = "eryph:guest-services:operating-system";

/// KVP key holding the guest service version.
pub const VERSION_KEY: &str = "eryph:guest-services:version";

/// KVP key carrying the authorized client public key (host to guest).
pub const CLIENT_AUTH_KEY: &str = "eryph:guest-services:client-public-key";

/// Directory holding the Linux KVP pool files.
pub const KVP_POOL_DIR: &str = "/var/lib/hyperv";

/// Maximum KVP key size in bytes.
pub const KVP_MAX_KEY_SIZE: usize = 512;

/// Maximum KVP value size in bytes.
pub const KVP_MAX_VALUE_SIZE: usize = 2048;
