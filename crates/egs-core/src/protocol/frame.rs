//! Session frames exchanged between host and guest.
//!
//! This module provides:
//! - Channel identification (opening side plus per-side counter)
//! - Handshake payloads
//! - Channel lifecycle, request and data frames

use serde::{Deserialize, Serialize};

// =============================================================================
// Channel Identification Types
// =============================================================================

/// Which side opened the channel.
///
/// Both peers can open channels; each allocates from its own namespace so
/// `(Client, 5)` and `(Server, 5)` never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelSide {
    /// Opened by the connecting side (the host tool).
    Client,
    /// Opened by the accepting side (the guest service).
    Server,
}

/// Unique channel identifier within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub side: ChannelSide,
    pub id: u64,
}

impl ChannelId {
    pub fn client(id: u64) -> Self {
        Self {
            side: ChannelSide::Client,
            id,
        }
    }

    pub fn server(id: u64) -> Self {
        Self {
            side: ChannelSide::Server,
            id,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.side, ChannelSide::Client)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.side {
            ChannelSide::Client => "c",
            ChannelSide::Server => "s",
        };
        write!(f, "{}{}", prefix, self.id)
    }
}

// =============================================================================
// Channel termination
// =============================================================================

/// How a channel ended, as reported by the side that closed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelExit {
    /// Numeric status: process exit code, 0 for success, or an application error code.
    Status(u32),
    /// Named signal with a human-readable message.
    Signal { signal: String, message: String },
}

impl ChannelExit {
    /// Numeric status, if the channel closed with one.
    pub fn status(&self) -> Option<u32> {
        match self {
            ChannelExit::Status(code) => Some(*code),
            ChannelExit::Signal { .. } => None,
        }
    }
}

impl std::fmt::Display for ChannelExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelExit::Status(code) => write!(f, "status {code:#x}"),
            ChannelExit::Signal { signal, message } => write!(f, "signal {signal}: {message}"),
        }
    }
}

/// Reason attached to a session disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    ByApplication,
    ProtocolError,
    AuthenticationFailed,
    VersionNotSupported,
    ServiceShutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DisconnectReason::ByApplication => "by application",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::AuthenticationFailed => "authentication failed",
            DisconnectReason::VersionNotSupported => "version not supported",
            DisconnectReason::ServiceShutdown => "service shutdown",
        };
        f.write_str(text)
    }
}

// =============================================================================
// Handshake payloads
// =============================================================================

/// First frame, sent by the accepting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHelloPayload {
    pub protocol_version: u32,
    /// OpenSSH-encoded host public key.
    pub host_key: String,
    pub nonce: Vec<u8>,
}

/// Client identity proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHelloPayload {
    pub protocol_version: u32,
    pub username: String,
    /// OpenSSH-encoded client public key.
    pub public_key: String,
    /// PEM-encoded SSHSIG over the handshake transcript.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub accepted: bool,
    pub reason: Option<String>,
}

// =============================================================================
// Channel payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequestPayload {
    pub channel_id: ChannelId,
    pub request_type: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClosePayload {
    pub channel_id: ChannelId,
    pub exit: Option<ChannelExit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectPayload {
    pub reason: DisconnectReason,
    pub message: String,
}

// =============================================================================
// Message
// =============================================================================

/// Every frame that can appear on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    ServerHello(ServerHelloPayload),
    ClientHello(ClientHelloPayload),
    HelloAck(HelloAckPayload),

    ChannelOpen {
        channel_id: ChannelId,
        max_packet_size: u32,
    },
    ChannelOpenConfirm {
        channel_id: ChannelId,
    },
    ChannelOpenFailure {
        channel_id: ChannelId,
        reason: String,
    },

    ChannelRequest(ChannelRequestPayload),
    ChannelSuccess {
        channel_id: ChannelId,
    },
    ChannelFailure {
        channel_id: ChannelId,
    },

    ChannelData {
        channel_id: ChannelId,
        data: Vec<u8>,
    },
    ChannelEof {
        channel_id: ChannelId,
    },
    ChannelClose(ChannelClosePayload),

    Disconnect(DisconnectPayload),
}

impl Message {
    /// Frame name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ServerHello(_) => "server-hello",
            Message::ClientHello(_) => "client-hello",
            Message::HelloAck(_) => "hello-ack",
            Message::ChannelOpen { .. } => "channel-open",
            Message::ChannelOpenConfirm { .. } => "channel-open-confirm",
            Message::ChannelOpenFailure { .. } => "channel-open-failure",
            Message::ChannelRequest(_) => "channel-request",
            Message::ChannelSuccess { .. } => "channel-success",
            Message::ChannelFailure { .. } => "channel-failure",
            Message::ChannelData { .. } => "channel-data",
            Message::ChannelEof { .. } => "channel-eof",
            Message::ChannelClose(_) => "channel-close",
            Message::Disconnect(_) => "disconnect",
        }
    }
}
