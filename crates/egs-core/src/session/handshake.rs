//! Session handshake.
//!
//! Runs on the raw stream before the reader and writer tasks exist:
//!
//! 1. server -> `ServerHello` (version, host key, nonce)
//! 2. client -> `ClientHello` (user, public key, SSHSIG over nonce and host key)
//! 3. server -> `HelloAck`, or `HelloAck` + `Disconnect` on rejection

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use ssh_key::PublicKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::auth::{
    Signer, encode_public_key, generate_nonce, key_fingerprint, parse_public_key,
    same_public_key, sign_client, verify_client,
};
use crate::constants::{CLIENT_USERNAME, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::protocol::{
    ClientHelloPayload, Codec, DisconnectPayload, DisconnectReason, HelloAckPayload, Message,
    ServerHelloPayload,
};

/// Decides whether a client identity may open a session.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, key: &PublicKey) -> bool;
}

pub(crate) async fn read_message<R>(io: &mut R, buf: &mut BytesMut) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(msg) = Codec::decode(buf)? {
            return Ok(msg);
        }
        if io.read_buf(buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

pub(crate) async fn write_message<W>(io: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = Codec::encode(msg)?;
    io.write_all(&bytes).await?;
    io.flush().await?;
    Ok(())
}

async fn refuse<W>(io: &mut W, reason: DisconnectReason, message: String) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if reason == DisconnectReason::AuthenticationFailed {
        write_message(
            io,
            &Message::HelloAck(HelloAckPayload {
                accepted: false,
                reason: Some(message.clone()),
            }),
        )
        .await?;
    }
    write_message(io, &Message::Disconnect(DisconnectPayload { reason, message })).await?;
    let _ = io.shutdown().await;
    Ok(())
}

/// Accepting side of the handshake.
pub(crate) async fn server_handshake<T>(
    io: &mut T,
    buf: &mut BytesMut,
    host_key: &PublicKey,
    authenticator: Arc<dyn Authenticator>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let host_key_text = encode_public_key(host_key)?;
    let nonce = generate_nonce();

    write_message(
        io,
        &Message::ServerHello(ServerHelloPayload {
            protocol_version: PROTOCOL_VERSION,
            host_key: host_key_text.clone(),
            nonce: nonce.to_vec(),
        }),
    )
    .await?;

    let hello = match read_message(io, buf).await? {
        Message::ClientHello(hello) => hello,
        other => {
            let message = format!("expected client-hello, got {}", other.kind());
            let _ = refuse(io, DisconnectReason::ProtocolError, message.clone()).await;
            return Err(Error::Protocol { message });
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let message = format!(
            "protocol version {} not supported (expected {})",
            hello.protocol_version, PROTOCOL_VERSION
        );
        let _ = refuse(io, DisconnectReason::VersionNotSupported, message.clone()).await;
        return Err(Error::Protocol { message });
    }

    let key = match parse_public_key(&hello.public_key) {
        Ok(key) => key,
        Err(e) => {
            let _ = refuse(io, DisconnectReason::AuthenticationFailed, e.to_string()).await;
            return Err(Error::AuthenticationFailed);
        }
    };
    let fingerprint = key_fingerprint(&key);

    let signature_ok = verify_client(&key, &hello.signature, &nonce, &host_key_text).unwrap_or(false);
    let authorized = signature_ok && authenticator.authenticate(&hello.username, &key).await;
    if !authorized {
        warn!(
            username = %hello.username,
            fingerprint = %fingerprint,
            signature_ok,
            "Client authentication rejected"
        );
        let _ = refuse(
            io,
            DisconnectReason::AuthenticationFailed,
            "client key not authorized".to_string(),
        )
        .await;
        return Err(Error::AuthenticationFailed);
    }

    write_message(
        io,
        &Message::HelloAck(HelloAckPayload {
            accepted: true,
            reason: None,
        }),
    )
    .await?;
    info!(username = %hello.username, fingerprint = %fingerprint, "Client authenticated");
    Ok(())
}

/// Connecting side of the handshake.
pub(crate) async fn client_handshake<T>(
    io: &mut T,
    buf: &mut BytesMut,
    signer: &dyn Signer,
    expected_host_key: Option<&PublicKey>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let hello = match read_message(io, buf).await? {
        Message::ServerHello(hello) => hello,
        other => {
            return Err(Error::Protocol {
                message: format!("expected server-hello, got {}", other.kind()),
            });
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Protocol {
            message: format!(
                "server speaks protocol version {}, expected {}",
                hello.protocol_version, PROTOCOL_VERSION
            ),
        });
    }

    let host_key = parse_public_key(&hello.host_key)?;
    if let Some(expected) = expected_host_key {
        if !same_public_key(expected, &host_key) {
            warn!(fingerprint = %key_fingerprint(&host_key), "Unexpected host key");
            return Err(Error::AuthenticationFailed);
        }
    }
    debug!(fingerprint = %key_fingerprint(&host_key), "Received server hello");

    let signature = sign_client(signer, &hello.nonce, &hello.host_key)?;
    write_message(
        io,
        &Message::ClientHello(ClientHelloPayload {
            protocol_version: PROTOCOL_VERSION,
            username: CLIENT_USERNAME.to_string(),
            public_key: encode_public_key(signer.public_key())?,
            signature,
        }),
    )
    .await?;

    match read_message(io, buf).await? {
        Message::HelloAck(HelloAckPayload { accepted: true, .. }) => Ok(()),
        Message::HelloAck(HelloAckPayload { reason, .. }) => {
            debug!(reason = ?reason, "Server rejected client");
            Err(Error::AuthenticationFailed)
        }
        Message::Disconnect(DisconnectPayload { reason, message }) => {
            debug!(reason = %reason, message = %message, "Server disconnected during handshake");
            match reason {
                DisconnectReason::AuthenticationFailed => Err(Error::AuthenticationFailed),
                _ => Err(Error::Protocol { message }),
            }
        }
        other => Err(Error::Protocol {
            message: format!("expected hello-ack, got {}", other.kind()),
        }),
    }
}
