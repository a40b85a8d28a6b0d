//! In-memory session pairs.
//!
//! Both ends run the real handshake and multiplexer over a
//! `tokio::io::duplex`, so tests exercise the same code as a socket.

use egs_core::session::{Channel, IncomingRequest, Session, SessionEvent, SessionEvents};

use crate::test_keys::TestKeys;

const DUPLEX_CAPACITY: usize = 256 * 1024;

/// Connected client and server sessions.
pub struct SessionPair {
    pub client: Session,
    pub client_events: SessionEvents,
    pub server: Session,
    pub server_events: SessionEvents,
    pub keys: TestKeys,
}

/// Create an authenticated session pair with fresh keys.
pub async fn session_pair() -> SessionPair {
    session_pair_with_keys(TestKeys::generate()).await
}

/// Create an authenticated session pair using `keys`.
pub async fn session_pair_with_keys(keys: TestKeys) -> SessionPair {
    let (server_io, client_io) = tokio::io::duplex(DUPLEX_CAPACITY);
    let host_key = keys.host_public();
    let auth = keys.authenticator();

    let server = tokio::spawn(async move { Session::accept(server_io, &host_key, auth).await });
    let (client, client_events) = Session::connect(client_io, &keys.client, Some(&keys.host_public()))
        .await
        .expect("client handshake");
    let (server, server_events) = server
        .await
        .expect("server task")
        .expect("server handshake");

    SessionPair {
        client,
        client_events,
        server,
        server_events,
        keys,
    }
}

/// Wait for the next channel-open event.
pub async fn next_opened(events: &mut SessionEvents) -> Channel {
    match events.next().await {
        Some(SessionEvent::ChannelOpened(channel)) => channel,
        Some(SessionEvent::ChannelRequest(request)) => {
            panic!("expected channel open, got request {}", request.request_type)
        }
        None => panic!("session ended before a channel was opened"),
    }
}

/// Wait for the next channel-request event.
pub async fn next_request(events: &mut SessionEvents) -> IncomingRequest {
    loop {
        match events.next().await {
            Some(SessionEvent::ChannelRequest(request)) => return request,
            Some(SessionEvent::ChannelOpened(_)) => continue,
            None => panic!("session ended before a request arrived"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
