//! Client sessions backed by an in-process guest.

use egs_core::session::{Session, SessionEvent};
use egs_server::ChannelServices;
use egs_test_utils::{SessionPair, session_pair};

/// Keeps the guest side of a test session alive.
pub(crate) struct GuestGuard {
    _server: Session,
}

/// A client session whose requests are answered by the standard services.
pub(crate) async fn served_session() -> (Session, GuestGuard) {
    let SessionPair {
        client,
        server,
        mut server_events,
        ..
    } = session_pair().await;

    tokio::spawn(async move {
        let services = ChannelServices::standard();
        while let Some(event) = server_events.next().await {
            if let SessionEvent::ChannelRequest(request) = event {
                let _ = services.handle_request(request).await;
            }
        }
    });
    (client, GuestGuard { _server: server })
}
