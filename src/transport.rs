use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::wire::protocol::SessionId;

/// Client-visible reason codes for a forced close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DuplicateLogin,
    RoomClosed,
    Kicked,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::DuplicateLogin => "duplicate_login",
            CloseReason::RoomClosed => "room_closed",
            CloseReason::Kicked => "kicked",
        }
    }
}

/// Outbound side of the network layer as a room sees it.
///
/// `send` is fire-and-forget: it must return without waiting on delivery, and
/// a slow or dead receiver must never block other sessions. The room resolves
/// players to sessions before handing frames down; the transport only knows
/// session ids. `close_session` initiates a close; the eventual disconnect
/// flows back through the normal disconnect path.
pub trait Transport: Send + Sync {
    fn send(&self, session: SessionId, bytes: Vec<u8>);

    /// Deliver one already-encoded frame to every listed session. The bytes
    /// are produced once upstream; implementations fan out copies or
    /// substitute a cheaper native fan-out.
    fn broadcast(&self, sessions: &[SessionId], bytes: Vec<u8>) {
        if let Some((&last, rest)) = sessions.split_last() {
            for &session in rest {
                self.send(session, bytes.clone());
            }
            self.send(last, bytes);
        }
    }

    fn close_session(&self, session: SessionId, reason: CloseReason);
}

/// In-memory transport used by the harness and integration tests. Frames are
/// delivered over per-session unbounded channels. Forced closes are reported
/// on a feedback channel so the caller can drive the room's disconnect path.
pub struct ChannelTransport {
    sessions: RwLock<FxHashMap<SessionId, mpsc::UnboundedSender<Vec<u8>>>>,
    closed_tx: mpsc::UnboundedSender<(SessionId, CloseReason)>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(SessionId, CloseReason)>) {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sessions: RwLock::new(FxHashMap::default()),
                closed_tx,
            }),
            closed_rx,
        )
    }

    /// Register a session and return its delivery channel.
    pub fn open_session(&self, session: SessionId) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().insert(session, tx);
        rx
    }

    /// Drop a session without a forced-close notification (client-initiated
    /// disconnect).
    pub fn drop_session(&self, session: SessionId) {
        self.sessions.write().remove(&session);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, session: SessionId, bytes: Vec<u8>) {
        let sessions = self.sessions.read();
        match sessions.get(&session) {
            // Receiver may be gone mid-close; best effort.
            Some(tx) => {
                let _ = tx.send(bytes);
            }
            None => debug!(session, "send to unknown session dropped"),
        }
    }

    fn broadcast(&self, targets: &[SessionId], bytes: Vec<u8>) {
        let sessions = self.sessions.read();
        for &target in targets {
            if let Some(tx) = sessions.get(&target) {
                let _ = tx.send(bytes.clone());
            }
        }
    }

    fn close_session(&self, session: SessionId, reason: CloseReason) {
        if self.sessions.write().remove(&session).is_some() {
            let _ = self.closed_tx.send((session, reason));
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every send and close for assertions.
    #[derive(Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<(SessionId, Vec<u8>)>>,
        closed: Mutex<Vec<(SessionId, CloseReason)>>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn sent(&self) -> Vec<(SessionId, Vec<u8>)> {
            self.sent.lock().clone()
        }

        pub fn take_sent(&self) -> Vec<(SessionId, Vec<u8>)> {
            std::mem::take(&mut self.sent.lock())
        }

        pub fn frames_for(&self, session: SessionId) -> Vec<Vec<u8>> {
            self.sent
                .lock()
                .iter()
                .filter(|&&(target, _)| target == session)
                .map(|(_, bytes)| bytes.clone())
                .collect()
        }

        pub fn closed(&self) -> Vec<(SessionId, CloseReason)> {
            self.closed.lock().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, session: SessionId, bytes: Vec<u8>) {
            self.sent.lock().push((session, bytes));
        }

        fn close_session(&self, session: SessionId, reason: CloseReason) {
            self.closed.lock().push((session, reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_delivery() {
        let (transport, _closed) = ChannelTransport::new();
        let mut rx = transport.open_session(1);
        transport.send(1, vec![1, 2, 3]);
        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_to_listed_sessions() {
        let (transport, _closed) = ChannelTransport::new();
        let mut rx_a = transport.open_session(1);
        let mut rx_b = transport.open_session(2);
        let mut rx_c = transport.open_session(3);

        transport.broadcast(&[1, 2], vec![9]);
        assert_eq!(rx_a.recv().await, Some(vec![9]));
        assert_eq!(rx_b.recv().await, Some(vec![9]));
        // Session 3 was not in the recipient list.
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_session_reports_reason() {
        let (transport, mut closed) = ChannelTransport::new();
        let _rx = transport.open_session(7);
        transport.close_session(7, CloseReason::DuplicateLogin);
        assert_eq!(closed.recv().await, Some((7, CloseReason::DuplicateLogin)));
        assert_eq!(transport.session_count(), 0);

        // Closing an unknown session reports nothing.
        transport.close_session(7, CloseReason::Kicked);
        assert!(closed.try_recv().is_err());
    }

    #[test]
    fn test_unknown_session_send_is_dropped() {
        let (transport, _closed) = ChannelTransport::new();
        // Must not panic or block.
        transport.send(42, vec![1]);
        transport.broadcast(&[42, 43], vec![1]);
    }

    #[test]
    fn test_default_broadcast_uses_send() {
        let transport = testing::RecordingTransport::new();
        Transport::broadcast(&*transport, &[4, 5, 6], vec![7, 7]);
        assert_eq!(transport.frames_for(4), vec![vec![7, 7]]);
        assert_eq!(transport.frames_for(5), vec![vec![7, 7]]);
        assert_eq!(transport.frames_for(6), vec![vec![7, 7]]);
    }
}
