use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::info;

use crate::config::ServerConfig;
use crate::metrics::SyncMetrics;
use crate::room::{Room, RoomHandle};
use crate::store::StateStore;
use crate::transport::Transport;
use crate::wire::protocol::RoomId;

/// Registry of live rooms, shared across connection handlers.
///
/// Holds handles only; each room's state lives inside its own task. Lock
/// sections never await, and shutdown dispatches first and awaits the acks
/// with the lock released.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    metrics: Arc<SyncMetrics>,
}

impl RoomRegistry {
    pub fn new(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
            transport,
            metrics,
        }
    }

    /// Spawn a self-ticking room around the given store.
    pub fn create_room(&self, store: Box<dyn StateStore>) -> Result<RoomHandle, RegistryError> {
        let mut rooms = self.rooms.write();
        if rooms.len() >= self.config.max_rooms {
            return Err(RegistryError::TooManyRooms);
        }
        let handle = Room::spawn_with_ticker(
            RoomId::new_v4(),
            &self.config,
            store,
            self.transport.clone(),
            self.metrics.clone(),
        );
        rooms.insert(handle.room_id(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, room_id: RoomId) -> Option<RoomHandle> {
        self.rooms.read().get(&room_id).cloned()
    }

    /// Remove a room and ask its task to stop. Returns the shutdown ack
    /// receiver, or None when the id is unknown.
    pub fn close_room(&self, room_id: RoomId) -> Option<tokio::sync::oneshot::Receiver<()>> {
        let handle = self.rooms.write().remove(&room_id)?;
        Some(handle.shutdown())
    }

    /// Drop handles whose task already stopped on its own.
    pub fn prune_closed(&self) {
        self.rooms.write().retain(|_, handle| !handle.is_closed());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.read().keys().copied().collect()
    }

    /// Stop every room and wait for each teardown to finish.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RoomHandle> = self.rooms.write().drain().map(|(_, h)| h).collect();
        info!(rooms = handles.len(), "shutting down all rooms");
        let acks: Vec<_> = handles.iter().map(|handle| handle.shutdown()).collect();
        for ack in acks {
            let _ = ack.await;
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("Too many rooms")]
    TooManyRooms,
}
