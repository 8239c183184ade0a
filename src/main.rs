mod config;
mod metrics;
mod registry;
mod room;
mod store;
mod transport;
mod wire;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;
use crate::metrics::SyncMetrics;
use crate::registry::RoomRegistry;
use crate::room::{EventTarget, RoomHandle};
use crate::store::MemoryStore;
use crate::transport::{ChannelTransport, CloseReason};
use crate::wire::codec::{decode_server_frame, encode_client_message};
use crate::wire::protocol::{
    ActionEnvelope, ClientId, ClientMessage, EventBody, FieldValue, JoinRequest, PlayerId,
    ServerFrame, SessionId, WireFormat,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("LandSync Server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        max_rooms = config.max_rooms,
        max_sessions = config.max_sessions_per_room,
        tick_rate = config.tick_rate,
        format = %config.wire_format,
        "configuration loaded"
    );

    let metrics = Arc::new(SyncMetrics::new());
    let (transport, closed_rx) = ChannelTransport::new();
    let registry = Arc::new(RoomRegistry::new(
        config.clone(),
        transport.clone(),
        metrics.clone(),
    ));

    // Simulated load: no outer network layer here, clients drive the rooms
    // through the in-process transport exactly like a socket handler would.
    let sim_rooms: usize = std::env::var("SIM_ROOMS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);
    let sim_clients: usize = std::env::var("SIM_CLIENTS_PER_ROOM")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);

    let session_rooms: Arc<RwLock<FxHashMap<SessionId, RoomHandle>>> =
        Arc::new(RwLock::new(FxHashMap::default()));
    tokio::spawn(route_closed_sessions(closed_rx, session_rooms.clone()));

    let next_session = AtomicU64::new(1);
    for _ in 0..sim_rooms {
        let room = registry.create_room(Box::new(MemoryStore::new()))?;
        tokio::spawn(announce_loop(room.clone()));
        for seat in 0..sim_clients {
            let session_id = next_session.fetch_add(1, Ordering::Relaxed);
            session_rooms.write().insert(session_id, room.clone());
            tokio::spawn(simulate_client(
                room.clone(),
                transport.clone(),
                session_id,
                seat,
            ));
        }
    }
    info!(rooms = sim_rooms, clients_per_room = sim_clients, "simulation started");

    // Periodic status line; also drops registry entries for rooms that
    // stopped on their own.
    let status_registry = registry.clone();
    let status_metrics = metrics.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.tick().await;
        loop {
            interval.tick().await;
            status_registry.prune_closed();
            info!(
                rooms = status_registry.room_count(),
                "status {}",
                status_metrics.to_json()
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    registry.shutdown_all().await;
    info!("Server stopped");

    Ok(())
}

/// Feed transport-level closes back into the owning room as disconnects.
async fn route_closed_sessions(
    mut closed_rx: mpsc::UnboundedReceiver<(SessionId, CloseReason)>,
    session_rooms: Arc<RwLock<FxHashMap<SessionId, RoomHandle>>>,
) {
    while let Some((session_id, reason)) = closed_rx.recv().await {
        debug!(session = session_id, reason = reason.as_str(), "session closed");
        if let Some(room) = session_rooms.write().remove(&session_id) {
            room.on_disconnect(session_id);
        }
    }
}

/// Server-originated broadcast events, delivered inside the tick frames.
async fn announce_loop(room: RoomHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(7));
    let mut count = 0u64;
    loop {
        interval.tick().await;
        if room.is_closed() {
            break;
        }
        count += 1;
        room.emit_event(
            EventTarget::Broadcast,
            EventBody::new("announcement").with("count", count as i64),
        );
    }
}

/// One synthetic client: join, then a steady stream of state actions while
/// draining whatever the room sends back.
async fn simulate_client(
    room: RoomHandle,
    transport: Arc<ChannelTransport>,
    session_id: SessionId,
    seat: usize,
) {
    let mut rx = transport.open_session(session_id);
    room.on_connect(session_id, ClientId::new_v4());

    let player_id = PlayerId::new_v4();
    let join = ClientMessage::Join(JoinRequest {
        request_id: 1,
        player_id,
        account_key: None,
        display_name: Some(format!("sim-{seat}")),
    });
    let Ok(bytes) = encode_client_message(&join, WireFormat::Text) else {
        return;
    };
    room.on_message(session_id, bytes);

    // The response is portable text and tells us the steady-state format.
    let Some(frame) = rx.recv().await else {
        return;
    };
    let format = match decode_server_frame(&frame, WireFormat::Text) {
        Ok(ServerFrame::JoinResponse(response)) => {
            debug!(session = session_id, slot = response.player_slot, "sim client joined");
            response.encoding
        }
        Ok(ServerFrame::JoinError(error)) => {
            warn!(session = session_id, code = %error.code, "sim client rejected");
            return;
        }
        _ => return,
    };

    let mut actions = tokio::time::interval(Duration::from_millis(250));
    let mut request_id = 1u64;
    loop {
        tokio::select! {
            received = rx.recv() => {
                // Closed by the server (kick or room shutdown).
                if received.is_none() {
                    break;
                }
            }
            _ = actions.tick() => {
                request_id += 1;
                let message = build_action(seat, request_id);
                match encode_client_message(&message, format) {
                    Ok(bytes) => room.on_message(session_id, bytes),
                    Err(err) => warn!(session = session_id, error = %err, "sim encode failed"),
                }
            }
        }
    }
    debug!(session = session_id, "sim client finished");
}

fn build_action(seat: usize, request_id: u64) -> ClientMessage {
    let mut rng = rand::thread_rng();
    let mut args = std::collections::BTreeMap::new();
    if request_id % 4 == 0 {
        args.insert(
            "path".to_string(),
            FieldValue::Str("inventory.gold".to_string()),
        );
        args.insert("value".to_string(), FieldValue::Int(rng.gen_range(0..1000)));
        ClientMessage::Action(ActionEnvelope {
            request_id,
            name: "setPrivate".to_string(),
            args,
        })
    } else {
        args.insert(
            "path".to_string(),
            FieldValue::Str(format!("players.{seat}.x")),
        );
        args.insert(
            "value".to_string(),
            FieldValue::Float(rng.gen_range(0.0..512.0)),
        );
        ClientMessage::Action(ActionEnvelope {
            request_id,
            name: "set".to_string(),
            args,
        })
    }
}
