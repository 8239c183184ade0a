use smallvec::SmallVec;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::metrics::SyncMetrics;
use crate::room::encoder::EncodingPipeline;
use crate::room::membership::{MembershipCoordinator, MembershipStamp};
use crate::store::StateStore;
use crate::transport::Transport;
use crate::wire::decode::SessionPhase;
use crate::wire::protocol::{ClientId, EventBody, PlayerId, SessionId};

/// Where a queued event goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// Every joined session, riding the tick's combined broadcast frame.
    Broadcast,
    /// One player's current session, as a standalone serverEvent frame.
    Player(PlayerId),
    /// One exact session, stampless; the event dies with the session.
    Session(SessionId),
    /// Whichever session the client currently holds, resolved at delivery
    /// so a reconnect under a new session still receives it.
    Client(ClientId),
}

/// An event waiting for the next tick.
#[derive(Debug)]
struct PendingEvent {
    target: EventTarget,
    body: EventBody,
    /// Membership proof captured at enqueue for player targets; verified
    /// again at delivery.
    stamp: Option<MembershipStamp>,
}

/// Per-tick frame scheduling for one room.
///
/// Owns the tick counter, the pending-event queue and the firstSync
/// schedule. `run_tick` is synchronous and runs to completion inside the
/// room task, so membership cannot change between the stamp check and the
/// send.
#[derive(Default)]
pub struct SyncOrchestrator {
    tick: u64,
    pending_events: Vec<PendingEvent>,
    pending_first_sync: Vec<(SessionId, PlayerId)>,
}

impl SyncOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn pending_event_count(&self) -> usize {
        self.pending_events.len()
    }

    pub fn queue_broadcast_event(&mut self, body: EventBody) {
        self.pending_events.push(PendingEvent {
            target: EventTarget::Broadcast,
            body,
            stamp: None,
        });
    }

    /// Queue an event for the player bound under `stamp`. If the player
    /// rebinds or leaves before the next tick, the event dies quietly.
    pub fn queue_player_event(&mut self, body: EventBody, stamp: MembershipStamp) {
        self.pending_events.push(PendingEvent {
            target: EventTarget::Player(stamp.player_id),
            body,
            stamp: Some(stamp),
        });
    }

    /// Queue an event for one exact session. No stamp is involved; a rebind
    /// does not affect it, but the event dies if the session disconnects.
    pub fn queue_session_event(&mut self, body: EventBody, session: SessionId) {
        self.pending_events.push(PendingEvent {
            target: EventTarget::Session(session),
            body,
            stamp: None,
        });
    }

    /// Queue an event for the client's current session, resolved at
    /// delivery time so it follows the client across a reconnect.
    pub fn queue_client_event(&mut self, body: EventBody, client: ClientId) {
        self.pending_events.push(PendingEvent {
            target: EventTarget::Client(client),
            body,
            stamp: None,
        });
    }

    /// Mark a session whose join completed since the last tick; it receives
    /// full snapshot frames on the next tick instead of incrementals.
    pub fn schedule_first_sync(&mut self, session_id: SessionId, player_id: PlayerId) {
        self.pending_first_sync.retain(|&(session, _)| session != session_id);
        self.pending_first_sync.push((session_id, player_id));
    }

    pub fn run_tick(
        &mut self,
        coordinator: &MembershipCoordinator,
        store: &mut dyn StateStore,
        pipeline: &mut EncodingPipeline,
        transport: &dyn Transport,
        metrics: &SyncMetrics,
    ) {
        self.tick += 1;
        let tick = self.tick;

        // Partition pending events. A player event whose stamp no longer
        // matches the player's current membership version was scheduled for
        // a binding that has since ended; it must not reach the session now
        // holding that identity. Session and client targets carry no stamp:
        // they die with their session instead.
        let mut broadcast_events = Vec::new();
        let mut player_events: SmallVec<[(PlayerId, EventBody); 8]> = SmallVec::new();
        let mut direct_events: SmallVec<[(SessionId, EventBody); 4]> = SmallVec::new();
        for event in self.pending_events.drain(..) {
            match (event.target, event.stamp) {
                (EventTarget::Broadcast, _) => broadcast_events.push(event.body),
                (EventTarget::Player(player), Some(stamp))
                    if coordinator.is_current(&stamp) =>
                {
                    player_events.push((player, event.body));
                }
                (EventTarget::Player(player), _) => {
                    metrics.stale_events_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(player = %player, tick, "event dropped, membership changed since enqueue");
                }
                (EventTarget::Session(session), _) => {
                    if coordinator.phase_of(session) == Some(SessionPhase::Joined) {
                        direct_events.push((session, event.body));
                    } else {
                        metrics.stale_events_dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(session, tick, "event dropped, session gone or not joined");
                    }
                }
                (EventTarget::Client(client), _) => {
                    let session = coordinator
                        .session_by_client(client)
                        .filter(|&session| {
                            coordinator.phase_of(session) == Some(SessionPhase::Joined)
                        });
                    match session {
                        Some(session) => direct_events.push((session, event.body)),
                        None => {
                            metrics.stale_events_dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(client = %client, tick, "event dropped, client no longer connected");
                        }
                    }
                }
            }
        }

        // Joins completed since the previous tick and still bound; a rebind
        // in between rescheduled the new session already.
        let first_sync: SmallVec<[(SessionId, PlayerId); 4]> = self
            .pending_first_sync
            .drain(..)
            .filter(|&(session, player)| coordinator.player_of(session) == Some(player))
            .collect();

        let bound = coordinator.bound_players();

        // The broadcast frame is encoded once per tick no matter how many
        // sessions receive it.
        let broadcast_diff = store.compute_broadcast_diff();
        match pipeline.encode_broadcast(tick, &broadcast_diff, broadcast_events) {
            Ok(Some(frame)) => {
                record_skips(metrics, frame.skipped);
                let recipients: SmallVec<[SessionId; 16]> = bound
                    .iter()
                    .map(|&(_, session)| session)
                    .filter(|&session| !first_sync.iter().any(|&(s, _)| s == session))
                    .collect();
                if !recipients.is_empty() {
                    metrics.frames_broadcast.fetch_add(1, Ordering::Relaxed);
                    metrics.bytes_sent.fetch_add(
                        (frame.bytes.len() * recipients.len()) as u64,
                        Ordering::Relaxed,
                    );
                    transport.broadcast(&recipients, frame.bytes);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(tick, error = %err, "broadcast frame encode failed"),
        }

        // Full snapshots for fresh joins. Their accumulated per-player diff
        // is drained and discarded; the snapshot already contains it.
        for &(session, player) in &first_sync {
            let _ = store.compute_per_player_diff(player);
            let snapshot = store.full_snapshot(player);
            match pipeline.encode_first_sync(player, tick, &snapshot) {
                Ok(frames) => {
                    record_skips(metrics, frames.broadcast.skipped);
                    let mut sent = frames.broadcast.bytes.len();
                    transport.send(session, frames.broadcast.bytes);
                    if let Some(private) = frames.private {
                        record_skips(metrics, private.skipped);
                        sent += private.bytes.len();
                        transport.send(session, private.bytes);
                    }
                    metrics.first_syncs.fetch_add(1, Ordering::Relaxed);
                    metrics.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                    debug!(session, player = %player, tick, "first sync delivered");
                }
                Err(err) => {
                    warn!(session, player = %player, tick, error = %err, "first sync encode failed")
                }
            }
        }

        // Per-player incrementals for everyone else.
        for &(player, session) in &bound {
            if first_sync.iter().any(|&(s, _)| s == session) {
                continue;
            }
            let diff = store.compute_per_player_diff(player);
            match pipeline.encode_per_player(player, tick, &diff) {
                Ok(Some(frame)) => {
                    record_skips(metrics, frame.skipped);
                    metrics.frames_targeted.fetch_add(1, Ordering::Relaxed);
                    metrics.bytes_sent.fetch_add(frame.bytes.len() as u64, Ordering::Relaxed);
                    transport.send(session, frame.bytes);
                }
                Ok(None) => {}
                Err(err) => warn!(player = %player, tick, error = %err, "player frame encode failed"),
            }
        }

        // Surviving targeted events, one frame each, after the state frames
        // of the same tick.
        for (player, body) in player_events {
            let Some(session) = coordinator.session_of(player) else {
                debug!(player = %player, tick, "event target unbound after stamp check");
                continue;
            };
            match pipeline.encode_server_event(body) {
                Ok(bytes) => {
                    metrics.frames_targeted.fetch_add(1, Ordering::Relaxed);
                    metrics.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    transport.send(session, bytes);
                }
                Err(err) => warn!(player = %player, tick, error = %err, "event encode failed"),
            }
        }
        for (session, body) in direct_events {
            match pipeline.encode_server_event(body) {
                Ok(bytes) => {
                    metrics.frames_targeted.fetch_add(1, Ordering::Relaxed);
                    metrics.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    transport.send(session, bytes);
                }
                Err(err) => warn!(session, tick, error = %err, "event encode failed"),
            }
        }
    }
}

fn record_skips(metrics: &SyncMetrics, skipped: usize) {
    if skipped > 0 {
        metrics.fields_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }
}
