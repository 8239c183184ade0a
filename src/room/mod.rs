pub mod encoder;
pub mod membership;
pub mod sync;

pub use sync::EventTarget;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::metrics::SyncMetrics;
use crate::store::StateStore;
use crate::transport::{CloseReason, Transport};
use crate::wire::codec::encode_server_frame;
use crate::wire::decode::{decode_inbound, SessionPhase};
use crate::wire::protocol::{
    ClientId, ClientMessage, EventBody, JoinError, JoinRequest, JoinResponse, RoomId, ServerFrame,
    SessionId, WireFormat,
};
use encoder::EncodingPipeline;
use membership::{MembershipCoordinator, Transition, TransitionQueue, TransitionResult};
use sync::SyncOrchestrator;

/// Everything a room task reacts to.
#[derive(Debug)]
pub enum RoomCommand {
    Connect {
        session_id: SessionId,
        client_id: ClientId,
    },
    Disconnect {
        session_id: SessionId,
    },
    Message {
        session_id: SessionId,
        bytes: Vec<u8>,
    },
    Emit {
        target: EventTarget,
        body: EventBody,
    },
    Tick,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle to a running room task. Every method is
/// fire-and-forget; commands sent after the room stopped are dropped.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn on_connect(&self, session_id: SessionId, client_id: ClientId) {
        let _ = self.tx.send(RoomCommand::Connect {
            session_id,
            client_id,
        });
    }

    pub fn on_disconnect(&self, session_id: SessionId) {
        let _ = self.tx.send(RoomCommand::Disconnect { session_id });
    }

    pub fn on_message(&self, session_id: SessionId, bytes: Vec<u8>) {
        let _ = self.tx.send(RoomCommand::Message { session_id, bytes });
    }

    pub fn emit_event(&self, target: EventTarget, body: EventBody) {
        let _ = self.tx.send(RoomCommand::Emit { target, body });
    }

    /// Advance the room by one tick. Used by external drivers; rooms spawned
    /// with `spawn_with_ticker` tick themselves.
    pub fn tick(&self) {
        let _ = self.tx.send(RoomCommand::Tick);
    }

    /// Ask the room to close every session and stop. The returned receiver
    /// resolves once teardown finished (with an error if the room is
    /// already gone).
    pub fn shutdown(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::Shutdown { done });
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One land instance: a single task owning all mutable room state.
///
/// Commands arrive on an unbounded channel and are processed to completion
/// in receipt order, so nothing here needs a lock. Membership transitions go
/// through the FIFO queue and resolve in submission order; ticks, messages
/// and events interleave with them at command granularity only.
pub struct Room {
    room_id: RoomId,
    max_players: usize,
    coordinator: MembershipCoordinator,
    transitions: TransitionQueue,
    orchestrator: SyncOrchestrator,
    pipeline: EncodingPipeline,
    store: Box<dyn StateStore>,
    transport: Arc<dyn Transport>,
    metrics: Arc<SyncMetrics>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
}

impl Room {
    fn build(
        room_id: RoomId,
        config: &ServerConfig,
        store: Box<dyn StateStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<SyncMetrics>,
    ) -> (Self, RoomHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let room = Self {
            room_id,
            max_players: config.max_sessions_per_room,
            coordinator: MembershipCoordinator::new(),
            transitions: TransitionQueue::new(),
            orchestrator: SyncOrchestrator::new(),
            pipeline: EncodingPipeline::new(config.wire_format),
            store,
            transport,
            metrics,
            commands,
        };
        (room, RoomHandle { room_id, tx })
    }

    /// Spawn an externally ticked room task.
    pub fn spawn(
        room_id: RoomId,
        config: &ServerConfig,
        store: Box<dyn StateStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<SyncMetrics>,
    ) -> RoomHandle {
        let (room, handle) = Self::build(room_id, config, store, transport, metrics);
        tokio::spawn(room.run());
        handle
    }

    /// Spawn a room plus an interval task driving its ticks at the
    /// configured rate. Missed ticks are skipped, not bunched.
    pub fn spawn_with_ticker(
        room_id: RoomId,
        config: &ServerConfig,
        store: Box<dyn StateStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<SyncMetrics>,
    ) -> RoomHandle {
        let handle = Self::spawn(room_id, config, store, transport, metrics);
        let ticker = handle.clone();
        let period = config.tick_duration();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if ticker.is_closed() {
                    break;
                }
                ticker.tick();
            }
        });
        handle
    }

    async fn run(mut self) {
        self.metrics.rooms_active.fetch_add(1, Ordering::Relaxed);
        info!(room = %self.room_id, format = %self.pipeline.format(), "room started");
        loop {
            match self.commands.recv().await {
                Some(command) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                // Every handle dropped; close out the same way.
                None => {
                    self.teardown();
                    break;
                }
            }
        }
        self.metrics.rooms_active.fetch_sub(1, Ordering::Relaxed);
        info!(room = %self.room_id, "room stopped");
    }

    /// Process one command; returns false when the room should stop.
    fn handle_command(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Connect {
                session_id,
                client_id,
            } => self.handle_connect(session_id, client_id),
            RoomCommand::Disconnect { session_id } => {
                self.transitions
                    .submit_detached(Transition::Leave { session_id });
                self.drain_transitions();
            }
            RoomCommand::Message { session_id, bytes } => self.handle_message(session_id, &bytes),
            RoomCommand::Emit { target, body } => self.handle_emit(target, body),
            RoomCommand::Tick => self.run_tick(),
            RoomCommand::Shutdown { done } => {
                self.teardown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn handle_connect(&mut self, session_id: SessionId, client_id: ClientId) {
        if self.coordinator.session(session_id).is_some() {
            warn!(room = %self.room_id, session = session_id, "duplicate connect ignored");
            return;
        }
        self.coordinator.register_session(session_id, client_id);
        self.metrics.sessions_active.fetch_add(1, Ordering::Relaxed);
        debug!(room = %self.room_id, session = session_id, client = %client_id, "session connected");
    }

    fn handle_message(&mut self, session_id: SessionId, bytes: &[u8]) {
        self.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let Some(phase) = self.coordinator.phase_of(session_id) else {
            debug!(room = %self.room_id, session = session_id, "message from unknown session dropped");
            return;
        };
        match decode_inbound(bytes, phase, self.pipeline.format()) {
            Ok(ClientMessage::Join(request)) => {
                let _ = self.transitions.submit(Transition::Join {
                    session_id,
                    request,
                });
                self.drain_transitions();
            }
            Ok(ClientMessage::Action(envelope)) => {
                let Some(player_id) = self.coordinator.player_of(session_id) else {
                    warn!(room = %self.room_id, session = session_id, action = %envelope.name,
                          "action before join dropped");
                    return;
                };
                match self.store.apply_action(player_id, envelope) {
                    Ok(()) => {
                        self.metrics.actions_applied.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(room = %self.room_id, player = %player_id, error = %err,
                              "action rejected");
                    }
                }
            }
            Ok(ClientMessage::ClientEvent(event)) => {
                let Some(player_id) = self.coordinator.player_of(session_id) else {
                    warn!(room = %self.room_id, session = session_id, event = %event.name,
                          "client event before join dropped");
                    return;
                };
                self.store.apply_client_event(player_id, event);
            }
            Err(err) => {
                self.metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(room = %self.room_id, session = session_id, error = %err,
                      "inbound frame discarded");
            }
        }
    }

    fn handle_emit(&mut self, target: EventTarget, body: EventBody) {
        match target {
            EventTarget::Broadcast => {
                self.metrics.events_enqueued.fetch_add(1, Ordering::Relaxed);
                self.orchestrator.queue_broadcast_event(body);
            }
            EventTarget::Player(player_id) => match self.coordinator.current_stamp(player_id) {
                Some(stamp) => {
                    self.metrics.events_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.orchestrator.queue_player_event(body, stamp);
                }
                None => {
                    self.metrics
                        .stale_events_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(room = %self.room_id, player = %player_id,
                           "event for unbound player dropped");
                }
            },
            EventTarget::Session(session_id) => {
                if self.coordinator.session(session_id).is_some() {
                    self.metrics.events_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.orchestrator.queue_session_event(body, session_id);
                } else {
                    self.metrics
                        .stale_events_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(room = %self.room_id, session = session_id,
                           "event for unknown session dropped");
                }
            }
            EventTarget::Client(client_id) => {
                if self.coordinator.session_by_client(client_id).is_some() {
                    self.metrics.events_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.orchestrator.queue_client_event(body, client_id);
                } else {
                    self.metrics
                        .stale_events_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(room = %self.room_id, client = %client_id,
                           "event for unknown client dropped");
                }
            }
        }
    }

    fn run_tick(&mut self) {
        let started = Instant::now();
        self.orchestrator.run_tick(
            &self.coordinator,
            self.store.as_mut(),
            &mut self.pipeline,
            self.transport.as_ref(),
            &self.metrics,
        );
        self.metrics.record_tick_time(started.elapsed());
    }

    /// Apply queued transitions in submission order, each one to completion
    /// before the next.
    fn drain_transitions(&mut self) {
        while let Some((transition, done)) = self.transitions.pop() {
            match transition {
                Transition::Join {
                    session_id,
                    request,
                } => {
                    let result = self.apply_join(session_id, request);
                    done.resolve(result);
                }
                Transition::Leave { session_id } => {
                    let result = self.apply_leave(session_id);
                    done.resolve(result);
                }
            }
        }
    }

    fn apply_join(&mut self, session_id: SessionId, request: JoinRequest) -> TransitionResult {
        match self.coordinator.phase_of(session_id) {
            // Disconnected before its turn in the queue.
            None => return TransitionResult::Ignored,
            Some(SessionPhase::Joined) => {
                warn!(room = %self.room_id, session = session_id,
                      "join on already joined session ignored");
                return TransitionResult::Ignored;
            }
            Some(SessionPhase::AwaitingJoin) => {}
        }

        if request.player_id.is_nil() {
            self.reject_join(session_id, &request, "invalid_request", "playerID is required");
            return TransitionResult::Rejected {
                code: "invalid_request".to_string(),
            };
        }

        // A rejoin replaces an existing binding and never grows the room.
        let rejoining = self.coordinator.session_of(request.player_id).is_some();
        if !rejoining && self.coordinator.bound_player_count() >= self.max_players {
            self.reject_join(session_id, &request, "room_full", "no free player slot");
            return TransitionResult::Rejected {
                code: "room_full".to_string(),
            };
        }

        let Some(outcome) = self.coordinator.bind(session_id, &request) else {
            return TransitionResult::Ignored;
        };

        if let Some(displaced) = outcome.displaced {
            self.metrics.duplicate_kicks.fetch_add(1, Ordering::Relaxed);
            info!(room = %self.room_id, player = %request.player_id,
                  old_session = displaced, new_session = session_id,
                  "duplicate login, closing old session");
            self.transport
                .close_session(displaced, CloseReason::DuplicateLogin);
        }
        // The new binding starts from an empty per-player key table; its
        // firstSync will declare everything it needs.
        self.pipeline.reset_player(request.player_id);

        // The join response always travels as portable text, whatever the
        // steady-state format; the client commits to the negotiated format
        // only after reading it.
        let response = ServerFrame::JoinResponse(JoinResponse {
            request_id: request.request_id,
            player_id: request.player_id,
            player_slot: outcome.slot,
            encoding: self.pipeline.format(),
        });
        match encode_server_frame(&response, WireFormat::Text) {
            Ok(bytes) => self.transport.send(session_id, bytes),
            Err(err) => {
                warn!(room = %self.room_id, session = session_id, error = %err,
                      "join response encode failed");
            }
        }
        // Once the response bytes are handed down the session is joined;
        // the flip never reverts.
        self.coordinator.mark_joined(session_id);
        self.orchestrator
            .schedule_first_sync(session_id, request.player_id);

        if !rejoining {
            self.metrics.players_bound.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.joins_total.fetch_add(1, Ordering::Relaxed);
        info!(room = %self.room_id, session = session_id, player = %request.player_id,
              slot = outcome.slot, rejoin = outcome.rejoin, "player joined");

        TransitionResult::Joined {
            stamp: outcome.stamp,
            slot: outcome.slot,
        }
    }

    fn apply_leave(&mut self, session_id: SessionId) -> TransitionResult {
        let Some(released) = self.coordinator.release_session(session_id) else {
            return TransitionResult::Ignored;
        };
        self.metrics.sessions_active.fetch_sub(1, Ordering::Relaxed);
        match released.player_id {
            Some(player_id) if released.unbound => {
                self.metrics.players_bound.fetch_sub(1, Ordering::Relaxed);
                self.metrics.leaves_total.fetch_add(1, Ordering::Relaxed);
                info!(room = %self.room_id, session = session_id, player = %player_id,
                      "player left");
            }
            _ => {
                debug!(room = %self.room_id, session = session_id, "session released");
            }
        }
        TransitionResult::Left
    }

    fn reject_join(
        &self,
        session_id: SessionId,
        request: &JoinRequest,
        code: &str,
        message: &str,
    ) {
        self.metrics.join_errors.fetch_add(1, Ordering::Relaxed);
        warn!(room = %self.room_id, session = session_id, player = %request.player_id,
              code, "join rejected");
        let frame = ServerFrame::JoinError(JoinError {
            request_id: request.request_id,
            code: code.to_string(),
            message: message.to_string(),
        });
        // Error frames are portable text too; the session never negotiated.
        match encode_server_frame(&frame, WireFormat::Text) {
            Ok(bytes) => self.transport.send(session_id, bytes),
            Err(err) => {
                warn!(room = %self.room_id, session = session_id, error = %err,
                      "join error encode failed");
            }
        }
    }

    /// Close every session with `room_closed`. Closes are independent
    /// fire-and-forget calls; one dead connection cannot stall the rest.
    fn teardown(&mut self) {
        let sessions = self.coordinator.session_ids();
        info!(room = %self.room_id, sessions = sessions.len(), "room closing");
        for session_id in sessions {
            self.transport
                .close_session(session_id, CloseReason::RoomClosed);
            if let Some(released) = self.coordinator.release_session(session_id) {
                self.metrics.sessions_active.fetch_sub(1, Ordering::Relaxed);
                if released.unbound {
                    self.metrics.players_bound.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }
}
