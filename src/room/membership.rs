use std::collections::{BTreeSet, VecDeque};

use hashbrown::HashMap;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;

use crate::wire::decode::SessionPhase;
use crate::wire::protocol::{ClientId, JoinRequest, PlayerId, SessionId};

/// Versioned proof of membership captured when work is scheduled on behalf
/// of a player. Exactly one version per player is current at any instant;
/// both bind and unbind allocate a new version, so a stamp from before either
/// can never verify again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStamp {
    pub player_id: PlayerId,
    pub version: u64,
}

/// Connection-level state for one live session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub client_id: ClientId,
    pub player_id: Option<PlayerId>,
    pub phase: SessionPhase,
}

/// Durable per-player state, kept for the room's lifetime so reconnects see
/// the same slot.
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub slot: u16,
    pub version: u64,
    pub session: Option<SessionId>,
    pub account_key: Option<String>,
    pub display_name: Option<String>,
}

/// Result of binding a session to a player.
#[derive(Debug, Clone, Copy)]
pub struct BindOutcome {
    pub stamp: MembershipStamp,
    pub slot: u16,
    /// Previously bound session for the same player, now implicitly stale.
    /// The caller owes it a forced close.
    pub displaced: Option<SessionId>,
    /// True when the player had joined this room before.
    pub rejoin: bool,
}

/// What a session release undid.
#[derive(Debug, Clone)]
pub struct ReleasedSession {
    pub client_id: ClientId,
    pub player_id: Option<PlayerId>,
    /// True when this session was the player's current binding and the
    /// release bumped the membership version.
    pub unbound: bool,
}

/// Identity maps and membership versioning for one room.
///
/// Owned by the room task; all methods are synchronous and none of them
/// fail in a way the caller must surface to clients.
#[derive(Default)]
pub struct MembershipCoordinator {
    sessions: FxHashMap<SessionId, SessionRecord>,
    clients: HashMap<ClientId, SessionId>,
    players: HashMap<PlayerId, PlayerRecord>,
}

impl MembershipCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly connected session. Called before any message from it
    /// is processed.
    pub fn register_session(&mut self, session_id: SessionId, client_id: ClientId) {
        self.clients.insert(client_id, session_id);
        self.sessions.insert(
            session_id,
            SessionRecord {
                client_id,
                player_id: None,
                phase: SessionPhase::AwaitingJoin,
            },
        );
    }

    /// Forget a disconnected session. If it was the player's current binding
    /// the release performs the unbind (new version); a stale release of an
    /// already displaced session leaves the player's new binding untouched.
    pub fn release_session(&mut self, session_id: SessionId) -> Option<ReleasedSession> {
        let record = self.sessions.remove(&session_id)?;
        if self.clients.get(&record.client_id) == Some(&session_id) {
            self.clients.remove(&record.client_id);
        }
        let mut unbound = false;
        if let Some(player_id) = record.player_id {
            unbound = self.unbind(session_id, player_id);
        }
        Some(ReleasedSession {
            client_id: record.client_id,
            player_id: record.player_id,
            unbound,
        })
    }

    /// Bind a session to a player identity, displacing any previous binding
    /// for the same player ("kick old"). Allocates the next membership
    /// version. Returns `None` for a session that was never registered.
    pub fn bind(&mut self, session_id: SessionId, request: &JoinRequest) -> Option<BindOutcome> {
        if !self.sessions.contains_key(&session_id) {
            return None;
        }
        let player_id = request.player_id;
        let rejoin = self.players.contains_key(&player_id);
        let slot = match self.players.get(&player_id) {
            Some(record) => record.slot,
            None => self.lowest_free_slot(),
        };

        let record = self.players.entry(player_id).or_insert_with(|| PlayerRecord {
            slot,
            version: 0,
            session: None,
            account_key: None,
            display_name: None,
        });
        let displaced = record.session.take().filter(|&old| old != session_id);
        record.version += 1;
        record.session = Some(session_id);
        if request.account_key.is_some() {
            record.account_key = request.account_key.clone();
        }
        if request.display_name.is_some() {
            record.display_name = request.display_name.clone();
        }
        let stamp = MembershipStamp {
            player_id,
            version: record.version,
        };

        if let Some(old) = displaced {
            // The old session keeps running until the transport closes it;
            // detach it so its eventual release is pure cleanup.
            if let Some(old_record) = self.sessions.get_mut(&old) {
                old_record.player_id = None;
            }
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.player_id = Some(player_id);
        }

        Some(BindOutcome {
            stamp,
            slot,
            displaced,
            rejoin,
        })
    }

    /// Remove the session's binding and bump the player's version, but only
    /// when the session is still the current binding. Returns whether the
    /// version moved.
    pub fn unbind(&mut self, session_id: SessionId, player_id: PlayerId) -> bool {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.player_id = None;
        }
        match self.players.get_mut(&player_id) {
            Some(record) if record.session == Some(session_id) => {
                record.session = None;
                record.version += 1;
                true
            }
            _ => false,
        }
    }

    /// Verify a stamp against the player's current membership version.
    pub fn is_current(&self, stamp: &MembershipStamp) -> bool {
        self.players
            .get(&stamp.player_id)
            .map(|record| record.version == stamp.version)
            .unwrap_or(false)
    }

    /// Stamp for the player's current binding, if they are bound.
    pub fn current_stamp(&self, player_id: PlayerId) -> Option<MembershipStamp> {
        let record = self.players.get(&player_id)?;
        record.session?;
        Some(MembershipStamp {
            player_id,
            version: record.version,
        })
    }

    pub fn session_of(&self, player_id: PlayerId) -> Option<SessionId> {
        self.players.get(&player_id).and_then(|record| record.session)
    }

    pub fn player_of(&self, session_id: SessionId) -> Option<PlayerId> {
        self.sessions.get(&session_id).and_then(|record| record.player_id)
    }

    pub fn session_by_client(&self, client_id: ClientId) -> Option<SessionId> {
        self.clients.get(&client_id).copied()
    }

    pub fn phase_of(&self, session_id: SessionId) -> Option<SessionPhase> {
        self.sessions.get(&session_id).map(|record| record.phase)
    }

    /// Flip a session to joined. Called only after the join response bytes
    /// were handed to the transport; the flip never reverts.
    pub fn mark_joined(&mut self, session_id: SessionId) {
        if let Some(record) = self.sessions.get_mut(&session_id) {
            record.phase = SessionPhase::Joined;
        }
    }

    pub fn session(&self, session_id: SessionId) -> Option<&SessionRecord> {
        self.sessions.get(&session_id)
    }

    pub fn player(&self, player_id: PlayerId) -> Option<&PlayerRecord> {
        self.players.get(&player_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Currently bound players with their sessions, ordered by slot so the
    /// per-tick pass is deterministic.
    pub fn bound_players(&self) -> Vec<(PlayerId, SessionId)> {
        let mut bound: Vec<(u16, PlayerId, SessionId)> = self
            .players
            .iter()
            .filter_map(|(&player_id, record)| {
                record.session.map(|session| (record.slot, player_id, session))
            })
            .collect();
        bound.sort_by_key(|&(slot, _, _)| slot);
        bound
            .into_iter()
            .map(|(_, player_id, session)| (player_id, session))
            .collect()
    }

    pub fn bound_player_count(&self) -> usize {
        self.players.values().filter(|record| record.session.is_some()).count()
    }

    fn lowest_free_slot(&self) -> u16 {
        let used: BTreeSet<u16> = self.players.values().map(|record| record.slot).collect();
        let mut slot = 0u16;
        while used.contains(&slot) {
            slot += 1;
        }
        slot
    }
}

/// A membership transition waiting its turn.
#[derive(Debug)]
pub enum Transition {
    Join {
        session_id: SessionId,
        request: JoinRequest,
    },
    Leave {
        session_id: SessionId,
    },
}

/// How an applied transition resolved, delivered on the completion handle.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    Joined { stamp: MembershipStamp, slot: u16 },
    Rejected { code: String },
    Left,
    /// Session disappeared before the transition ran.
    Ignored,
}

struct QueuedTransition {
    transition: Transition,
    done: Option<oneshot::Sender<TransitionResult>>,
}

/// FIFO queue for join/leave transitions. The room drains it after every
/// submission, applying each transition to completion before the next, so
/// transitions resolve strictly in submission order and never interleave.
/// `submit` returns a completion handle the submitter can await.
#[derive(Default)]
pub struct TransitionQueue {
    queue: VecDeque<QueuedTransition>,
}

impl TransitionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, transition: Transition) -> oneshot::Receiver<TransitionResult> {
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(QueuedTransition {
            transition,
            done: Some(tx),
        });
        rx
    }

    /// Submit without a completion handle (disconnect paths that nobody
    /// awaits).
    pub fn submit_detached(&mut self, transition: Transition) {
        self.queue.push_back(QueuedTransition {
            transition,
            done: None,
        });
    }

    /// Next transition in submission order, paired with a callback that
    /// resolves its completion handle.
    pub fn pop(&mut self) -> Option<(Transition, CompletionHandle)> {
        self.queue.pop_front().map(|queued| {
            (
                queued.transition,
                CompletionHandle {
                    done: queued.done,
                },
            )
        })
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Resolves one submitted transition. Dropping it unresolved cancels the
/// submitter's receiver.
pub struct CompletionHandle {
    done: Option<oneshot::Sender<TransitionResult>>,
}

impl CompletionHandle {
    pub fn resolve(mut self, result: TransitionResult) {
        if let Some(tx) = self.done.take() {
            let _ = tx.send(result);
        }
    }
}
