use hashbrown::HashMap;
use tracing::warn;

use crate::store::{Diff, Snapshot};
use crate::wire::codec::encode_server_frame;
use crate::wire::keytable::KeyTable;
use crate::wire::protocol::{
    EncodeError, EventBody, FieldValue, PlayerId, ServerFrame, StateUpdateFrame,
    StateUpdateWithEvents, WireFormat,
};

/// One encoded outbound frame plus how many items were dropped from it.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub skipped: usize,
}

/// The firstSync pair for one session: a broadcast-scope full frame, and a
/// per-player full frame when the player has private state.
#[derive(Debug, Clone)]
pub struct FirstSyncFrames {
    pub broadcast: EncodedFrame,
    pub private: Option<EncodedFrame>,
}

/// Builds outbound state frames for one room: owns the key tables, enforces
/// the broadcast/per-player frame split, and encodes in the room's
/// negotiated format.
///
/// The broadcast table is shared by every session and only grows; per-player
/// tables are dropped when the player rebinds, so a reconnecting client
/// starts from a clean table and its firstSync re-declares everything.
pub struct EncodingPipeline {
    format: WireFormat,
    broadcast_keys: KeyTable,
    player_keys: HashMap<PlayerId, KeyTable>,
}

impl EncodingPipeline {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            broadcast_keys: KeyTable::new(),
            player_keys: HashMap::new(),
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// The single broadcast frame for one tick, or `None` when there is
    /// nothing to say. Events ride in the combined frame; a tick with events
    /// but an empty diff still produces one combined frame.
    pub fn encode_broadcast(
        &mut self,
        tick: u64,
        diff: &Diff,
        events: Vec<EventBody>,
    ) -> Result<Option<EncodedFrame>, EncodeError> {
        if diff.is_empty() && events.is_empty() {
            return Ok(None);
        }
        let mut skipped = 0;
        let update = build_update(&mut self.broadcast_keys, tick, diff, self.format, &mut skipped);
        let events = filter_events(events, self.format, tick, &mut skipped);
        let frame = if events.is_empty() {
            ServerFrame::StateUpdate(update)
        } else {
            ServerFrame::StateUpdateWithEvents(StateUpdateWithEvents { update, events })
        };
        let bytes = encode_server_frame(&frame, self.format)?;
        Ok(Some(EncodedFrame { bytes, skipped }))
    }

    /// Per-player incremental frame; only emitted when the diff is
    /// non-empty. Targeted events never ride here, they go out as separate
    /// serverEvent frames.
    pub fn encode_per_player(
        &mut self,
        player: PlayerId,
        tick: u64,
        diff: &Diff,
    ) -> Result<Option<EncodedFrame>, EncodeError> {
        if diff.is_empty() {
            return Ok(None);
        }
        let table = self.player_keys.entry(player).or_default();
        let mut skipped = 0;
        let update = build_update(table, tick, diff, self.format, &mut skipped);
        let bytes = encode_server_frame(&ServerFrame::StateUpdate(update), self.format)?;
        Ok(Some(EncodedFrame { bytes, skipped }))
    }

    /// Full-resync frames for a session that just completed the join
    /// handshake. Full frames carry the complete key directory of their
    /// scope's table, so the receiver can resolve any id a later incremental
    /// frame references, including keys whose fields are currently absent.
    pub fn encode_first_sync(
        &mut self,
        player: PlayerId,
        tick: u64,
        snapshot: &Snapshot,
    ) -> Result<FirstSyncFrames, EncodeError> {
        let mut skipped = 0;
        let update = build_full(
            &mut self.broadcast_keys,
            tick,
            &snapshot.broadcast,
            self.format,
            &mut skipped,
        );
        let bytes = encode_server_frame(&ServerFrame::StateUpdate(update), self.format)?;
        let broadcast = EncodedFrame { bytes, skipped };

        let private = if snapshot.private.is_empty() {
            None
        } else {
            let table = self.player_keys.entry(player).or_default();
            let mut skipped = 0;
            let update = build_full(table, tick, &snapshot.private, self.format, &mut skipped);
            let bytes = encode_server_frame(&ServerFrame::StateUpdate(update), self.format)?;
            Some(EncodedFrame { bytes, skipped })
        };

        Ok(FirstSyncFrames { broadcast, private })
    }

    /// One targeted event frame.
    pub fn encode_server_event(&self, event: EventBody) -> Result<Vec<u8>, EncodeError> {
        encode_server_frame(&ServerFrame::ServerEvent(event), self.format)
    }

    /// Drop the player's key table. Called when the player rebinds so the
    /// new session never sees ids from a table it does not have.
    pub fn reset_player(&mut self, player: PlayerId) {
        self.player_keys.remove(&player);
    }

    pub fn broadcast_key_count(&self) -> usize {
        self.broadcast_keys.len()
    }
}

/// Whether a value survives the text formats (binary takes everything).
fn text_encodable(value: &FieldValue) -> bool {
    match value {
        FieldValue::Float(f) => f.is_finite(),
        FieldValue::List(items) => items.iter().all(text_encodable),
        FieldValue::Map(entries) => entries.values().all(text_encodable),
        _ => true,
    }
}

fn build_update(
    table: &mut KeyTable,
    tick: u64,
    diff: &Diff,
    format: WireFormat,
    skipped: &mut usize,
) -> StateUpdateFrame {
    let mut keys = Vec::new();
    let mut values = std::collections::BTreeMap::new();
    for (path, value) in &diff.changed {
        if format != WireFormat::Binary && !text_encodable(value) {
            warn!(tick, path = %path, "skipping field with no text representation");
            *skipped += 1;
            continue;
        }
        let (key, is_new) = table.intern(path);
        if is_new {
            keys.push((path.clone(), key));
        }
        values.insert(key, value.clone());
    }
    // A removal of a path that was never declared has nothing to reference;
    // the receiver never saw the field.
    let mut removed: Vec<u32> = diff
        .removed
        .iter()
        .filter_map(|path| table.get(path))
        .collect();
    removed.sort_unstable();
    StateUpdateFrame {
        tick,
        full: false,
        keys,
        values,
        removed,
    }
}

fn build_full(
    table: &mut KeyTable,
    tick: u64,
    entries: &std::collections::BTreeMap<String, FieldValue>,
    format: WireFormat,
    skipped: &mut usize,
) -> StateUpdateFrame {
    let mut values = std::collections::BTreeMap::new();
    for (path, value) in entries {
        if format != WireFormat::Binary && !text_encodable(value) {
            warn!(tick, path = %path, "skipping field with no text representation");
            *skipped += 1;
            continue;
        }
        let (key, _) = table.intern(path);
        values.insert(key, value.clone());
    }
    // Full frames carry the scope's whole key directory, not only the keys
    // present in the snapshot. Incremental frames never re-declare an id
    // once assigned, so the receiver needs every assignment up front.
    let keys = (0..table.len() as u32)
        .filter_map(|key| table.path_of(key).map(|path| (path.to_string(), key)))
        .collect();
    StateUpdateFrame {
        tick,
        full: true,
        keys,
        values,
        removed: Vec::new(),
    }
}

fn filter_events(
    events: Vec<EventBody>,
    format: WireFormat,
    tick: u64,
    skipped: &mut usize,
) -> Vec<EventBody> {
    if format == WireFormat::Binary {
        return events;
    }
    events
        .into_iter()
        .filter(|event| {
            let ok = event.data.values().all(text_encodable);
            if !ok {
                warn!(tick, event = %event.name, "dropping event with no text representation");
                *skipped += 1;
            }
            ok
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::codec::decode_server_frame;
    use std::collections::BTreeMap;

    fn diff(entries: &[(&str, FieldValue)]) -> Diff {
        Diff {
            changed: entries
                .iter()
                .map(|(path, value)| (path.to_string(), value.clone()))
                .collect(),
            removed: Vec::new(),
        }
    }

    fn decode_update(frame: &EncodedFrame, format: WireFormat) -> StateUpdateFrame {
        match decode_server_frame(&frame.bytes, format).unwrap() {
            ServerFrame::StateUpdate(update) => update,
            other => panic!("expected stateUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_declares_keys_once() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);

        let frame = pipeline
            .encode_broadcast(1, &diff(&[("tick", 1i64.into()), ("hp", 100i64.into())]), vec![])
            .unwrap()
            .unwrap();
        let update = decode_update(&frame, WireFormat::Binary);
        assert_eq!(update.keys.len(), 2);
        assert_eq!(update.values.len(), 2);

        // Same paths next tick: ids reused, nothing re-declared.
        let frame = pipeline
            .encode_broadcast(2, &diff(&[("hp", 95i64.into())]), vec![])
            .unwrap()
            .unwrap();
        let update = decode_update(&frame, WireFormat::Binary);
        assert!(update.keys.is_empty());
        assert_eq!(update.values.len(), 1);
        let hp_key = *update.values.keys().next().unwrap();
        assert_eq!(update.values.get(&hp_key), Some(&FieldValue::Int(95)));
    }

    #[test]
    fn test_empty_tick_encodes_nothing() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        assert!(pipeline.encode_broadcast(1, &Diff::default(), vec![]).unwrap().is_none());
        assert!(pipeline
            .encode_per_player(PlayerId::new_v4(), 1, &Diff::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_events_only_tick_rides_combined_frame() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        let frame = pipeline
            .encode_broadcast(3, &Diff::default(), vec![EventBody::new("boom")])
            .unwrap()
            .unwrap();
        match decode_server_frame(&frame.bytes, WireFormat::Binary).unwrap() {
            ServerFrame::StateUpdateWithEvents(combined) => {
                assert!(combined.update.is_empty());
                assert_eq!(combined.events.len(), 1);
                assert_eq!(combined.events[0].name, "boom");
            }
            other => panic!("expected combined frame, got {other:?}"),
        }
    }

    #[test]
    fn test_per_player_table_is_independent() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        let player = PlayerId::new_v4();

        // Broadcast table takes ids 0 and 1.
        pipeline
            .encode_broadcast(1, &diff(&[("tick", 1i64.into()), ("hp", 9i64.into())]), vec![])
            .unwrap();

        let frame = pipeline
            .encode_per_player(player, 1, &diff(&[("gold", 10i64.into())]))
            .unwrap()
            .unwrap();
        let update = decode_update(&frame, WireFormat::Binary);
        // Fresh per-player table starts at id 0 regardless of broadcast ids.
        assert_eq!(update.keys, vec![("gold".to_string(), 0)]);
        assert_eq!(update.values.get(&0), Some(&FieldValue::Int(10)));
    }

    #[test]
    fn test_first_sync_redeclares_broadcast_ids() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        let player = PlayerId::new_v4();

        // Two ticks of history establish broadcast ids.
        pipeline
            .encode_broadcast(1, &diff(&[("tick", 1i64.into()), ("hp", 100i64.into())]), vec![])
            .unwrap();
        pipeline
            .encode_broadcast(2, &diff(&[("score", 0i64.into())]), vec![])
            .unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.broadcast.insert("tick".to_string(), FieldValue::Int(2));
        snapshot.broadcast.insert("hp".to_string(), FieldValue::Int(100));
        snapshot.broadcast.insert("score".to_string(), FieldValue::Int(0));
        snapshot.private.insert("gold".to_string(), FieldValue::Int(10));

        let frames = pipeline.encode_first_sync(player, 3, &snapshot).unwrap();

        let broadcast = decode_update(&frames.broadcast, WireFormat::Binary);
        assert!(broadcast.full);
        // Every referenced key declared, with the shared table's ids.
        let declared: BTreeMap<String, u32> = broadcast.keys.into_iter().collect();
        assert_eq!(declared.len(), 3);
        assert_eq!(declared.get("tick"), Some(&0));
        assert_eq!(declared.get("hp"), Some(&1));
        assert_eq!(declared.get("score"), Some(&2));

        let private = decode_update(frames.private.as_ref().unwrap(), WireFormat::Binary);
        assert!(private.full);
        assert_eq!(private.keys, vec![("gold".to_string(), 0)]);
    }

    #[test]
    fn test_first_sync_declares_retired_keys() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);

        // "buff" gets an id, then the field is removed before the join.
        pipeline
            .encode_broadcast(1, &diff(&[("buff", FieldValue::Bool(true))]), vec![])
            .unwrap();
        pipeline
            .encode_broadcast(
                2,
                &Diff {
                    changed: BTreeMap::new(),
                    removed: vec!["buff".to_string()],
                },
                vec![],
            )
            .unwrap();

        let frames = pipeline
            .encode_first_sync(PlayerId::new_v4(), 3, &Snapshot::default())
            .unwrap();
        let update = decode_update(&frames.broadcast, WireFormat::Binary);
        // No value for "buff", but its id is still in the directory, so a
        // later incremental that re-sets the field stays decodable.
        assert!(update.values.is_empty());
        assert_eq!(update.keys, vec![("buff".to_string(), 0)]);

        let frame = pipeline
            .encode_broadcast(4, &diff(&[("buff", FieldValue::Bool(true))]), vec![])
            .unwrap()
            .unwrap();
        let update = decode_update(&frame, WireFormat::Binary);
        assert!(update.keys.is_empty());
        assert_eq!(update.values.get(&0), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_first_sync_without_private_state() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Text);
        let snapshot = Snapshot::default();
        let frames = pipeline
            .encode_first_sync(PlayerId::new_v4(), 1, &snapshot)
            .unwrap();
        // Empty room still yields the broadcast full frame.
        let update = decode_update(&frames.broadcast, WireFormat::Text);
        assert!(update.full);
        assert!(update.values.is_empty());
        assert!(frames.private.is_none());
    }

    #[test]
    fn test_reset_player_restarts_table() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        let player = PlayerId::new_v4();

        pipeline
            .encode_per_player(player, 1, &diff(&[("gold", 1i64.into()), ("xp", 2i64.into())]))
            .unwrap();
        pipeline.reset_player(player);

        let frame = pipeline
            .encode_per_player(player, 2, &diff(&[("xp", 3i64.into())]))
            .unwrap()
            .unwrap();
        let update = decode_update(&frame, WireFormat::Binary);
        // After the reset "xp" is new again, starting from id 0.
        assert_eq!(update.keys, vec![("xp".to_string(), 0)]);
    }

    #[test]
    fn test_non_finite_float_skipped_in_text() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Text);
        let frame = pipeline
            .encode_broadcast(
                1,
                &diff(&[("bad", FieldValue::Float(f64::NAN)), ("good", 7i64.into())]),
                vec![],
            )
            .unwrap()
            .unwrap();
        assert_eq!(frame.skipped, 1);
        let update = decode_update(&frame, WireFormat::Text);
        assert_eq!(update.values.len(), 1);
        assert_eq!(update.keys, vec![("good".to_string(), 0)]);
    }

    #[test]
    fn test_non_finite_float_allowed_in_binary() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        let frame = pipeline
            .encode_broadcast(1, &diff(&[("bad", FieldValue::Float(f64::NAN))]), vec![])
            .unwrap()
            .unwrap();
        assert_eq!(frame.skipped, 0);
        let update = decode_update(&frame, WireFormat::Binary);
        match update.values.get(&0) {
            Some(FieldValue::Float(f)) => assert!(f.is_nan()),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_unencodable_event_dropped_not_frame() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Text);
        let bad = EventBody::new("bad").with("x", f64::NAN);
        let good = EventBody::new("good");
        let frame = pipeline
            .encode_broadcast(1, &Diff::default(), vec![bad, good])
            .unwrap()
            .unwrap();
        assert_eq!(frame.skipped, 1);
        match decode_server_frame(&frame.bytes, WireFormat::Text).unwrap() {
            ServerFrame::StateUpdateWithEvents(combined) => {
                assert_eq!(combined.events.len(), 1);
                assert_eq!(combined.events[0].name, "good");
            }
            other => panic!("expected combined frame, got {other:?}"),
        }
    }

    #[test]
    fn test_removed_only_for_declared_paths() {
        let mut pipeline = EncodingPipeline::new(WireFormat::Binary);
        pipeline
            .encode_broadcast(1, &diff(&[("buff", FieldValue::Bool(true))]), vec![])
            .unwrap();

        let removal = Diff {
            changed: BTreeMap::new(),
            removed: vec!["buff".to_string(), "never_sent".to_string()],
        };
        let frame = pipeline.encode_broadcast(2, &removal, vec![]).unwrap().unwrap();
        let update = decode_update(&frame, WireFormat::Binary);
        assert_eq!(update.removed, vec![0]);
    }

    #[test]
    fn test_identical_state_encodes_identically() {
        let d = diff(&[("a", 1i64.into()), ("b", FieldValue::Str("x".into())), ("c", 2.5f64.into())]);
        for format in [WireFormat::Text, WireFormat::Compact, WireFormat::Binary] {
            let mut p1 = EncodingPipeline::new(format);
            let mut p2 = EncodingPipeline::new(format);
            let f1 = p1.encode_broadcast(5, &d, vec![]).unwrap().unwrap();
            let f2 = p2.encode_broadcast(5, &d, vec![]).unwrap().unwrap();
            assert_eq!(f1.bytes, f2.bytes, "format {format}");
        }
    }
}
