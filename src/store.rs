use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use thiserror::Error;

use crate::wire::protocol::{ActionEnvelope, EventBody, FieldValue, PlayerId};

/// Changes accumulated since the previous pull for one scope. Paths are
/// `BTreeMap`-ordered so downstream encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub changed: BTreeMap<String, FieldValue>,
    pub removed: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Complete state view for one viewer, split by scope. The split is kept
/// because broadcast and per-player frames encode against different key
/// tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub broadcast: BTreeMap<String, FieldValue>,
    pub private: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("invalid action args: {0}")]
    InvalidArgs(&'static str),
}

/// The authoritative game state, seen through the narrow interface the sync
/// core needs. Diff pulls are draining: each call returns changes since the
/// previous call for that scope.
pub trait StateStore: Send {
    fn apply_action(&mut self, player: PlayerId, action: ActionEnvelope) -> Result<(), StoreError>;
    fn apply_client_event(&mut self, player: PlayerId, event: EventBody);
    fn compute_broadcast_diff(&mut self) -> Diff;
    fn compute_per_player_diff(&mut self, player: PlayerId) -> Diff;
    fn full_snapshot(&self, viewer: PlayerId) -> Snapshot;
}

/// In-memory store used by the harness and tests. Broadcast and per-player
/// state are flat path maps with dirty-set diff tracking; the action
/// vocabulary is the minimal set/setPrivate/clear trio.
#[derive(Default)]
pub struct MemoryStore {
    broadcast: BTreeMap<String, FieldValue>,
    private: HashMap<PlayerId, BTreeMap<String, FieldValue>>,
    broadcast_changed: BTreeSet<String>,
    broadcast_removed: BTreeSet<String>,
    private_changed: HashMap<PlayerId, BTreeSet<String>>,
    private_removed: HashMap<PlayerId, BTreeSet<String>>,
    client_events: Vec<(PlayerId, EventBody)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broadcast_field(&mut self, path: impl Into<String>, value: impl Into<FieldValue>) {
        let path = path.into();
        self.broadcast_removed.remove(&path);
        self.broadcast_changed.insert(path.clone());
        self.broadcast.insert(path, value.into());
    }

    pub fn remove_broadcast_field(&mut self, path: &str) {
        if self.broadcast.remove(path).is_some() {
            self.broadcast_changed.remove(path);
            self.broadcast_removed.insert(path.to_string());
        }
    }

    pub fn set_player_field(
        &mut self,
        player: PlayerId,
        path: impl Into<String>,
        value: impl Into<FieldValue>,
    ) {
        let path = path.into();
        if let Some(removed) = self.private_removed.get_mut(&player) {
            removed.remove(&path);
        }
        self.private_changed.entry(player).or_default().insert(path.clone());
        self.private.entry(player).or_default().insert(path, value.into());
    }

    pub fn remove_player_field(&mut self, player: PlayerId, path: &str) {
        let existed = self
            .private
            .get_mut(&player)
            .map(|fields| fields.remove(path).is_some())
            .unwrap_or(false);
        if existed {
            if let Some(changed) = self.private_changed.get_mut(&player) {
                changed.remove(path);
            }
            self.private_removed.entry(player).or_default().insert(path.to_string());
        }
    }

    pub fn broadcast_value(&self, path: &str) -> Option<&FieldValue> {
        self.broadcast.get(path)
    }

    /// Client events received so far, oldest first.
    pub fn client_events(&self) -> &[(PlayerId, EventBody)] {
        &self.client_events
    }

    fn arg_str(action: &ActionEnvelope, name: &'static str) -> Result<String, StoreError> {
        match action.args.get(name) {
            Some(FieldValue::Str(s)) => Ok(s.clone()),
            _ => Err(StoreError::InvalidArgs(name)),
        }
    }
}

impl StateStore for MemoryStore {
    fn apply_action(&mut self, player: PlayerId, action: ActionEnvelope) -> Result<(), StoreError> {
        match action.name.as_str() {
            "set" => {
                let path = Self::arg_str(&action, "path")?;
                let value = action
                    .args
                    .get("value")
                    .cloned()
                    .ok_or(StoreError::InvalidArgs("value"))?;
                self.broadcast_removed.remove(&path);
                self.broadcast_changed.insert(path.clone());
                self.broadcast.insert(path, value);
                Ok(())
            }
            "setPrivate" => {
                let path = Self::arg_str(&action, "path")?;
                let value = action
                    .args
                    .get("value")
                    .cloned()
                    .ok_or(StoreError::InvalidArgs("value"))?;
                self.set_player_field(player, path, value);
                Ok(())
            }
            "clear" => {
                let path = Self::arg_str(&action, "path")?;
                self.remove_broadcast_field(&path);
                Ok(())
            }
            other => Err(StoreError::UnknownAction(other.to_string())),
        }
    }

    fn apply_client_event(&mut self, player: PlayerId, event: EventBody) {
        self.client_events.push((player, event));
    }

    fn compute_broadcast_diff(&mut self) -> Diff {
        let changed = std::mem::take(&mut self.broadcast_changed)
            .into_iter()
            .filter_map(|path| self.broadcast.get(&path).map(|v| (path.clone(), v.clone())))
            .collect();
        let removed = std::mem::take(&mut self.broadcast_removed).into_iter().collect();
        Diff { changed, removed }
    }

    fn compute_per_player_diff(&mut self, player: PlayerId) -> Diff {
        let fields = self.private.get(&player);
        let changed = self
            .private_changed
            .remove(&player)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|path| {
                fields.and_then(|f| f.get(&path)).map(|v| (path.clone(), v.clone()))
            })
            .collect();
        let removed = self
            .private_removed
            .remove(&player)
            .unwrap_or_default()
            .into_iter()
            .collect();
        Diff { changed, removed }
    }

    fn full_snapshot(&self, viewer: PlayerId) -> Snapshot {
        Snapshot {
            broadcast: self.broadcast.clone(),
            private: self.private.get(&viewer).cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn action(name: &str, args: &[(&str, FieldValue)]) -> ActionEnvelope {
        ActionEnvelope {
            request_id: 1,
            name: name.to_string(),
            args: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_broadcast_diff_drains() {
        let mut store = MemoryStore::new();
        store.set_broadcast_field("tick", 5i64);
        store.set_broadcast_field("hp", 90i64);

        let diff = store.compute_broadcast_diff();
        assert_eq!(diff.changed.len(), 2);
        assert_eq!(diff.changed.get("hp"), Some(&FieldValue::Int(90)));

        // Nothing changed since the pull.
        assert!(store.compute_broadcast_diff().is_empty());
    }

    #[test]
    fn test_removed_fields_reported_once() {
        let mut store = MemoryStore::new();
        store.set_broadcast_field("buff", true);
        store.compute_broadcast_diff();

        store.remove_broadcast_field("buff");
        let diff = store.compute_broadcast_diff();
        assert!(diff.changed.is_empty());
        assert_eq!(diff.removed, vec!["buff".to_string()]);
        assert!(store.compute_broadcast_diff().is_empty());
    }

    #[test]
    fn test_set_then_remove_before_pull() {
        let mut store = MemoryStore::new();
        store.set_broadcast_field("flash", 1i64);
        store.remove_broadcast_field("flash");
        let diff = store.compute_broadcast_diff();
        assert!(diff.changed.is_empty());
        assert_eq!(diff.removed, vec!["flash".to_string()]);
    }

    #[test]
    fn test_per_player_diff_isolated() {
        let mut store = MemoryStore::new();
        let p1 = PlayerId::new_v4();
        let p2 = PlayerId::new_v4();
        store.set_player_field(p1, "gold", 10i64);

        assert!(store.compute_broadcast_diff().is_empty());
        assert!(store.compute_per_player_diff(p2).is_empty());

        let diff = store.compute_per_player_diff(p1);
        assert_eq!(diff.changed.get("gold"), Some(&FieldValue::Int(10)));
        assert!(store.compute_per_player_diff(p1).is_empty());
    }

    #[test]
    fn test_full_snapshot_scoped_to_viewer() {
        let mut store = MemoryStore::new();
        let p1 = PlayerId::new_v4();
        let p2 = PlayerId::new_v4();
        store.set_broadcast_field("tick", 5i64);
        store.set_player_field(p1, "gold", 10i64);
        store.set_player_field(p2, "gold", 99i64);

        let snap = store.full_snapshot(p1);
        assert_eq!(snap.broadcast.get("tick"), Some(&FieldValue::Int(5)));
        assert_eq!(snap.private.get("gold"), Some(&FieldValue::Int(10)));
        assert_eq!(snap.private.len(), 1);

        // Snapshots do not drain diff tracking.
        assert!(!store.compute_broadcast_diff().is_empty());
    }

    #[test]
    fn test_action_vocabulary() {
        let mut store = MemoryStore::new();
        let p1 = PlayerId::new_v4();

        store
            .apply_action(p1, action("set", &[("path", "hp".into()), ("value", FieldValue::Int(90))]))
            .unwrap();
        assert_eq!(store.broadcast_value("hp"), Some(&FieldValue::Int(90)));

        store
            .apply_action(
                p1,
                action("setPrivate", &[("path", "gold".into()), ("value", FieldValue::Int(10))]),
            )
            .unwrap();
        let diff = store.compute_per_player_diff(p1);
        assert_eq!(diff.changed.get("gold"), Some(&FieldValue::Int(10)));

        store.apply_action(p1, action("clear", &[("path", "hp".into())])).unwrap();
        assert!(store.broadcast_value("hp").is_none());

        assert!(matches!(
            store.apply_action(p1, action("teleport", &[])),
            Err(StoreError::UnknownAction(_))
        ));
        assert!(matches!(
            store.apply_action(p1, action("set", &[("value", FieldValue::Int(1))])),
            Err(StoreError::InvalidArgs("path"))
        ));
    }

    #[test]
    fn test_client_events_recorded() {
        let mut store = MemoryStore::new();
        let p1 = PlayerId::new_v4();
        store.apply_client_event(p1, EventBody::new("emote").with("kind", "wave"));
        assert_eq!(store.client_events().len(), 1);
        assert_eq!(store.client_events()[0].1.name, "emote");
    }
}
