use rustc_hash::FxHashMap;

/// Path-to-integer surrogate table for one encoding scope.
///
/// Keys are assigned sequentially and never reassigned for the table's
/// lifetime, so any frame built against the same table state encodes
/// identically. Broadcast tables live as long as the room; per-player tables
/// are cleared when the player rebinds.
#[derive(Debug, Default)]
pub struct KeyTable {
    ids: FxHashMap<String, u32>,
    paths: Vec<String>,
}

impl KeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or assign the key for `path`. Returns the key and whether it
    /// was newly assigned (new keys must be declared in the frame that first
    /// uses them).
    pub fn intern(&mut self, path: &str) -> (u32, bool) {
        if let Some(&id) = self.ids.get(path) {
            return (id, false);
        }
        let id = self.paths.len() as u32;
        self.ids.insert(path.to_string(), id);
        self.paths.push(path.to_string());
        (id, true)
    }

    pub fn get(&self, path: &str) -> Option<u32> {
        self.ids.get(path).copied()
    }

    pub fn path_of(&self, key: u32) -> Option<&str> {
        self.paths.get(key as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.paths.clear();
    }
}
