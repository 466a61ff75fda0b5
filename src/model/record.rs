use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use super::status::RecordState;

/// Identity of a record within its block's record set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type Values = IndexMap<String, Value>;

/// Working copy of one backend row.
///
/// Three column snapshots are kept: `values` is what the user sees,
/// `initial` is what the backend last confirmed (source of assert clauses),
/// `original` is what was last committed or fetched (target of undo).
#[derive(Clone, Debug)]
pub struct Record {
    id: RecordId,
    values: Values,
    initial: Values,
    original: Values,
    state: RecordState,
    before_delete: Option<RecordState>,
    dirty: bool,
    failed: bool,
    locked: bool,
    /// Inserted on the backend by the open transaction.
    uncommitted: bool,
}

impl Record {
    pub fn placeholder<'a>(id: RecordId, columns: impl IntoIterator<Item = &'a str>) -> Self {
        let values: Values = columns
            .into_iter()
            .map(|c| (c.to_string(), Value::Null))
            .collect();
        Self::with_state(id, values, RecordState::New)
    }

    pub fn fetched(id: RecordId, values: Values) -> Self {
        Self::with_state(id, values, RecordState::Consistent)
    }

    pub fn query_filter<'a>(id: RecordId, columns: impl IntoIterator<Item = &'a str>) -> Self {
        let mut r = Self::placeholder(id, columns);
        r.state = RecordState::QueryFilter;
        r
    }

    fn with_state(id: RecordId, values: Values, state: RecordState) -> Self {
        Self {
            id,
            initial: values.clone(),
            original: values.clone(),
            values,
            state,
            before_delete: None,
            dirty: false,
            failed: false,
            locked: false,
            uncommitted: false,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Row exists on the backend only until the transaction ends.
    pub fn is_uncommitted(&self) -> bool {
        self.uncommitted
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
    pub fn is_failed(&self) -> bool {
        self.failed
    }
    pub fn is_locked(&self) -> bool {
        self.locked
    }
    pub fn values(&self) -> &Values {
        &self.values
    }
    pub fn initial(&self) -> &Values {
        &self.initial
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Store a column value. Returns true when the value actually changed.
    ///
    /// The first change of a placeholder turns it into an insertable record and
    /// the first change of a fetched record turns it into an update.
    pub fn set(&mut self, column: &str, value: Value) -> bool {
        if self.values.get(column) == Some(&value) {
            return false;
        }
        self.values.insert(column.to_string(), value);
        if self.state == RecordState::QueryFilter {
            return true;
        }
        self.dirty = true;
        self.state = match self.state {
            RecordState::New | RecordState::Insert => RecordState::Insert,
            RecordState::Consistent | RecordState::Updated | RecordState::Inserted => {
                RecordState::Update
            }
            other => other,
        };
        true
    }

    /// Put a value without touching state or dirtiness (defaults, join keys).
    pub fn preset(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_string(), value);
    }

    /// Columns whose value differs from what the backend last confirmed.
    pub fn changed_columns(&self) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(k, v)| self.initial.get(k.as_str()) != Some(*v))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
    }

    /// Toggle the delete mark. Returns false when the record cannot toggle
    /// (already deleted on the backend, or a query filter).
    pub fn toggle_delete(&mut self) -> bool {
        match self.state {
            RecordState::Delete => {
                self.state = self.before_delete.take().unwrap_or(RecordState::Consistent);
                self.dirty = self.state.needs_flush() || self.state.is_flushed();
                true
            }
            RecordState::Deleted | RecordState::QueryFilter => false,
            other => {
                self.before_delete = Some(other);
                self.state = RecordState::Delete;
                self.dirty = true;
                true
            }
        }
    }

    /// Backend confirmed the pending change.
    pub fn mark_flushed(&mut self) {
        if self.state == RecordState::Insert {
            self.uncommitted = true;
        }
        self.state = self.state.flushed();
        self.initial = self.values.clone();
        self.failed = false;
    }

    /// Backend reported different column values: adopt them and drop the
    /// local change that was based on the old ones.
    pub fn refresh(&mut self, fresh: Values) {
        for (k, v) in fresh {
            self.initial.insert(k.clone(), v.clone());
            self.original.insert(k.clone(), v.clone());
            self.values.insert(k, v);
        }
        self.state = RecordState::Consistent;
        self.before_delete = None;
        self.dirty = false;
        self.failed = true;
        self.locked = false;
    }

    /// Backend reported that the row is gone.
    pub fn mark_vanished(&mut self) {
        self.state = RecordState::Deleted;
        self.failed = true;
        self.locked = false;
        self.dirty = false;
    }

    /// Commit succeeded.
    pub fn synchronize(&mut self) {
        self.state = RecordState::Consistent;
        self.before_delete = None;
        self.initial = self.values.clone();
        self.original = self.values.clone();
        self.dirty = false;
        self.failed = false;
        self.locked = false;
        self.uncommitted = false;
    }

    /// Restore the last committed copy.
    pub fn undo(&mut self) {
        self.values = self.original.clone();
        self.initial = self.original.clone();
        self.state = RecordState::Consistent;
        self.before_delete = None;
        self.dirty = false;
        self.failed = false;
        self.locked = false;
    }
}

/// Records materialized for one block, in display order.
#[derive(Debug, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    next_id: u64,
    eof: bool,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId(self.next_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
    pub fn eof(&self) -> bool {
        self.eof
    }
    pub fn set_eof(&mut self, eof: bool) {
        self.eof = eof;
    }

    pub fn get(&self, idx: usize) -> Option<&Record> {
        self.records.get(idx)
    }
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.records.get_mut(idx)
    }

    pub fn position(&self, id: RecordId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    pub fn by_id(&self, id: RecordId) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }
    pub fn by_id_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn push_fetched(&mut self, values: Values) -> RecordId {
        let id = self.allocate_id();
        self.records.push(Record::fetched(id, values));
        id
    }

    pub fn insert(&mut self, idx: usize, record: Record) {
        let idx = idx.min(self.records.len());
        self.records.insert(idx, record);
    }

    pub fn remove(&mut self, idx: usize) -> Option<Record> {
        (idx < self.records.len()).then(|| self.records.remove(idx))
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.eof = false;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.iter_mut()
    }

    pub fn retain(&mut self, f: impl FnMut(&Record) -> bool) {
        self.records.retain(f);
    }

    pub fn has_dirty(&self) -> bool {
        self.records.iter().any(|r| r.dirty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order() -> Record {
        let mut v = Values::new();
        v.insert("order_id".into(), json!(1));
        v.insert("status".into(), json!("OPEN"));
        Record::fetched(RecordId(1), v)
    }

    #[test]
    fn first_edit_of_placeholder_becomes_insert() {
        let mut r = Record::placeholder(RecordId(1), ["a", "b"]);
        assert_eq!(r.state(), RecordState::New);
        assert!(!r.is_dirty());
        assert!(r.set("a", json!("x")));
        assert_eq!(r.state(), RecordState::Insert);
        assert!(r.is_dirty());
    }

    #[test]
    fn edit_of_fetched_becomes_update_and_tracks_changes() {
        let mut r = order();
        assert!(!r.set("status", json!("OPEN")));
        assert_eq!(r.state(), RecordState::Consistent);
        assert!(r.set("status", json!("CLOSED")));
        assert_eq!(r.state(), RecordState::Update);
        assert_eq!(r.changed_columns(), vec!["status"]);
        assert_eq!(r.initial()["status"], json!("OPEN"));
    }

    #[test]
    fn delete_toggles_back_to_previous_state() {
        let mut r = order();
        r.set("status", json!("CLOSED"));
        assert!(r.toggle_delete());
        assert_eq!(r.state(), RecordState::Delete);
        assert!(r.toggle_delete());
        assert_eq!(r.state(), RecordState::Update);
        assert!(r.is_dirty());

        let mut clean = order();
        clean.toggle_delete();
        clean.toggle_delete();
        assert_eq!(clean.state(), RecordState::Consistent);
        assert!(!clean.is_dirty());
    }

    #[test]
    fn undo_restores_committed_values_after_flush() {
        let mut r = order();
        r.set("status", json!("CLOSED"));
        r.mark_flushed();
        assert_eq!(r.state(), RecordState::Updated);
        assert_eq!(r.initial()["status"], json!("CLOSED"));
        r.undo();
        assert_eq!(r.get("status"), Some(&json!("OPEN")));
        assert_eq!(r.state(), RecordState::Consistent);
        assert!(!r.is_dirty());
    }

    #[test]
    fn flushed_insert_stays_uncommitted_through_later_edits() {
        let mut r = Record::placeholder(RecordId(1), ["order_id", "status"]);
        r.set("order_id", json!(7));
        r.mark_flushed();
        assert_eq!(r.state(), RecordState::Inserted);
        assert!(r.is_uncommitted());
        r.set("status", json!("OPEN"));
        r.mark_flushed();
        assert_eq!(r.state(), RecordState::Updated);
        assert!(r.is_uncommitted());
        r.synchronize();
        assert!(!r.is_uncommitted());
    }

    #[test]
    fn refresh_adopts_backend_values_and_fails() {
        let mut r = order();
        r.set("status", json!("CLOSED"));
        let mut fresh = Values::new();
        fresh.insert("status".into(), json!("SHIPPED"));
        r.refresh(fresh);
        assert_eq!(r.get("status"), Some(&json!("SHIPPED")));
        assert_eq!(r.initial()["status"], json!("SHIPPED"));
        assert!(r.is_failed());
        assert!(!r.is_dirty());
        assert_eq!(r.state(), RecordState::Consistent);
    }

    #[test]
    fn record_set_allocates_unique_ids() {
        let mut set = RecordSet::new();
        let a = set.push_fetched(Values::new());
        let b = set.push_fetched(Values::new());
        assert_ne!(a, b);
        assert_eq!(set.position(b), Some(1));
        set.remove(0);
        assert_eq!(set.position(b), Some(0));
    }
}
