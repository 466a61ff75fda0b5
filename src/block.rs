//! Block state: displayed rows as a window over the record set, the row and
//! field cursors, query mode and the per-block transaction guard.
//!
//! Everything here is synchronous. The async operations that drive it live
//! on `Form`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::connection::Cursor;
use crate::datasource::{parse_criterion, Criterion, DataSource};
use crate::guard::TransactionGuard;
use crate::model::{FieldDef, Record, RecordSet, RecordState, Row, Values, MIRROR_ROW};
use crate::query::ChainId;
use crate::render::RecordView;

/// When dirty records are written to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushStrategy {
    /// On leaving the row.
    Row,
    /// On commit.
    #[default]
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Allowed {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
    pub query: bool,
}

impl Default for Allowed {
    fn default() -> Self {
        Self {
            insert: true,
            update: true,
            delete: true,
            query: true,
        }
    }
}

/// What a row slot should show after a rebind.
pub type RowView = (i32, Option<RecordView>);

#[derive(Debug)]
pub struct Block {
    name: String,
    datasource: Option<DataSource>,
    defs: Vec<Arc<FieldDef>>,
    rows: Vec<Row>,
    mirror: Row,
    records: RecordSet,
    /// Record index shown in display row 0.
    offset: usize,
    /// Current display row.
    row: usize,
    field: Option<String>,
    querymode: bool,
    filter: Option<Record>,
    cursor: Option<Cursor>,
    chain: Option<ChainId>,
    guard: TransactionGuard,
    flush: FlushStrategy,
    allowed: Allowed,
    fetch_size: usize,
}

impl Block {
    pub fn new(name: &str, datasource: Option<DataSource>, defs: Vec<Arc<FieldDef>>, rows: usize) -> Self {
        let rows = rows.max(1);
        let field = defs
            .iter()
            .find(|d| d.kind.accepts_input())
            .or_else(|| defs.first())
            .map(|d| d.name.clone());
        Self {
            name: name.to_string(),
            datasource,
            rows: (0..rows).map(|i| Row::new(i as i32, &defs)).collect(),
            mirror: Row::new(MIRROR_ROW, &defs),
            defs,
            records: RecordSet::new(),
            offset: 0,
            row: 0,
            field,
            querymode: false,
            filter: None,
            cursor: None,
            chain: None,
            guard: TransactionGuard::new(),
            flush: FlushStrategy::default(),
            allowed: Allowed::default(),
            fetch_size: 20,
        }
    }

    pub fn with_flush_strategy(mut self, flush: FlushStrategy) -> Self {
        self.flush = flush;
        self
    }

    pub fn with_allowed(mut self, allowed: Allowed) -> Self {
        self.allowed = allowed;
        self
    }

    pub fn with_fetch_size(mut self, rows: usize) -> Self {
        self.fetch_size = rows.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn datasource(&self) -> Option<&DataSource> {
        self.datasource.as_ref()
    }
    pub fn field_defs(&self) -> &[Arc<FieldDef>] {
        &self.defs
    }
    pub fn field_def(&self, name: &str) -> Option<&Arc<FieldDef>> {
        self.defs.iter().find(|d| d.name == name)
    }
    /// Field bound to `column`, if any.
    pub fn field_for_column(&self, column: &str) -> Option<&Arc<FieldDef>> {
        self.defs.iter().find(|d| d.column.as_deref() == Some(column))
    }
    pub fn flush_strategy(&self) -> FlushStrategy {
        self.flush
    }
    pub fn allowed(&self) -> Allowed {
        self.allowed
    }
    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    /// Displayed rows, mirror excluded.
    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: i32) -> Option<&Row> {
        if index == MIRROR_ROW {
            return Some(&self.mirror);
        }
        usize::try_from(index).ok().and_then(|i| self.rows.get(i))
    }

    pub fn row_mut(&mut self, index: i32) -> Option<&mut Row> {
        if index == MIRROR_ROW {
            return Some(&mut self.mirror);
        }
        usize::try_from(index).ok().and_then(|i| self.rows.get_mut(i))
    }

    pub fn current_row_index(&self) -> usize {
        self.row
    }

    pub fn current_row(&self) -> &Row {
        &self.rows[self.row]
    }

    pub fn current_row_mut(&mut self) -> &mut Row {
        &mut self.rows[self.row]
    }

    pub fn mirror(&self) -> &Row {
        &self.mirror
    }

    pub fn mirror_mut(&mut self) -> &mut Row {
        &mut self.mirror
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Absolute index of the current record.
    pub fn record_index(&self) -> usize {
        self.offset + self.row
    }

    pub fn current_field(&self) -> Option<&str> {
        self.field.as_deref()
    }

    pub fn set_current_field(&mut self, field: &str) {
        self.field = Some(field.to_string());
    }

    pub fn is_query_mode(&self) -> bool {
        self.querymode
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }
    pub fn records_mut(&mut self) -> &mut RecordSet {
        &mut self.records
    }

    pub fn current_record(&self) -> Option<&Record> {
        if self.querymode {
            return self.filter.as_ref();
        }
        self.records.get(self.record_index())
    }

    pub fn current_record_mut(&mut self) -> Option<&mut Record> {
        if self.querymode {
            return self.filter.as_mut();
        }
        let idx = self.record_index();
        self.records.get_mut(idx)
    }

    /// Record `offset` positions away from the current one.
    pub fn record_at(&self, offset: i64) -> Option<&Record> {
        if offset == 0 {
            return self.current_record();
        }
        let idx = self.record_index() as i64 + offset;
        usize::try_from(idx).ok().and_then(|i| self.records.get(i))
    }

    pub fn guard(&self) -> &TransactionGuard {
        &self.guard
    }
    pub fn guard_mut(&mut self) -> &mut TransactionGuard {
        &mut self.guard
    }

    pub fn chain(&self) -> Option<ChainId> {
        self.chain
    }

    pub fn take_cursor(&mut self) -> Option<Cursor> {
        self.cursor.take()
    }

    pub fn put_cursor(&mut self, cursor: Cursor) {
        self.cursor = Some(cursor);
    }

    pub fn has_cursor(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn position(&self) -> (usize, usize) {
        (self.offset, self.row)
    }

    pub fn restore_position(&mut self, (offset, row): (usize, usize)) {
        self.offset = offset;
        self.row = row.min(self.rows.len() - 1);
    }

    /// Scroll so that record `index` is visible and current.
    pub fn show(&mut self, index: usize) {
        let n = self.rows.len();
        if index < self.offset {
            self.offset = index;
        } else if index >= self.offset + n {
            self.offset = index + 1 - n;
        }
        self.row = index - self.offset;
    }

    /// Keep the cursor on an existing record after records went away.
    pub fn clamp(&mut self) {
        let len = self.records.len();
        if len == 0 {
            self.offset = 0;
            self.row = 0;
            return;
        }
        let idx = self.record_index().min(len - 1);
        if self.offset > idx {
            self.offset = idx;
        }
        self.show(idx);
    }

    /// Bind every slot to its record and report what to display.
    pub fn rebind(&mut self) -> Vec<RowView> {
        let mut out = Vec::with_capacity(self.rows.len() + 1);
        for i in 0..self.rows.len() {
            let record = if self.querymode {
                (i == 0).then_some(()).and(self.filter.as_ref())
            } else {
                self.records.get(self.offset + i)
            };
            let row = &mut self.rows[i];
            out.push((i as i32, bind_row(row, record)));
        }
        let current = self.current_record().cloned();
        out.push((MIRROR_ROW, bind_row(&mut self.mirror, current.as_ref())));
        out
    }

    /// Replace the record set with a fresh query result.
    pub fn load(&mut self, rows: Vec<Values>, more: bool, cursor: Option<Cursor>, chain: ChainId) {
        self.records.clear();
        for values in rows {
            self.records.push_fetched(values);
        }
        self.records.set_eof(!more);
        self.cursor = cursor;
        self.chain = Some(chain);
        self.querymode = false;
        self.filter = None;
        self.offset = 0;
        self.row = 0;
    }

    /// Append a page fetched from the open cursor.
    pub fn append(&mut self, rows: Vec<Values>, more: bool) {
        for values in rows {
            self.records.push_fetched(values);
        }
        self.records.set_eof(!more);
    }

    /// Drop records and cursor, leaving every slot empty.
    pub fn clear(&mut self) {
        self.records.clear();
        self.cursor = None;
        self.chain = None;
        self.querymode = false;
        self.filter = None;
        self.offset = 0;
        self.row = 0;
        for row in &mut self.rows {
            row.unbind();
        }
        self.mirror.unbind();
    }

    pub fn enter_query(&mut self) {
        self.clear();
        let id = self.records.allocate_id();
        let columns: Vec<String> = self.defs.iter().filter_map(|d| d.column.clone()).collect();
        self.filter = Some(Record::query_filter(id, columns.iter().map(String::as_str)));
        self.querymode = true;
    }

    /// Query criteria typed into the filter record.
    pub fn criteria(&self) -> Result<Vec<Criterion>, String> {
        let Some(filter) = self.filter.as_ref().filter(|_| self.querymode) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for def in &self.defs {
            let Some(column) = def.column.as_deref() else {
                continue;
            };
            let text = match filter.get(column) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Null) | None => continue,
                Some(other) => other.to_string(),
            };
            let datatype = self
                .datasource
                .as_ref()
                .map(|ds| ds.datatype(column))
                .unwrap_or(def.datatype);
            if let Some(c) = parse_criterion(column, datatype, &text)? {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Unflushed record changes or unvalidated field input.
    pub fn has_pending_changes(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.is_dirty() && r.state() != RecordState::New)
            || (!self.querymode && self.rows.iter().any(|r| r.is_dirty()))
    }

    /// Commit went through.
    pub fn synchronize(&mut self) {
        self.records.retain(|r| r.state() != RecordState::Deleted);
        for r in self.records.iter_mut() {
            if r.state() != RecordState::New {
                r.synchronize();
            }
        }
        self.clamp();
    }

    /// Back to the last committed state.
    pub fn undo(&mut self) {
        self.records.retain(|r| {
            !(r.state().is_local() || r.state() == RecordState::Inserted || r.is_uncommitted())
        });
        for r in self.records.iter_mut() {
            r.undo();
        }
        for row in &mut self.rows {
            row.set_validated(true);
        }
        self.clamp();
    }

    pub fn view(&self, index: i32) -> Option<RecordView> {
        let row = self.row(index)?;
        let id = row.record()?;
        let record = if self.querymode {
            self.filter.as_ref().filter(|f| f.id() == id)
        } else {
            self.records.by_id(id)
        }?;
        Some(RecordView {
            record: id,
            status: row.status(),
            values: record.values().clone(),
            failed: record.is_failed(),
        })
    }
}

fn bind_row(row: &mut Row, record: Option<&Record>) -> Option<RecordView> {
    match record {
        Some(r) => {
            row.bind(r);
            if r.state() == RecordState::New {
                row.mark_new();
            }
            Some(RecordView {
                record: r.id(),
                status: row.status(),
                values: r.values().clone(),
                failed: r.is_failed(),
            })
        }
        None => {
            row.unbind();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::{Column, Operator};
    use crate::model::{DataType, RecordId, Status};
    use serde_json::json;

    fn block(rows: usize) -> Block {
        let mut id = FieldDef::new("id");
        id.datatype = DataType::Integer;
        let name = FieldDef::new("name");
        let ds = DataSource::new(
            "items",
            vec![
                Column { name: "id".into(), datatype: DataType::Integer },
                Column { name: "name".into(), datatype: DataType::String },
            ],
            vec!["id".into()],
        );
        Block::new("items", Some(ds), vec![Arc::new(id), Arc::new(name)], rows)
    }

    fn values(id: i64) -> Values {
        let mut v = Values::new();
        v.insert("id".into(), json!(id));
        v.insert("name".into(), json!(format!("item{id}")));
        v
    }

    #[test]
    fn window_scrolls_to_show_current() {
        let mut b = block(3);
        b.load((1..=10).map(values).collect(), false, None, ChainId(1));
        b.show(5);
        assert_eq!(b.position(), (3, 2));
        assert_eq!(b.record_index(), 5);
        b.show(1);
        assert_eq!(b.position(), (1, 0));
        b.show(2);
        assert_eq!(b.position(), (1, 1));
    }

    #[test]
    fn rebind_binds_window_and_mirror() {
        let mut b = block(3);
        b.load((1..=2).map(values).collect(), false, None, ChainId(1));
        let views = b.rebind();
        assert_eq!(views.len(), 4);
        assert!(views[0].1.is_some());
        assert!(views[2].1.is_none());
        assert_eq!(b.row(2).unwrap().status(), Status::Na);
        let mirror = views.iter().find(|(i, _)| *i == MIRROR_ROW).unwrap();
        assert_eq!(mirror.1.as_ref().unwrap().values["id"], json!(1));
        assert_eq!(b.current_row().status(), Status::Update);
    }

    #[test]
    fn query_mode_binds_filter_row() {
        let mut b = block(2);
        b.enter_query();
        b.rebind();
        assert!(b.is_query_mode());
        assert_eq!(b.current_row().status(), Status::Qbe);
        assert_eq!(b.row(1).unwrap().status(), Status::Na);

        b.current_record_mut().unwrap().set("name", json!("it%"));
        b.current_record_mut().unwrap().set("id", json!(">3"));
        let crit = b.criteria().unwrap();
        assert_eq!(crit.len(), 2);
        assert_eq!(crit[0].op, Operator::Gt);
        assert_eq!(crit[1].op, Operator::Like);
        assert!(!b.has_pending_changes());
    }

    #[test]
    fn clamp_after_removal() {
        let mut b = block(2);
        b.load((1..=3).map(values).collect(), false, None, ChainId(1));
        b.show(2);
        b.records_mut().remove(2);
        b.clamp();
        assert_eq!(b.record_index(), 1);
        b.records_mut().clear();
        b.clamp();
        assert_eq!(b.position(), (0, 0));
    }

    #[test]
    fn undo_drops_local_records_and_restores_others() {
        let mut b = block(2);
        b.load((1..=2).map(values).collect(), false, None, ChainId(1));
        b.records_mut().get_mut(0).unwrap().set("name", json!("changed"));
        let id = b.records_mut().allocate_id();
        let mut fresh = Record::placeholder(id, ["id", "name"]);
        fresh.set("id", json!(99));
        b.records_mut().insert(2, fresh);
        assert!(b.has_pending_changes());

        b.undo();
        assert_eq!(b.records().len(), 2);
        assert_eq!(b.records().get(0).unwrap().get("name"), Some(&json!("item1")));
        assert!(!b.has_pending_changes());
    }

    #[test]
    fn undo_drops_flushed_insert_edited_afterwards() {
        let mut b = block(2);
        b.load((1..=2).map(values).collect(), false, None, ChainId(1));
        let id = b.records_mut().allocate_id();
        let mut fresh = Record::placeholder(id, ["id", "name"]);
        fresh.set("id", json!(99));
        fresh.mark_flushed();
        fresh.set("name", json!("late"));
        assert_eq!(fresh.state(), RecordState::Update);
        b.records_mut().insert(2, fresh);

        b.undo();
        assert_eq!(b.records().len(), 2);
        assert!(b.records().iter().all(|r| r.get("id") != Some(&json!(99))));
    }

    #[test]
    fn synchronize_drops_deleted() {
        let mut b = block(2);
        b.load((1..=2).map(values).collect(), false, None, ChainId(1));
        let r = b.records_mut().get_mut(1).unwrap();
        r.toggle_delete();
        r.mark_flushed();
        b.synchronize();
        assert_eq!(b.records().len(), 1);
        assert_eq!(b.records().get(0).unwrap().id(), RecordId(1));
    }
}
