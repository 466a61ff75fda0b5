use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

use super::field::{Field, FieldDef};
use super::record::{Record, RecordId};
use super::status::Status;

/// Index of the replicated current-row editing slot.
pub const MIRROR_ROW: i32 = -1;

/// A display slot. Bound to at most one record.
#[derive(Clone, Debug)]
pub struct Row {
    index: i32,
    record: Option<RecordId>,
    status: Status,
    validated: bool,
    fields: IndexMap<String, Field>,
}

impl Row {
    pub fn new(index: i32, defs: &[Arc<FieldDef>]) -> Self {
        let fields = defs
            .iter()
            .map(|d| (d.name.clone(), Field::new(d.clone())))
            .collect();
        Self {
            index,
            record: None,
            status: Status::Na,
            validated: true,
            fields,
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }
    pub fn record(&self) -> Option<RecordId> {
        self.record
    }
    pub fn status(&self) -> Status {
        self.status
    }
    pub fn is_validated(&self) -> bool {
        self.validated
    }
    pub fn is_mirror(&self) -> bool {
        self.index == MIRROR_ROW
    }

    /// Load a record into the slot. Status follows the record state.
    pub fn bind(&mut self, record: &Record) {
        self.record = Some(record.id());
        self.status = Status::from(record.state());
        self.validated = true;
        for field in self.fields.values_mut() {
            let v = field
                .def()
                .column
                .as_deref()
                .and_then(|c| record.get(c))
                .cloned()
                .unwrap_or(Value::Null);
            field.load(v);
        }
    }

    /// Transient status between creating a placeholder and binding it.
    pub fn mark_new(&mut self) {
        self.status = Status::New;
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub fn unbind(&mut self) {
        self.record = None;
        self.status = Status::Na;
        self.validated = true;
        for field in self.fields.values_mut() {
            field.clear();
        }
    }

    pub fn set_validated(&mut self, validated: bool) {
        self.validated = validated;
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }
    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.get_mut(name)
    }
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub fn is_dirty(&self) -> bool {
        self.fields.values().any(|f| f.is_dirty())
    }

    /// Names of fields that fail the local (cached + required) check.
    pub fn invalid_fields(&self) -> Vec<String> {
        self.fields
            .values()
            .filter(|f| !f.is_valid(self.status))
            .map(|f| f.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::field::{FieldProperties, StatusProperties};
    use crate::model::record::Values;
    use serde_json::json;

    fn defs() -> Vec<Arc<FieldDef>> {
        let mut name = FieldDef::new("name");
        name.properties = StatusProperties::uniform(FieldProperties {
            required: true,
            ..Default::default()
        });
        vec![Arc::new(FieldDef::new("id")), Arc::new(name)]
    }

    #[test]
    fn bind_mirrors_record_state() {
        let mut row = Row::new(0, &defs());
        assert_eq!(row.status(), Status::Na);

        let mut v = Values::new();
        v.insert("id".into(), json!(7));
        v.insert("name".into(), json!("x"));
        let rec = Record::fetched(RecordId(1), v);
        row.bind(&rec);
        assert_eq!(row.status(), Status::Update);
        assert_eq!(row.field("id").unwrap().value(), &json!(7));

        row.unbind();
        assert_eq!(row.status(), Status::Na);
        assert!(row.field("id").unwrap().value().is_null());
    }

    #[test]
    fn placeholder_row_reports_required_fields() {
        let mut row = Row::new(0, &defs());
        let rec = Record::placeholder(RecordId(1), ["id", "name"]);
        row.bind(&rec);
        assert_eq!(row.status(), Status::Insert);
        assert_eq!(row.invalid_fields(), vec!["name".to_string()]);
    }
}
