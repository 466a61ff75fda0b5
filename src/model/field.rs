use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::status::Status;

/// Column data type, also used as the `type` of wire bind values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    Datetime,
}

impl DataType {
    pub fn wire_name(self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Integer => "integer",
            DataType::Decimal => "decimal",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Datetime => "datetime",
        }
    }

    /// Parse user text. Empty text is null.
    pub fn parse(self, raw: &str) -> Result<Value, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            DataType::String => Ok(Value::String(raw.to_string())),
            DataType::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{raw}' is not an integer")),
            DataType::Decimal => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{raw}' is not a number")),
            DataType::Boolean => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "0" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("'{raw}' is not a boolean")),
            },
            DataType::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|_| format!("'{raw}' is not a date (YYYY-MM-DD)")),
            DataType::Datetime => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
                .map(|d| Value::String(d.format("%Y-%m-%dT%H:%M:%S").to_string()))
                .map_err(|_| format!("'{raw}' is not a datetime")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: Value,
    #[serde(default)]
    pub label: Option<String>,
}

/// Visual implementation of a field. Every kind answers the same three
/// questions: how raw input becomes a value, how a value is shown, and
/// whether the kind takes input at all.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldKind {
    Display,
    #[default]
    Input,
    Textarea,
    Select {
        #[serde(default)]
        options: Vec<SelectOption>,
    },
    Radio,
    Checkbox {
        #[serde(default = "checked_default")]
        checked: Value,
        #[serde(default = "unchecked_default")]
        unchecked: Value,
    },
}

fn checked_default() -> Value {
    Value::Bool(true)
}
fn unchecked_default() -> Value {
    Value::Bool(false)
}

impl FieldKind {
    pub fn accepts_input(&self) -> bool {
        !matches!(self, FieldKind::Display)
    }

    pub fn parse_input(&self, raw: &str, datatype: DataType) -> Result<Value, String> {
        match self {
            FieldKind::Display => Err("display fields take no input".to_string()),
            FieldKind::Input | FieldKind::Textarea | FieldKind::Radio => datatype.parse(raw),
            FieldKind::Select { options } => {
                if raw.trim().is_empty() {
                    return Ok(Value::Null);
                }
                let v = datatype.parse(raw)?;
                if options.is_empty() || options.iter().any(|o| o.value == v) {
                    Ok(v)
                } else {
                    Err(format!("'{raw}' is not one of the options"))
                }
            }
            FieldKind::Checkbox { checked, unchecked } => {
                let on = matches!(
                    raw.trim().to_ascii_lowercase().as_str(),
                    "true" | "on" | "1" | "yes" | "checked"
                );
                Ok(if on { checked.clone() } else { unchecked.clone() })
            }
        }
    }

    pub fn format(&self, value: &Value) -> String {
        match (self, value) {
            (_, Value::Null) => String::new(),
            (FieldKind::Select { options }, v) => options
                .iter()
                .find(|o| &o.value == v)
                .and_then(|o| o.label.clone())
                .unwrap_or_else(|| plain(v)),
            (FieldKind::Checkbox { checked, .. }, v) => {
                if v == checked { "true".into() } else { "false".into() }
            }
            (_, v) => plain(v),
        }
    }
}

fn plain(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldProperties {
    pub enabled: bool,
    pub readonly: bool,
    pub required: bool,
    pub hidden: bool,
}

impl Default for FieldProperties {
    fn default() -> Self {
        Self {
            enabled: true,
            readonly: false,
            required: false,
            hidden: false,
        }
    }
}

/// One immutable property snapshot per row status.
#[derive(Clone, Debug, Default)]
pub struct StatusProperties {
    pub qbe: Arc<FieldProperties>,
    pub insert: Arc<FieldProperties>,
    pub update: Arc<FieldProperties>,
}

impl StatusProperties {
    /// Same properties in every status, except that query filters never
    /// inherit `required`.
    pub fn uniform(props: FieldProperties) -> Self {
        let qbe = FieldProperties {
            required: false,
            readonly: false,
            ..props.clone()
        };
        let shared = Arc::new(props);
        Self {
            qbe: Arc::new(qbe),
            insert: shared.clone(),
            update: shared,
        }
    }

    pub fn for_status(&self, status: Status) -> Option<&FieldProperties> {
        match status {
            Status::Qbe => Some(&self.qbe),
            Status::New | Status::Insert => Some(&self.insert),
            Status::Update | Status::Delete => Some(&self.update),
            Status::Na => None,
        }
    }
}

/// Block-level description of a field, shared by every row.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub column: Option<String>,
    pub kind: FieldKind,
    pub datatype: DataType,
    pub properties: StatusProperties,
    pub instances: usize,
}

impl FieldDef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: Some(name.clone()),
            name,
            kind: FieldKind::Input,
            datatype: DataType::String,
            properties: StatusProperties::default(),
            instances: 1,
        }
    }

    pub fn required_in(&self, status: Status) -> bool {
        self.properties
            .for_status(status)
            .map(|p| p.required)
            .unwrap_or(false)
    }

    pub fn editable_in(&self, status: Status) -> bool {
        self.kind.accepts_input()
            && self
                .properties
                .for_status(status)
                .map(|p| p.enabled && !p.readonly)
                .unwrap_or(false)
            && status != Status::Delete
    }
}

/// One visual binding of a field.
#[derive(Clone, Debug, Default)]
pub struct FieldInstance {
    intermediate: String,
    value: Value,
}

impl FieldInstance {
    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn intermediate_value(&self) -> &str {
        &self.intermediate
    }
}

/// A field in one row slot.
#[derive(Clone, Debug)]
pub struct Field {
    def: Arc<FieldDef>,
    value: Value,
    dirty: bool,
    valid: bool,
    error: Option<String>,
    instances: Vec<FieldInstance>,
}

impl Field {
    pub fn new(def: Arc<FieldDef>) -> Self {
        let n = def.instances.max(1);
        Self {
            def,
            value: Value::Null,
            dirty: false,
            valid: true,
            error: None,
            instances: vec![FieldInstance::default(); n],
        }
    }

    pub fn def(&self) -> &Arc<FieldDef> {
        &self.def
    }
    pub fn name(&self) -> &str {
        &self.def.name
    }
    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
    pub fn instances(&self) -> &[FieldInstance] {
        &self.instances
    }
    pub fn instance(&self, idx: usize) -> Option<&FieldInstance> {
        self.instances.get(idx)
    }

    /// Cached validity combined with the required check for `status`.
    pub fn is_valid(&self, status: Status) -> bool {
        if self.def.required_in(status) && self.pending_value().is_null() {
            return false;
        }
        self.valid
    }

    /// Load a value coming from the record; the field becomes clean.
    pub fn load(&mut self, value: Value) {
        self.value = value;
        self.dirty = false;
        self.valid = true;
        self.error = None;
        self.distribute();
    }

    /// Raw user input on one instance. Marks the field dirty when the parsed
    /// value differs from the canonical one.
    pub fn input(&mut self, instance: usize, raw: &str) -> Result<bool, String> {
        let idx = instance.min(self.instances.len() - 1);
        let parsed = self.def.kind.parse_input(raw, self.def.datatype);
        let inst = &mut self.instances[idx];
        inst.intermediate = raw.to_string();
        match parsed {
            Ok(v) => {
                inst.value = v;
                self.dirty = inst.value != self.value;
                self.error = None;
                Ok(self.dirty)
            }
            Err(msg) => {
                self.dirty = true;
                self.valid = false;
                self.error = Some(msg.clone());
                Err(msg)
            }
        }
    }

    /// Query-by-example input. The text is kept verbatim and parsed into a
    /// criterion when the query runs.
    pub fn input_filter(&mut self, instance: usize, raw: &str) {
        let idx = instance.min(self.instances.len() - 1);
        let text = raw.trim();
        let inst = &mut self.instances[idx];
        inst.intermediate = raw.to_string();
        inst.value = if text.is_empty() {
            Value::Null
        } else {
            Value::String(text.to_string())
        };
        self.dirty = inst.value != self.value;
        self.valid = true;
        self.error = None;
    }

    /// The value the user last typed, on whichever instance differs.
    pub fn pending_value(&self) -> &Value {
        self.instances
            .iter()
            .find(|i| i.value != self.value)
            .map(|i| &i.value)
            .unwrap_or(&self.value)
    }

    /// Adopt the pending value as canonical and copy it to every instance.
    pub fn accept(&mut self) -> Value {
        self.value = self.pending_value().clone();
        self.distribute();
        self.value.clone()
    }

    pub fn distribute(&mut self) {
        let text = self.def.kind.format(&self.value);
        for inst in &mut self.instances {
            inst.value = self.value.clone();
            inst.intermediate = text.clone();
        }
    }

    pub fn set_validated(&mut self, valid: bool) {
        self.valid = valid;
        if valid {
            self.dirty = false;
            self.error = None;
        }
    }

    pub fn clear(&mut self) {
        self.load(Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(kind: FieldKind, datatype: DataType, required: bool, instances: usize) -> Arc<FieldDef> {
        Arc::new(FieldDef {
            kind,
            datatype,
            instances,
            properties: StatusProperties::uniform(FieldProperties {
                required,
                ..Default::default()
            }),
            ..FieldDef::new("f")
        })
    }

    #[test]
    fn input_marks_dirty_only_on_change() {
        let mut f = Field::new(def(FieldKind::Input, DataType::Integer, false, 1));
        f.load(json!(5));
        assert_eq!(f.input(0, "5"), Ok(false));
        assert!(!f.is_dirty());
        assert_eq!(f.input(0, "6"), Ok(true));
        assert!(f.is_dirty());
        assert_eq!(f.instance(0).unwrap().intermediate_value(), "6");
    }

    #[test]
    fn parse_error_invalidates() {
        let mut f = Field::new(def(FieldKind::Input, DataType::Integer, false, 1));
        assert!(f.input(0, "abc").is_err());
        assert!(!f.is_valid(Status::Update));
        assert!(f.error().is_some());
    }

    #[test]
    fn accept_distributes_to_every_instance() {
        let mut f = Field::new(def(FieldKind::Input, DataType::String, false, 3));
        f.input(1, "hello").unwrap();
        assert_eq!(f.accept(), json!("hello"));
        for inst in f.instances() {
            assert_eq!(inst.value(), &json!("hello"));
            assert_eq!(inst.intermediate_value(), "hello");
        }
    }

    #[test]
    fn required_is_checked_on_read_per_status() {
        let mut f = Field::new(def(FieldKind::Input, DataType::String, true, 1));
        f.set_validated(true);
        assert!(!f.is_valid(Status::Insert));
        // query filters never require a value
        assert!(f.is_valid(Status::Qbe));
        f.load(json!("x"));
        assert!(f.is_valid(Status::Insert));
    }

    #[test]
    fn kinds_share_one_interface() {
        let cb = FieldKind::Checkbox {
            checked: json!("Y"),
            unchecked: json!("N"),
        };
        assert_eq!(cb.parse_input("on", DataType::String), Ok(json!("Y")));
        assert_eq!(cb.parse_input("", DataType::String), Ok(json!("N")));
        assert_eq!(cb.format(&json!("Y")), "true");

        let sel = FieldKind::Select {
            options: vec![
                SelectOption { value: json!("A"), label: Some("Alpha".into()) },
                SelectOption { value: json!("B"), label: None },
            ],
        };
        assert_eq!(sel.parse_input("A", DataType::String), Ok(json!("A")));
        assert!(sel.parse_input("C", DataType::String).is_err());
        assert_eq!(sel.format(&json!("A")), "Alpha");
        assert!(!FieldKind::Display.accepts_input());
    }

    #[test]
    fn dates_are_normalized() {
        assert_eq!(DataType::Date.parse("2024-02-03"), Ok(json!("2024-02-03")));
        assert!(DataType::Date.parse("03/02/2024").is_err());
        assert_eq!(DataType::Decimal.parse("1.5"), Ok(json!(1.5)));
        assert_eq!(DataType::String.parse("  "), Ok(Value::Null));
    }
}
