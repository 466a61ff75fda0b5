//! Table binding of a block and the statements generated for it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::{AssertValue, BindValue};
use crate::model::{DataType, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Like => "like",
            Operator::IsNull => "is null",
            Operator::IsNotNull => "is not null",
        }
    }

    pub fn from_sql(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Operator::Eq),
            "<>" | "!=" => Some(Operator::Ne),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Le),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Ge),
            _ => None,
        }
    }
}

/// One query-by-example filter.
#[derive(Clone, Debug, PartialEq)]
pub struct Criterion {
    pub column: String,
    pub op: Operator,
    pub value: Value,
    pub datatype: DataType,
}

impl Criterion {
    pub fn eq(column: &str, value: Value, datatype: DataType) -> Self {
        Self {
            column: column.to_string(),
            op: Operator::Eq,
            value,
            datatype,
        }
    }
}

/// Turn the text typed into a QBE field into a criterion.
///
/// `<`, `<=`, `>`, `>=`, `<>`/`!=` and `=` prefixes select the comparison,
/// `%` or `_` in a string makes a `like`, `null` and `not null` test for
/// null. Empty text means no filter.
pub fn parse_criterion(
    column: &str,
    datatype: DataType,
    text: &str,
) -> Result<Option<Criterion>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let crit = |op, value| Criterion {
        column: column.to_string(),
        op,
        value,
        datatype,
    };
    match text.to_ascii_lowercase().as_str() {
        "null" => return Ok(Some(crit(Operator::IsNull, Value::Null))),
        "not null" => return Ok(Some(crit(Operator::IsNotNull, Value::Null))),
        _ => {}
    }
    for prefix in ["<=", ">=", "<>", "!=", "<", ">", "="] {
        if let Some(rest) = text.strip_prefix(prefix) {
            let rest = rest.trim();
            if rest.is_empty() {
                return Err(format!("'{text}' has no value after '{prefix}'"));
            }
            let op = Operator::from_sql(prefix).unwrap_or(Operator::Eq);
            return Ok(Some(crit(op, datatype.parse(rest)?)));
        }
    }
    if datatype == DataType::String && (text.contains('%') || text.contains('_')) {
        return Ok(Some(crit(Operator::Like, Value::String(text.to_string()))));
    }
    Ok(Some(crit(Operator::Eq, datatype.parse(text)?)))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default)]
    pub datatype: DataType,
}

/// Generated SQL plus its bind values.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub bindvalues: Vec<BindValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataSource {
    pub table: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    /// `order by` terms, e.g. `id` or `created desc`.
    pub order_by: Vec<String>,
}

impl DataSource {
    pub fn new(table: &str, columns: Vec<Column>, primary_key: Vec<String>) -> Self {
        Self {
            table: table.to_string(),
            columns,
            primary_key,
            order_by: Vec::new(),
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn datatype(&self, column: &str) -> DataType {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.datatype)
            .unwrap_or_default()
    }

    fn bind(&self, name: String, column: &str, value: Value) -> BindValue {
        BindValue::new(name, value, self.datatype(column).wire_name())
    }

    fn column_list(&self) -> String {
        self.column_names().collect::<Vec<_>>().join(", ")
    }

    /// Key condition built from what the backend last confirmed.
    fn key_clause(&self, record: &Record) -> (String, Vec<BindValue>) {
        let mut terms = Vec::new();
        let mut binds = Vec::new();
        for (i, col) in self.primary_key.iter().enumerate() {
            let name = format!("k{i}");
            terms.push(format!("{col} = :{name}"));
            let v = record.initial().get(col).cloned().unwrap_or(Value::Null);
            binds.push(self.bind(name, col, v));
        }
        (terms.join(" and "), binds)
    }

    /// Expected current backend state of `record`.
    pub fn asserts(&self, record: &Record) -> Vec<AssertValue> {
        self.columns
            .iter()
            .filter(|c| !self.primary_key.contains(&c.name))
            .filter_map(|c| {
                record
                    .initial()
                    .get(&c.name)
                    .map(|v| BindValue::new(c.name.clone(), v.clone(), c.datatype.wire_name()))
            })
            .collect()
    }

    pub fn select(&self, criteria: &[Criterion]) -> Statement {
        let mut sql = format!("select {} from {}", self.column_list(), self.table);
        let mut binds = Vec::new();
        let mut terms = Vec::new();
        for (i, c) in criteria.iter().enumerate() {
            match c.op {
                Operator::IsNull | Operator::IsNotNull => {
                    terms.push(format!("{} {}", c.column, c.op.sql()));
                }
                op => {
                    let name = format!("w{i}");
                    terms.push(format!("{} {} :{name}", c.column, op.sql()));
                    binds.push(BindValue::new(name, c.value.clone(), c.datatype.wire_name()));
                }
            }
        }
        if !terms.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&terms.join(" and "));
        }
        if !self.order_by.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(&self.order_by.join(", "));
        }
        Statement { sql, bindvalues: binds }
    }

    pub fn lock(&self, record: &Record) -> (Statement, Vec<AssertValue>) {
        let (clause, binds) = self.key_clause(record);
        let sql = format!(
            "select {} from {} where {clause} for update",
            self.column_list(),
            self.table
        );
        (Statement { sql, bindvalues: binds }, self.asserts(record))
    }

    pub fn insert(&self, record: &Record) -> Statement {
        let mut cols = Vec::new();
        let mut names = Vec::new();
        let mut binds = Vec::new();
        for (i, c) in self.columns.iter().enumerate() {
            let name = format!("v{i}");
            cols.push(c.name.clone());
            names.push(format!(":{name}"));
            let v = record.get(&c.name).cloned().unwrap_or(Value::Null);
            binds.push(BindValue::new(name, v, c.datatype.wire_name()));
        }
        let sql = format!(
            "insert into {} ({}) values ({})",
            self.table,
            cols.join(", "),
            names.join(", ")
        );
        Statement { sql, bindvalues: binds }
    }

    /// `None` when no column differs from the last confirmed state.
    pub fn update(&self, record: &Record) -> Option<(Statement, Vec<AssertValue>)> {
        let changed: Vec<String> = record
            .changed_columns()
            .into_iter()
            .filter(|c| self.columns.iter().any(|col| col.name == *c))
            .map(str::to_string)
            .collect();
        if changed.is_empty() {
            return None;
        }
        let mut sets = Vec::new();
        let mut binds = Vec::new();
        for (i, col) in changed.iter().enumerate() {
            let name = format!("s{i}");
            sets.push(format!("{col} = :{name}"));
            let v = record.get(col).cloned().unwrap_or(Value::Null);
            binds.push(self.bind(name, col, v));
        }
        let (clause, key_binds) = self.key_clause(record);
        binds.extend(key_binds);
        let sql = format!("update {} set {} where {clause}", self.table, sets.join(", "));
        Some((Statement { sql, bindvalues: binds }, self.asserts(record)))
    }

    pub fn delete(&self, record: &Record) -> (Statement, Vec<AssertValue>) {
        let (clause, binds) = self.key_clause(record);
        let sql = format!("delete from {} where {clause}", self.table);
        (Statement { sql, bindvalues: binds }, self.asserts(record))
    }
}
