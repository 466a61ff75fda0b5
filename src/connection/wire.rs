//! JSON request/response envelope exchanged with the backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Values;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Connect,
    Disconnect,
    Select,
    Fetch,
    Lock,
    Insert,
    Update,
    Delete,
    Batch,
    Script,
    Call,
    Commit,
    Rollback,
    Release,
    Ping,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Connect => "connect",
            Verb::Disconnect => "disconnect",
            Verb::Select => "select",
            Verb::Fetch => "fetch",
            Verb::Lock => "lock",
            Verb::Insert => "insert",
            Verb::Update => "update",
            Verb::Delete => "delete",
            Verb::Batch => "batch",
            Verb::Script => "script",
            Verb::Call => "call",
            Verb::Commit => "commit",
            Verb::Rollback => "rollback",
            Verb::Release => "release",
            Verb::Ping => "ping",
        }
    }

    /// Safe to send again when the first outcome is unknown.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Verb::Select | Verb::Ping)
    }

    /// Changes backend state inside the current transaction.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Verb::Insert | Verb::Update | Verb::Delete | Verb::Batch | Verb::Script | Verb::Call
        )
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session persistence mode, fixed before connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Stateless,
    Dedicated,
    Transactional,
}

impl std::str::FromStr for Scope {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "stateless" => Ok(Scope::Stateless),
            "dedicated" => Ok(Scope::Dedicated),
            "transactional" => Ok(Scope::Transactional),
            _ => Err(anyhow::anyhow!(
                "Invalid scope '{s}'. Valid options: stateless, dedicated, transactional"
            )),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Stateless => write!(f, "stateless"),
            Scope::Dedicated => write!(f, "dedicated"),
            Scope::Transactional => write!(f, "transactional"),
        }
    }
}

/// Typed name/value pair. Used for both bind values and assert entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BindValue {
    pub name: String,
    pub value: Value,
    #[serde(rename = "type")]
    pub datatype: String,
}

impl BindValue {
    pub fn new(name: impl Into<String>, value: Value, datatype: &str) -> Self {
        Self {
            name: name.into(),
            value,
            datatype: datatype.to_string(),
        }
    }
}

pub type AssertValue = BindValue;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindvalues: Vec<BindValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assert: Vec<AssertValue>,
    /// Fetch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Rows to skip when a stateless cursor is replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    /// Sub-requests of a batch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statements: Vec<BatchStatement>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub patch: bool,
}

impl Request {
    pub fn sql(sql: impl Into<String>, bindvalues: Vec<BindValue>) -> Self {
        Self {
            sql: Some(sql.into()),
            bindvalues,
            ..Self::default()
        }
    }

    pub fn with_assert(mut self, assert: Vec<AssertValue>) -> Self {
        self.assert = assert;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchStatement {
    pub verb: Verb,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<bool>,
    /// `Some(false)` when an assert clause was evaluated and did not hold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected: Option<usize>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn message_or(&self, fallback: &str) -> String {
        self.message.clone().unwrap_or_else(|| fallback.to_string())
    }

    /// Rows zipped with column names.
    pub fn records(&self) -> Vec<Values> {
        let Some(columns) = &self.columns else {
            return Vec::new();
        };
        self.rows
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Values>()
            })
            .collect()
    }

    pub fn assert_failed(&self) -> bool {
        !self.success && self.assert == Some(false)
    }
}
