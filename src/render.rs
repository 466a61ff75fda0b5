//! Rendering collaborator seam.
//!
//! The core only ever pushes state out through [`Renderer`]; it never reads
//! visual state back.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::model::{RecordId, Status, Values};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Severe,
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "severe" | "error" => Ok(Severity::Severe),
            _ => Err(anyhow::anyhow!(
                "Invalid severity '{s}'. Valid options: info, warning, severe"
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Message {
    pub severity: Severity,
    pub title: String,
    pub text: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl Message {
    pub fn new(severity: Severity, title: &str, text: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.to_string(),
            text: text.into(),
            at: chrono::Utc::now(),
        }
    }
}

/// Row indicator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Indicator {
    Current,
    Filter,
    Off,
}

/// What the renderer gets to show for one row.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordView {
    pub record: RecordId,
    pub status: Status,
    pub values: Values,
    pub failed: bool,
}

pub trait Renderer: Send + Sync {
    fn display(&self, block: &str, row: i32, view: &RecordView);
    fn clear(&self, block: &str, row: i32);
    fn set_indicator(&self, block: &str, row: i32, indicator: Indicator);
    fn mark_invalid(&self, block: &str, row: i32, field: &str, invalid: bool);
    fn focus(&self, block: &str, row: i32, field: &str);
    /// Stop (or resume) accepting input until further notice.
    fn block_input(&self, blocked: bool);
    fn message(&self, message: &Message);
}

#[derive(Default)]
pub struct NullRenderer;

impl Renderer for NullRenderer {
    fn display(&self, _block: &str, _row: i32, _view: &RecordView) {}
    fn clear(&self, _block: &str, _row: i32) {}
    fn set_indicator(&self, _block: &str, _row: i32, _indicator: Indicator) {}
    fn mark_invalid(&self, _block: &str, _row: i32, _field: &str, _invalid: bool) {}
    fn focus(&self, _block: &str, _row: i32, _field: &str) {}
    fn block_input(&self, _blocked: bool) {}
    fn message(&self, message: &Message) {
        log::info!("[{:?}] {}: {}", message.severity, message.title, message.text);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderCall {
    Display { block: String, row: i32, view: RecordView },
    Clear { block: String, row: i32 },
    Indicator { block: String, row: i32, indicator: Indicator },
    Invalid { block: String, row: i32, field: String, invalid: bool },
    Focus { block: String, row: i32, field: String },
    BlockInput(bool),
    Message(Message),
}

/// Keeps every call, for tests and the console.
#[derive(Default)]
pub struct RecordingRenderer {
    calls: Mutex<Vec<RenderCall>>,
}

impl RecordingRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: RenderCall) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take(&self) -> Vec<RenderCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RenderCall::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// Rows of `block` that were cleared, in call order.
    pub fn cleared(&self, block: &str) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RenderCall::Clear { block: b, row } if b == block => Some(row),
                _ => None,
            })
            .collect()
    }
}

impl Renderer for RecordingRenderer {
    fn display(&self, block: &str, row: i32, view: &RecordView) {
        self.push(RenderCall::Display {
            block: block.to_string(),
            row,
            view: view.clone(),
        });
    }
    fn clear(&self, block: &str, row: i32) {
        self.push(RenderCall::Clear {
            block: block.to_string(),
            row,
        });
    }
    fn set_indicator(&self, block: &str, row: i32, indicator: Indicator) {
        self.push(RenderCall::Indicator {
            block: block.to_string(),
            row,
            indicator,
        });
    }
    fn mark_invalid(&self, block: &str, row: i32, field: &str, invalid: bool) {
        self.push(RenderCall::Invalid {
            block: block.to_string(),
            row,
            field: field.to_string(),
            invalid,
        });
    }
    fn focus(&self, block: &str, row: i32, field: &str) {
        self.push(RenderCall::Focus {
            block: block.to_string(),
            row,
            field: field.to_string(),
        });
    }
    fn block_input(&self, blocked: bool) {
        self.push(RenderCall::BlockInput(blocked));
    }
    fn message(&self, message: &Message) {
        self.push(RenderCall::Message(message.clone()));
    }
}
