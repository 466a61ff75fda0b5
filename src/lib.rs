//! Blockform - record/block forms runtime
//!
//! This library provides the transaction engine behind data-entry forms:
//! blocks of rows bound to backend records, master/detail query cascades,
//! optimistic locking, deferred flush and cross-form commit/rollback.
//!
//! ## Architecture
//!
//! - **Model**: fields, rows and records with their state machine
//! - **Block/Form**: navigation, validation, insert/delete/lock/flush/undo
//! - **Connection**: session lifecycle, lock counting and keepalive over a
//!   pluggable transport (HTTP or in-memory)
//! - **Context**: explicitly owned application state shared by all forms
//!
//! ## Usage
//!
//! ```bash
//! cargo run --features native -- --form-file orders.toml
//! ```

// Record/field state machine
pub mod model;

// Error taxonomy
pub mod error;

// Configuration (CLI > env > defaults)
pub mod config;

// Backend plumbing
pub mod connection;
pub mod datasource;

// Engine
pub mod block;
pub mod form;
pub mod guard;
pub mod query;
pub mod transaction;

// Application state, events and presentation seams
pub mod context;
pub mod definition;
pub mod queue;
pub mod render;
pub mod triggers;

pub use block::{Allowed, Block, FlushStrategy};
pub use config::Config;
pub use connection::{
    Connection, ConnectionEvent, ConnectionSettings, HttpTransport, MemoryBackend, Outcome, Scope,
    Transport, Verb,
};
pub use context::ApplicationContext;
pub use datasource::{Column, Criterion, DataSource};
pub use definition::FormDefinition;
pub use error::{FormError, Result};
pub use form::{Direction, Form};
pub use model::{FieldDef, Record, RecordId, RecordState, Status, Values};
pub use query::{ChainId, Link};
pub use queue::{EventQueue, FieldAddress, InputEvent, InputTarget, Key};
pub use render::{Indicator, Message, NullRenderer, RecordView, RecordingRenderer, Renderer, Severity};
pub use triggers::{EventKind, TriggerEvent, TriggerRegistry, TriggerScope};
