//! Typed lifecycle trigger registry.
//!
//! Handles are registered per [`EventKind`] with a [`TriggerScope`] that
//! limits which form/block/field events they may observe. Firing returns
//! false as soon as one handle rejects, errors or panics.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::model::RecordId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PreForm,
    PostForm,
    PreBlock,
    PostBlock,
    PreRecord,
    PostRecord,
    PreField,
    PostField,
    OnNewForm,
    OnEdit,
    OnFetch,
    OnCreateRecord,
    OnTransaction,
    OnLock,
    OnUndo,
    WhenValidateField,
    WhenValidateRecord,
    PreQuery,
    PostQuery,
    PreInsert,
    PreUpdate,
    PreDelete,
    PreCommit,
    PostCommit,
}

/// What a trigger is told about the point it fires at.
#[derive(Clone, Debug, PartialEq)]
pub struct TriggerEvent {
    pub kind: EventKind,
    pub form: String,
    pub block: Option<String>,
    pub field: Option<String>,
    pub row: Option<i32>,
    pub record: Option<RecordId>,
}

impl TriggerEvent {
    pub fn form(kind: EventKind, form: &str) -> Self {
        Self {
            kind,
            form: form.to_string(),
            block: None,
            field: None,
            row: None,
            record: None,
        }
    }

    pub fn block(kind: EventKind, form: &str, block: &str) -> Self {
        Self {
            block: Some(block.to_string()),
            ..Self::form(kind, form)
        }
    }

    pub fn with_field(mut self, field: Option<&str>) -> Self {
        self.field = field.map(str::to_string);
        self
    }

    pub fn at(mut self, row: i32, record: Option<RecordId>) -> Self {
        self.row = Some(row);
        self.record = record;
        self
    }
}

/// Which events a handle is allowed to see. `None` matches anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerScope {
    pub form: Option<String>,
    pub block: Option<String>,
    pub field: Option<String>,
}

impl TriggerScope {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn form(form: &str) -> Self {
        Self {
            form: Some(form.to_string()),
            ..Self::default()
        }
    }

    pub fn block(form: &str, block: &str) -> Self {
        Self {
            block: Some(block.to_string()),
            ..Self::form(form)
        }
    }

    pub fn field(form: &str, block: &str, field: &str) -> Self {
        Self {
            field: Some(field.to_string()),
            ..Self::block(form, block)
        }
    }

    fn admits(&self, event: &TriggerEvent) -> bool {
        fn ok(want: &Option<String>, got: Option<&str>) -> bool {
            match want {
                None => true,
                Some(w) => got == Some(w.as_str()),
            }
        }
        ok(&self.form, Some(&event.form))
            && ok(&self.block, event.block.as_deref())
            && ok(&self.field, event.field.as_deref())
    }
}

pub type TriggerFuture = BoxFuture<'static, anyhow::Result<bool>>;
type TriggerFn = Arc<dyn Fn(TriggerEvent) -> TriggerFuture + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

#[derive(Clone)]
struct Handle {
    id: HandleId,
    name: String,
    scope: TriggerScope,
    callback: TriggerFn,
}

#[derive(Default)]
pub struct TriggerRegistry {
    handles: RwLock<HashMap<EventKind, Vec<Handle>>>,
    next_id: AtomicU64,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async trigger.
    pub fn on<F, Fut>(&self, kind: EventKind, scope: TriggerScope, name: &str, f: F) -> HandleId
    where
        F: Fn(TriggerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let callback: TriggerFn = Arc::new(move |ev| f(ev).boxed());
        let handle = Handle {
            id,
            name: name.to_string(),
            scope,
            callback,
        };
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(handle);
        id
    }

    /// Register a synchronous trigger.
    pub fn on_sync<F>(&self, kind: EventKind, scope: TriggerScope, name: &str, f: F) -> HandleId
    where
        F: Fn(&TriggerEvent) -> bool + Send + Sync + 'static,
    {
        self.on(kind, scope, name, move |ev| {
            let r = f(&ev);
            async move { Ok(r) }
        })
    }

    pub fn remove(&self, id: HandleId) -> bool {
        let mut map = self.handles.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        for list in map.values_mut() {
            let before = list.len();
            list.retain(|h| h.id != id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn has(&self, kind: EventKind) -> bool {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|l| !l.is_empty())
            .unwrap_or(false)
    }

    /// Run every admitted handle in registration order.
    pub async fn fire(&self, event: TriggerEvent) -> bool {
        let matching: Vec<Handle> = {
            let map = self.handles.read().unwrap_or_else(|e| e.into_inner());
            match map.get(&event.kind) {
                Some(list) => list
                    .iter()
                    .filter(|h| h.scope.admits(&event))
                    .cloned()
                    .collect(),
                None => return true,
            }
        };

        for handle in matching {
            let call = async { (handle.callback)(event.clone()).await };
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    log::debug!("trigger '{}' rejected {:?}", handle.name, event.kind);
                    return false;
                }
                Ok(Err(e)) => {
                    log::error!(
                        "trigger '{}' failed on {:?} (form={}, block={:?}): {e:#}",
                        handle.name,
                        event.kind,
                        event.form,
                        event.block
                    );
                    return false;
                }
                Err(_) => {
                    log::error!(
                        "trigger '{}' panicked on {:?} (form={}, block={:?})",
                        handle.name,
                        event.kind,
                        event.form,
                        event.block
                    );
                    return false;
                }
            }
        }
        true
    }
}
