//! Explicitly owned application state: configuration, triggers, renderer,
//! the event queue, backend connections and the open forms.
//!
//! Forms hold an `Arc<ApplicationContext>`; the context only keeps weak
//! references back to them.

use indexmap::IndexMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{Connection, ConnectionEvent, Transport};
use crate::error::{FormError, Result};
use crate::form::Form;
use crate::queue::EventQueue;
use crate::render::{Message, Renderer, Severity};
use crate::transaction;
use crate::triggers::TriggerRegistry;

pub struct ApplicationContext {
    config: Config,
    triggers: TriggerRegistry,
    renderer: Arc<dyn Renderer>,
    queue: EventQueue,
    connections: RwLock<IndexMap<String, Arc<Connection>>>,
    forms: Mutex<Vec<Weak<Form>>>,
    events: UnboundedSender<ConnectionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplicationContext {
    /// Inside a tokio runtime this also starts the connection event monitor
    /// and the queue watchdog.
    pub fn new(config: Config, renderer: Arc<dyn Renderer>) -> Arc<Self> {
        let (tx, rx) = unbounded_channel();
        let ctx = Arc::new(Self {
            config,
            triggers: TriggerRegistry::new(),
            renderer,
            queue: EventQueue::new(),
            connections: RwLock::new(IndexMap::new()),
            forms: Mutex::new(Vec::new()),
            events: tx,
            tasks: Mutex::new(Vec::new()),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let monitor = handle.spawn(monitor(Arc::downgrade(&ctx), rx));
                let watchdog = ctx.queue.spawn_watchdog(ctx.config.queue_watchdog());
                ctx.tasks_mut().extend([monitor, watchdog]);
            }
            Err(_) => log::warn!("context created outside a runtime; connection events are not monitored"),
        }
        ctx
    }

    fn tasks_mut(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }
    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Create a connection with the configured settings and listen to it.
    pub fn add_connection(&self, name: &str, transport: Arc<dyn Transport>) -> Arc<Connection> {
        let conn = Connection::new(name, transport, self.config.connection_settings());
        conn.subscribe(self.events.clone());
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), conn.clone());
        conn
    }

    pub fn connection(&self, name: &str) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| FormError::UnknownConnection(name.to_string()))
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub(crate) fn register_form(&self, form: &Arc<Form>) {
        let mut forms = self.forms.lock().unwrap_or_else(|e| e.into_inner());
        forms.retain(|f| f.strong_count() > 0);
        forms.push(Arc::downgrade(form));
    }

    /// Live forms in registration order.
    pub fn forms(&self) -> Vec<Arc<Form>> {
        self.forms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn form(&self, name: &str) -> Result<Arc<Form>> {
        self.forms()
            .into_iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| FormError::UnknownForm(name.to_string()))
    }

    pub fn message(&self, severity: Severity, title: &str, text: impl Into<String>) {
        self.renderer.message(&Message::new(severity, title, text));
    }

    /// Surface an error to the user. Backend failures use the configured
    /// severity.
    pub fn report(&self, err: &FormError) {
        let severity = match err {
            FormError::Backend { .. } | FormError::NotConnected(_) => {
                self.config.backend_error_severity
            }
            FormError::RecordChanged { .. } | FormError::RecordDeleted { .. } => Severity::Warning,
            FormError::TransactionConflict { .. } | FormError::TransactionRowAccess { .. } => {
                Severity::Severe
            }
            _ => Severity::Warning,
        };
        self.message(severity, "Error", err.to_string());
    }

    /// Validate, flush and commit every open form and session.
    pub async fn commit(self: &Arc<Self>) -> Result<bool> {
        transaction::commit(self).await
    }

    /// Discard everything not committed in every open form and session.
    pub async fn rollback(self: &Arc<Self>) -> Result<bool> {
        transaction::rollback(self).await
    }

    async fn on_connection_event(self: Arc<Self>, event: ConnectionEvent) -> Result<()> {
        match event {
            ConnectionEvent::TransactionWarning { connection, reason } => {
                self.message(
                    Severity::Warning,
                    "Transaction",
                    format!("{connection}: {reason}; commit or roll back soon"),
                );
            }
            ConnectionEvent::ForceRollback {
                connection,
                trx,
                reason,
            } => {
                let conn = self.connection(&connection)?;
                if conn.trx() != trx {
                    log::debug!("{connection}: forced rollback for an ended span ignored");
                    return Ok(());
                }
                self.message(
                    Severity::Warning,
                    "Transaction",
                    format!("{connection}: rolled back ({reason})"),
                );
                transaction::rollback(&self).await?;
            }
            ConnectionEvent::Released { connection } => {
                self.message(Severity::Info, "Connection", format!("{connection}: session released"));
            }
            ConnectionEvent::Disconnected { connection, reason } => {
                self.message(
                    self.config.backend_error_severity,
                    "Connection",
                    format!("{connection}: connection lost ({reason})"),
                );
            }
        }
        Ok(())
    }
}

impl Drop for ApplicationContext {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().map(std::mem::take).unwrap_or_default() {
            task.abort();
        }
    }
}

/// Replays connection events through the event queue so they never
/// interleave with user events.
async fn monitor(ctx: Weak<ApplicationContext>, mut rx: UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        log::debug!("connection event: {event:?}");
        let queue = ctx.queue.clone();
        let label = match &event {
            ConnectionEvent::TransactionWarning { .. } => "connection warning",
            ConnectionEvent::ForceRollback { .. } => "forced rollback",
            ConnectionEvent::Released { .. } => "session released",
            ConnectionEvent::Disconnected { .. } => "connection lost",
        };
        queue.queue(label, async move {
            let reporter = ctx.clone();
            if let Err(e) = ctx.on_connection_event(event).await {
                reporter.report(&e);
            }
            Ok(())
        });
    }
}
