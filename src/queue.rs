//! Cooperative event queue.
//!
//! Every business-logic entry goes through here. Items are pushed to the
//! front and drained from the back, one at a time, each awaited to
//! completion before the next one starts. A failed item drops everything
//! still queued.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub type Invocation = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputKind {
    Change,
    KeyDown,
    KeyUp,
    Focus,
    Blur,
    Click,
}

/// Logical keys the core reacts to. Character keys only update the
/// intermediate value and never reach the core as `Key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Enter,
    NextField,
    PrevField,
    NextRecord,
    PrevRecord,
    PageDown,
    PageUp,
    InsertBefore,
    InsertAfter,
    Delete,
    EnterQuery,
    ExecuteQuery,
    Lock,
    Commit,
    Rollback,
}

/// Raw input from a field instance.
#[derive(Clone, Debug, PartialEq)]
pub struct InputEvent {
    pub kind: InputKind,
    pub key: Option<Key>,
    pub value: Option<String>,
}

impl InputEvent {
    pub fn change(value: impl Into<String>) -> Self {
        Self {
            kind: InputKind::Change,
            key: None,
            value: Some(value.into()),
        }
    }

    pub fn key(key: Key) -> Self {
        Self {
            kind: InputKind::KeyDown,
            key: Some(key),
            value: None,
        }
    }

    pub fn blur() -> Self {
        Self {
            kind: InputKind::Blur,
            key: None,
            value: None,
        }
    }

    pub fn focus() -> Self {
        Self {
            kind: InputKind::Focus,
            key: None,
            value: None,
        }
    }
}

/// Where a field-originated event came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldAddress {
    pub block: String,
    pub field: String,
    pub row: i32,
}

impl FieldAddress {
    pub fn new(block: &str, field: &str, row: i32) -> Self {
        Self {
            block: block.to_string(),
            field: field.to_string(),
            row,
        }
    }
}

/// Receiver of field input. Implemented by forms.
#[async_trait]
pub trait InputTarget: Send + Sync {
    async fn on_input(
        &self,
        address: &FieldAddress,
        instance: usize,
        event: InputEvent,
    ) -> anyhow::Result<()>;
}

struct QueuedEvent {
    label: String,
    invocation: Invocation,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedEvent>,
    running: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    idle: Notify,
    processed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Default)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push without starting a drain.
    pub fn enqueue(&self, label: &str, invocation: Invocation) {
        let mut st = self.state();
        st.items.push_front(QueuedEvent {
            label: label.to_string(),
            invocation,
        });
        log::debug!("queue: +{label} (pending={})", st.items.len());
    }

    /// Queue a plain invocation and make sure a drain is scheduled.
    pub fn queue<F>(&self, label: &str, invocation: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.enqueue(label, invocation.boxed());
        self.kick();
    }

    /// Queue a field-originated event. The raw event is cloned now so later
    /// mutation by the caller cannot reach the queued copy.
    pub fn stack(
        &self,
        target: Arc<dyn InputTarget>,
        address: FieldAddress,
        instance: usize,
        raw: &InputEvent,
    ) {
        let event = raw.clone();
        let label = format!("{}.{}[{}] {:?}", address.block, address.field, address.row, event.kind);
        self.queue(&label, async move { target.on_input(&address, instance, event).await });
    }

    fn kick(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let q = self.clone();
                handle.spawn(async move { q.drain().await });
            }
            Err(_) => log::debug!("queue: no runtime, waiting for watchdog"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    pub fn pending(&self) -> usize {
        self.state().items.len()
    }

    pub fn processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Run queued items oldest-first until empty. Returns immediately when
    /// another drain is already running.
    pub async fn drain(&self) {
        {
            let mut st = self.state();
            if st.running || st.items.is_empty() {
                return;
            }
            st.running = true;
        }

        loop {
            let next = {
                let mut st = self.state();
                match st.items.pop_back() {
                    Some(ev) => ev,
                    None => {
                        st.running = false;
                        drop(st);
                        self.inner.idle.notify_waiters();
                        return;
                    }
                }
            };

            let label = next.label;
            let outcome = AssertUnwindSafe(next.invocation).catch_unwind().await;
            self.inner.processed.fetch_add(1, Ordering::Relaxed);
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(_) => Some("panicked".to_string()),
            };
            if let Some(reason) = failure {
                let dropped = {
                    let mut st = self.state();
                    let n = st.items.len();
                    st.items.clear();
                    st.running = false;
                    n
                };
                self.inner.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                log::error!("queue: '{label}' failed ({reason}); dropped {dropped} pending events");
                self.inner.idle.notify_waiters();
                return;
            }

            tokio::task::yield_now().await;
        }
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let st = self.state();
                if !st.running && st.items.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Restart draining when items are stuck behind a released flag.
    pub fn spawn_watchdog(&self, period: Duration) -> JoinHandle<()> {
        let q = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let stuck = {
                    let st = q.state();
                    !st.running && !st.items.is_empty()
                };
                if stuck {
                    log::debug!("queue watchdog: restarting drain");
                    q.drain().await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn handlers_never_interleave() {
        let q = EventQueue::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let (a, m, o) = (active.clone(), max_seen.clone(), order.clone());
            q.queue("step", async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
                o.lock().unwrap().push(i);
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        q.wait_idle().await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert_eq!(q.processed(), 16);
    }

    #[tokio::test]
    async fn failure_drops_pending_and_releases() {
        let q = EventQueue::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            let r = ran.clone();
            q.enqueue(
                name,
                async move {
                    r.lock().unwrap().push(name);
                    if fail {
                        anyhow::bail!("handler failed");
                    }
                    Ok(())
                }
                .boxed(),
            );
        }
        q.drain().await;
        assert_eq!(*ran.lock().unwrap(), vec!["a", "b"]);
        assert!(!q.is_running());
        assert_eq!(q.pending(), 0);
        assert_eq!(q.dropped(), 1);

        // the queue keeps working afterwards
        let r = ran.clone();
        q.queue("d", async move {
            r.lock().unwrap().push("d");
            Ok(())
        });
        q.wait_idle().await;
        assert_eq!(ran.lock().unwrap().last(), Some(&"d"));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let q = EventQueue::new();
        q.enqueue("boom", async { panic!("handler bug") }.boxed());
        q.drain().await;
        assert!(!q.is_running());
    }

    #[tokio::test]
    async fn watchdog_restarts_stuck_queue() {
        let q = EventQueue::new();
        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        q.enqueue(
            "late",
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed(),
        );
        let dog = q.spawn_watchdog(Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(2), q.wait_idle())
            .await
            .expect("watchdog drained the queue");
        dog.abort();
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    struct Capture(Mutex<Vec<InputEvent>>);

    #[async_trait]
    impl InputTarget for Capture {
        async fn on_input(
            &self,
            _address: &FieldAddress,
            _instance: usize,
            event: InputEvent,
        ) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stack_clones_raw_event() {
        let q = EventQueue::new();
        let target = Arc::new(Capture(Mutex::new(Vec::new())));
        let mut raw = InputEvent::change("first");
        q.enqueue("hold", async { Ok(()) }.boxed());
        q.stack(target.clone(), FieldAddress::new("b", "f", 0), 0, &raw);
        raw.value = Some("mutated".into());
        q.wait_idle().await;
        let seen = target.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value.as_deref(), Some("first"));
    }
}
