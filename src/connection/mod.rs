//! Backend session: scope, lock counter, optimistic asserts, commit and
//! rollback, and the keepalive monitor.
//!
//! The lock counter and the transaction token are owned here; everything
//! else only reads them.

pub mod cursor;
pub mod keepalive;
pub mod memory;
pub mod transport;
pub mod wire;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{FormError, Result};
use crate::model::Values;

pub use cursor::{Cursor, TrxToken};
pub use keepalive::{KeepaliveAction, KeepaliveView};
pub use memory::MemoryBackend;
pub use transport::{HttpTransport, Transport};
pub use wire::{AssertValue, BatchStatement, BindValue, Request, Response, Scope, Verb};

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionSettings {
    pub scope: Scope,
    pub keepalive: Duration,
    pub transaction_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_locks: usize,
    /// Consecutive failed pings tolerated before the session counts as lost.
    pub keepalive_failures: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            scope: Scope::Transactional,
            keepalive: Duration::from_secs(20),
            transaction_timeout: Duration::from_secs(240),
            connection_timeout: Duration::from_secs(600),
            max_locks: 64,
            keepalive_failures: 3,
        }
    }
}

/// Things the connection tells the application about on its own initiative.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    TransactionWarning { connection: String, reason: String },
    ForceRollback { connection: String, trx: TrxToken, reason: String },
    Released { connection: String },
    Disconnected { connection: String, reason: String },
}

/// Result of a call that carries an assert clause.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Applied. `first_lock` is set on the lock that opened a lock span.
    Done { first_lock: bool },
    /// Another session changed the row. `fresh` is the current backend copy.
    Changed {
        violations: Vec<String>,
        fresh: Option<Values>,
    },
    /// The row no longer exists.
    Vanished,
    /// Failed for a reason unrelated to the assert.
    Refused(String),
}

impl Outcome {
    fn from_response(resp: &Response) -> Self {
        if resp.success {
            return Outcome::Done { first_lock: false };
        }
        if resp.assert_failed() {
            let fresh = resp.records().into_iter().next();
            let violations = resp.violations.clone().unwrap_or_default();
            if violations.is_empty() && fresh.is_none() {
                return Outcome::Vanished;
            }
            return Outcome::Changed { violations, fresh };
        }
        Outcome::Refused(resp.message_or("request refused"))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Outcome::Done { .. })
    }
}

/// A page of rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fetched {
    pub rows: Vec<Values>,
    pub more: bool,
}

struct ConnState {
    connected: bool,
    session: Option<String>,
    trx: TrxToken,
    locks: usize,
    in_transaction: bool,
    modified: Option<Instant>,
    touched: Instant,
    last_request: Instant,
    warned: bool,
}

pub struct Connection {
    name: String,
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnState>,
    events: Mutex<Option<UnboundedSender<ConnectionEvent>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(name: &str, transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            name: name.to_string(),
            settings,
            transport,
            state: Mutex::new(ConnState {
                connected: false,
                session: None,
                trx: TrxToken(0),
                locks: 0,
                in_transaction: false,
                modified: None,
                touched: now,
                last_request: now,
                warned: false,
            }),
            events: Mutex::new(None),
            keepalive: Mutex::new(None),
        })
    }

    fn st(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }
    pub fn scope(&self) -> Scope {
        self.settings.scope
    }
    pub fn is_connected(&self) -> bool {
        self.st().connected
    }
    pub fn session(&self) -> Option<String> {
        self.st().session.clone()
    }
    pub fn trx(&self) -> TrxToken {
        self.st().trx
    }
    pub fn locks(&self) -> usize {
        self.st().locks
    }
    /// Locks held or changes flushed since the last commit/rollback.
    pub fn in_transaction(&self) -> bool {
        let st = self.st();
        st.in_transaction || st.locks > 0
    }
    pub fn modified(&self) -> Option<Instant> {
        self.st().modified
    }
    pub fn touched(&self) -> Instant {
        self.st().touched
    }
    pub fn warned(&self) -> bool {
        self.st().warned
    }

    pub fn keepalive_view(&self) -> KeepaliveView {
        let st = self.st();
        KeepaliveView {
            scope: self.settings.scope,
            connected: st.connected,
            locks: st.locks,
            in_transaction: st.in_transaction,
            trx: st.trx,
            modified: st.modified,
            touched: st.touched,
            last_request: st.last_request,
            warned: st.warned,
        }
    }

    pub fn subscribe(&self, tx: UnboundedSender<ConnectionEvent>) {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    /// Returns false when nobody is listening.
    pub(crate) fn emit(&self, event: ConnectionEvent) -> bool {
        let guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn mark_warned(&self) {
        self.st().warned = true;
    }

    pub(crate) fn mark_disconnected(&self, reason: &str) {
        {
            let mut st = self.st();
            st.connected = false;
            st.session = None;
            st.locks = 0;
            st.in_transaction = false;
        }
        log::warn!("connection {}: disconnected ({reason})", self.name);
        self.emit(ConnectionEvent::Disconnected {
            connection: self.name.clone(),
            reason: reason.to_string(),
        });
    }

    async fn exchange(&self, verb: Verb, mut request: Request, touch: bool) -> Result<Response> {
        {
            let st = self.st();
            if !st.connected && verb != Verb::Connect {
                return Err(FormError::NotConnected(self.name.clone()));
            }
            request.session = st.session.clone();
        }
        let resp = self
            .transport
            .send(verb, &request)
            .await
            .map_err(|e| FormError::backend(verb.as_str(), format!("{e:#}")))?;

        let mut st = self.st();
        let now = Instant::now();
        st.last_request = now;
        if touch {
            st.touched = now;
        }
        if let Some(session) = &resp.session {
            st.session = Some(session.clone());
        }
        Ok(resp)
    }

    fn end_span(&self) {
        let mut st = self.st();
        st.trx = TrxToken(st.trx.0 + 1);
        st.locks = 0;
        st.in_transaction = false;
        st.modified = None;
        st.warned = false;
    }

    pub async fn connect(
        self: &Arc<Self>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let request = Request {
            scope: Some(self.settings.scope),
            username: username.map(str::to_string),
            password: password.map(str::to_string),
            ..Request::default()
        };
        let resp = self.exchange(Verb::Connect, request, true).await?;
        if !resp.success {
            return Err(FormError::backend("connect", resp.message_or("connect refused")));
        }
        {
            let mut st = self.st();
            st.connected = true;
            st.locks = 0;
            st.in_transaction = false;
            st.warned = false;
            st.trx = TrxToken(st.trx.0 + 1);
        }
        log::info!(
            "connection {}: connected (scope={}, session={:?})",
            self.name,
            self.settings.scope,
            self.session()
        );

        if self.settings.scope != Scope::Stateless && !self.settings.keepalive.is_zero() {
            let handle = tokio::spawn(keepalive::run(Arc::downgrade(self)));
            if let Some(old) = self
                .keepalive
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .replace(handle)
            {
                old.abort();
            }
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.stop_keepalive();
        let resp = self.exchange(Verb::Disconnect, Request::default(), true).await;
        {
            let mut st = self.st();
            st.connected = false;
            st.session = None;
            st.locks = 0;
            st.in_transaction = false;
            st.modified = None;
        }
        log::info!("connection {}: disconnected", self.name);
        match resp {
            Ok(r) if !r.success => Err(FormError::backend("disconnect", r.message_or("refused"))),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.keepalive.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    pub async fn select(
        &self,
        stmt: String,
        bindvalues: Vec<BindValue>,
        rows: usize,
    ) -> Result<(Cursor, Fetched)> {
        let mut cursor = Cursor::new(stmt, bindvalues, rows, self.trx());
        let fetched = self.open(&mut cursor).await?;
        Ok((cursor, fetched))
    }

    /// (Re)issue the cursor's select, skipping the rows already delivered.
    async fn open(&self, cursor: &mut Cursor) -> Result<Fetched> {
        let mut request = Request::sql(cursor.stmt.clone(), cursor.bindvalues.clone());
        request.rows = Some(cursor.rows);
        if cursor.pos > 0 {
            request.position = Some(cursor.pos);
        }
        let resp = self.exchange(Verb::Select, request, true).await?;
        if !resp.success {
            return Err(FormError::backend("select", resp.message_or("select failed")));
        }
        cursor.trx = self.trx();
        cursor.name = match self.settings.scope {
            Scope::Stateless => None,
            _ => resp.cursor.clone(),
        };
        Ok(Self::page(cursor, &resp))
    }

    fn page(cursor: &mut Cursor, resp: &Response) -> Fetched {
        let rows = resp.records();
        let more = resp.more.unwrap_or(false);
        cursor.advance(rows.len(), more);
        Fetched { rows, more }
    }

    pub async fn fetch(&self, cursor: &mut Cursor) -> Result<Fetched> {
        if cursor.eof {
            return Ok(Fetched::default());
        }
        if !cursor.is_valid(self.trx(), self.settings.scope) {
            log::debug!(
                "connection {}: cursor restart at position {}",
                self.name,
                cursor.pos
            );
            return self.open(cursor).await;
        }
        let request = Request {
            cursor: cursor.name.clone(),
            rows: Some(cursor.rows),
            ..Request::default()
        };
        let resp = self.exchange(Verb::Fetch, request, true).await?;
        if !resp.success {
            return Err(FormError::backend("fetch", resp.message_or("fetch failed")));
        }
        Ok(Self::page(cursor, &resp))
    }

    pub async fn lock(
        &self,
        stmt: String,
        bindvalues: Vec<BindValue>,
        assert: Vec<AssertValue>,
    ) -> Result<Outcome> {
        let resp = self
            .exchange(Verb::Lock, Request::sql(stmt, bindvalues).with_assert(assert), true)
            .await?;
        let outcome = Outcome::from_response(&resp);
        if !outcome.is_done() || self.settings.scope == Scope::Stateless {
            return Ok(outcome);
        }
        let mut st = self.st();
        let first_lock = st.locks == 0;
        st.locks += 1;
        st.modified = Some(Instant::now());
        log::debug!("connection {}: locks={}", self.name, st.locks);
        Ok(Outcome::Done { first_lock })
    }

    async fn mutate(&self, verb: Verb, request: Request) -> Result<Outcome> {
        let resp = self.exchange(verb, request, true).await?;
        let outcome = Outcome::from_response(&resp);
        if outcome.is_done() && self.settings.scope != Scope::Stateless {
            let mut st = self.st();
            st.in_transaction = true;
            st.modified = Some(Instant::now());
        }
        Ok(outcome)
    }

    pub async fn insert(&self, stmt: String, bindvalues: Vec<BindValue>) -> Result<Outcome> {
        self.mutate(Verb::Insert, Request::sql(stmt, bindvalues)).await
    }

    pub async fn update(
        &self,
        stmt: String,
        bindvalues: Vec<BindValue>,
        assert: Vec<AssertValue>,
    ) -> Result<Outcome> {
        self.mutate(Verb::Update, Request::sql(stmt, bindvalues).with_assert(assert))
            .await
    }

    pub async fn delete(
        &self,
        stmt: String,
        bindvalues: Vec<BindValue>,
        assert: Vec<AssertValue>,
    ) -> Result<Outcome> {
        self.mutate(Verb::Delete, Request::sql(stmt, bindvalues).with_assert(assert))
            .await
    }

    /// Stored procedure call. With a non-empty assert it has patch semantics.
    pub async fn call(
        &self,
        stmt: String,
        bindvalues: Vec<BindValue>,
        assert: Vec<AssertValue>,
    ) -> Result<Outcome> {
        let mut request = Request::sql(stmt, bindvalues).with_assert(assert);
        request.patch = !request.assert.is_empty();
        self.mutate(Verb::Call, request).await
    }

    pub async fn script(&self, script: String) -> Result<Response> {
        let resp = self
            .exchange(Verb::Script, Request::sql(script, vec![]), true)
            .await?;
        if resp.success && self.settings.scope != Scope::Stateless {
            let mut st = self.st();
            st.in_transaction = true;
            st.modified = Some(Instant::now());
        }
        Ok(resp)
    }

    pub async fn batch(&self, statements: Vec<BatchStatement>) -> Result<Response> {
        let request = Request {
            statements,
            ..Request::default()
        };
        let resp = self.exchange(Verb::Batch, request, true).await?;
        if resp.success && self.settings.scope != Scope::Stateless {
            let mut st = self.st();
            st.in_transaction = true;
            st.modified = Some(Instant::now());
        }
        Ok(resp)
    }

    pub async fn commit(&self) -> Result<()> {
        if self.settings.scope != Scope::Stateless {
            let resp = self.exchange(Verb::Commit, Request::default(), true).await?;
            if !resp.success {
                return Err(FormError::backend("commit", resp.message_or("commit failed")));
            }
        }
        self.end_span();
        log::info!("connection {}: committed", self.name);
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        if self.settings.scope != Scope::Stateless {
            let resp = self.exchange(Verb::Rollback, Request::default(), true).await?;
            if !resp.success {
                return Err(FormError::backend("rollback", resp.message_or("rollback failed")));
            }
        }
        self.end_span();
        log::info!("connection {}: rolled back", self.name);
        Ok(())
    }

    /// Give the server-side session resources back. Pending work is lost and
    /// the connection has to connect again before the next request.
    pub async fn release(&self) -> Result<()> {
        let resp = self.exchange(Verb::Release, Request::default(), false).await?;
        if !resp.success {
            return Err(FormError::backend("release", resp.message_or("release failed")));
        }
        self.end_span();
        {
            let mut st = self.st();
            st.connected = false;
            st.session = None;
        }
        // The monitor may be the caller: detach it, it stops on its next wake.
        drop(self.keepalive.lock().unwrap_or_else(|e| e.into_inner()).take());
        log::info!("connection {}: released", self.name);
        self.emit(ConnectionEvent::Released {
            connection: self.name.clone(),
        });
        Ok(())
    }

    /// Does not count as user activity.
    pub async fn ping(&self) -> Result<bool> {
        let resp = self.exchange(Verb::Ping, Request::default(), false).await?;
        Ok(resp.success)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.get_mut().ok().and_then(|h| h.take()) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(scope: Scope) -> ConnectionSettings {
        ConnectionSettings {
            scope,
            keepalive: Duration::ZERO,
            ..ConnectionSettings::default()
        }
    }

    async fn connected(scope: Scope) -> (Arc<MemoryBackend>, Arc<Connection>) {
        let backend = Arc::new(MemoryBackend::new().unwrap());
        backend.create_table("orders", &["id", "status"], &["id"]).unwrap();
        backend
            .seed("orders", vec![json!([1, "OPEN"]), json!([2, "OPEN"]), json!([3, "SHIPPED"])])
            .unwrap();
        let conn = Connection::new("main", backend.clone(), settings(scope));
        conn.connect(None, None).await.unwrap();
        (backend, conn)
    }

    fn key(id: i64) -> Vec<BindValue> {
        vec![BindValue::new("k0", json!(id), "integer")]
    }

    #[tokio::test]
    async fn requests_need_a_session() {
        let backend = Arc::new(MemoryBackend::new().unwrap());
        let conn = Connection::new("main", backend, settings(Scope::Dedicated));
        assert!(matches!(conn.ping().await, Err(FormError::NotConnected(_))));
    }

    #[tokio::test]
    async fn release_ends_the_session() {
        let (backend, conn) = connected(Scope::Transactional).await;
        conn.release().await.unwrap();
        assert!(!conn.is_connected());
        assert!(conn.session().is_none());
        assert!(matches!(conn.release().await, Err(FormError::NotConnected(_))));
        assert_eq!(backend.count(Verb::Release), 1);

        conn.connect(None, None).await.unwrap();
        assert!(conn.ping().await.unwrap());
    }

    #[tokio::test]
    async fn first_lock_opens_the_span_once() {
        let (_b, conn) = connected(Scope::Transactional).await;
        let sql = "select id, status from orders where id = :k0 for update".to_string();
        let first = conn.lock(sql.clone(), key(1), vec![]).await.unwrap();
        assert_eq!(first, Outcome::Done { first_lock: true });
        let second = conn.lock(sql, key(2), vec![]).await.unwrap();
        assert_eq!(second, Outcome::Done { first_lock: false });
        assert_eq!(conn.locks(), 2);

        let before = conn.trx();
        conn.rollback().await.unwrap();
        assert_eq!(conn.locks(), 0);
        assert_ne!(conn.trx(), before);
        assert!(conn.modified().is_none());
    }

    #[tokio::test]
    async fn assert_mismatch_reports_fresh_row() {
        let (backend, conn) = connected(Scope::Transactional).await;
        backend.set_value("orders", &json!(1), "status", json!("SHIPPED"));
        let outcome = conn
            .lock(
                "select id, status from orders where id = :k0 for update".into(),
                key(1),
                vec![BindValue::new("status", json!("OPEN"), "string")],
            )
            .await
            .unwrap();
        match outcome {
            Outcome::Changed { violations, fresh } => {
                assert_eq!(violations, vec!["status".to_string()]);
                assert_eq!(fresh.unwrap()["status"], json!("SHIPPED"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(conn.locks(), 0);
    }

    #[tokio::test]
    async fn vanished_row() {
        let (backend, conn) = connected(Scope::Transactional).await;
        backend.remove_row("orders", &json!(2));
        let outcome = conn
            .delete(
                "delete from orders where id = :k0".into(),
                key(2),
                vec![BindValue::new("status", json!("OPEN"), "string")],
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Vanished);
    }

    #[tokio::test]
    async fn stateless_cursor_resupplies_position() {
        let (backend, conn) = connected(Scope::Stateless).await;
        let (mut cursor, first) = conn
            .select("select id, status from orders order by id".into(), vec![], 2)
            .await
            .unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(first.more);
        assert!(cursor.name.is_none());

        let next = conn.fetch(&mut cursor).await.unwrap();
        assert_eq!(next.rows.len(), 1);
        assert_eq!(next.rows[0]["id"], json!(3));
        assert!(cursor.eof);

        let verbs: Vec<Verb> = backend.requests().into_iter().map(|(v, _)| v).collect();
        assert!(!verbs.contains(&Verb::Fetch));
    }

    #[tokio::test]
    async fn cursor_restarts_after_commit() {
        let (backend, conn) = connected(Scope::Dedicated).await;
        let (mut cursor, _) = conn
            .select("select id, status from orders order by id".into(), vec![], 1)
            .await
            .unwrap();
        assert!(cursor.name.is_some());
        let page = conn.fetch(&mut cursor).await.unwrap();
        assert_eq!(page.rows[0]["id"], json!(2));

        conn.commit().await.unwrap();
        let page = conn.fetch(&mut cursor).await.unwrap();
        assert_eq!(page.rows[0]["id"], json!(3));
        let last = backend.requests().pop().unwrap();
        assert_eq!(last.0, Verb::Select);
        assert_eq!(last.1.position, Some(2));
    }
}
