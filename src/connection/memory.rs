//! In-process backend speaking the same envelope as the HTTP one.
//!
//! Rows live in an in-memory SQLite database. On top of it this keeps what a
//! form server adds: sessions, row locks, assert checks, server cursors and a
//! per-session undo log. The undo log is written by triggers on every table
//! while a transactional session owns the statement.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::transport::Transport;
use super::wire::{BatchStatement, BindValue, Request, Response, Scope, Verb};
use crate::model::Values;

const SCHEMA: &str = "
    create table undo_log (
        seq integer primary key,
        session text not null,
        stmt text not null
    );
    create table undo_owner (session text not null);
";

fn to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) | ValueRef::Blob(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
    }
}

fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Bind the named values the statement actually mentions.
fn bind(stmt: &mut rusqlite::Statement<'_>, binds: &[BindValue]) -> rusqlite::Result<()> {
    for b in binds {
        if let Some(i) = stmt.parameter_index(&format!(":{}", b.name))? {
            stmt.raw_bind_parameter(i, to_sql(&b.value))?;
        }
    }
    Ok(())
}

fn query(db: &Connection, sql: &str, binds: &[BindValue]) -> rusqlite::Result<(Vec<String>, Vec<Vec<Value>>)> {
    let mut stmt = db.prepare(sql)?;
    bind(&mut stmt, binds)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let width = columns.len();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let cells = (0..width)
            .map(|i| row.get_ref(i).map(from_sql))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.push(cells);
    }
    Ok((columns, out))
}

fn run(db: &Connection, sql: &str, binds: &[BindValue]) -> rusqlite::Result<usize> {
    let mut stmt = db.prepare(sql)?;
    bind(&mut stmt, binds)?;
    stmt.raw_execute()
}

/// Triggers recording the inverse of every change while `undo_owner` names
/// a session. Rows are addressed by rowid, which updates never change.
fn undo_triggers(table: &str, columns: &[&str]) -> String {
    let names = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(",");
    let restore = columns
        .iter()
        .map(|c| format!("\"{c}\"='||quote(old.\"{c}\")||'"))
        .collect::<Vec<_>>()
        .join(",");
    let values = columns
        .iter()
        .map(|c| format!("'||quote(old.\"{c}\")||'"))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "
        create trigger \"{table}_undo_insert\" after insert on \"{table}\" begin
            insert into undo_log (session, stmt)
            select session, 'delete from \"{table}\" where rowid='||new.rowid from undo_owner;
        end;
        create trigger \"{table}_undo_update\" after update on \"{table}\" begin
            insert into undo_log (session, stmt)
            select session, 'update \"{table}\" set {restore} where rowid='||old.rowid from undo_owner;
        end;
        create trigger \"{table}_undo_delete\" after delete on \"{table}\" begin
            insert into undo_log (session, stmt)
            select session, 'insert into \"{table}\" (rowid,{names}) values ('||old.rowid||',{values})' from undo_owner;
        end;
        "
    )
}

/// Table and `where` clause of a keyed lock/update/delete statement.
fn keyed_target(sql: &str) -> Option<(&str, &str)> {
    let lower = sql.to_ascii_lowercase();
    let at = lower.find(" where ")?;
    let head: Vec<&str> = sql[..at].split_whitespace().collect();
    let table = match head.first()?.to_ascii_lowercase().as_str() {
        "update" => *head.get(1)?,
        "delete" => *head.get(2)?,
        "select" => {
            let from = head.iter().position(|w| w.eq_ignore_ascii_case("from"))?;
            *head.get(from + 1)?
        }
        _ => return None,
    };
    let clause = sql[at + " where ".len()..].trim_end();
    Some((table, strip_for_update(clause)))
}

fn strip_for_update(sql: &str) -> &str {
    let trimmed = sql.trim_end();
    let lower = trimmed.to_ascii_lowercase();
    match lower.strip_suffix(" for update") {
        Some(rest) => &trimmed[..rest.len()],
        None => trimmed,
    }
}

/// The single row a keyed statement addresses.
struct Target {
    rowid: i64,
    columns: Vec<String>,
    row: Vec<Value>,
}

#[derive(Debug)]
struct Session {
    scope: Scope,
}

#[derive(Debug)]
struct ServerCursor {
    owner: String,
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

struct MemState {
    db: Connection,
    /// table -> primary key columns.
    keys: HashMap<String, Vec<String>>,
    sessions: HashMap<String, Session>,
    /// (table, rowid) -> owning session.
    locks: HashMap<(String, i64), String>,
    cursors: HashMap<String, ServerCursor>,
    next_cursor: u64,
    log: Vec<(Verb, Request)>,
    failures: Vec<(Verb, String)>,
    delays: VecDeque<Duration>,
}

pub struct MemoryBackend {
    state: Mutex<MemState>,
}

impl MemoryBackend {
    pub fn new() -> Result<Self> {
        let db = Connection::open_in_memory().context("opening in-memory database")?;
        db.execute_batch(SCHEMA).context("creating undo log")?;
        Ok(Self {
            state: Mutex::new(MemState {
                db,
                keys: HashMap::new(),
                sessions: HashMap::new(),
                locks: HashMap::new(),
                cursors: HashMap::new(),
                next_cursor: 0,
                log: Vec::new(),
                failures: Vec::new(),
                delays: VecDeque::new(),
            }),
        })
    }

    fn st(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_table(&self, name: &str, columns: &[&str], key: &[&str]) -> Result<()> {
        let mut st = self.st();
        let quoted = |cols: &[&str]| {
            cols.iter()
                .map(|c| format!("\"{c}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut ddl = format!("create table \"{name}\" ({}", quoted(columns));
        if !key.is_empty() {
            ddl.push_str(&format!(", primary key ({})", quoted(key)));
        }
        ddl.push_str(");");
        ddl.push_str(&undo_triggers(name, columns));
        st.db
            .execute_batch(&ddl)
            .with_context(|| format!("creating table '{name}'"))?;
        st.keys
            .insert(name.to_string(), key.iter().map(|k| k.to_string()).collect());
        Ok(())
    }

    /// Append committed rows, each a JSON array in column order.
    pub fn seed(&self, table: &str, rows: Vec<Value>) -> Result<()> {
        let st = self.st();
        for row in rows {
            let Value::Array(cells) = row else {
                bail!("seed rows for '{table}' must be arrays");
            };
            let marks = (1..=cells.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            st.db
                .execute(
                    &format!("insert into \"{table}\" values ({marks})"),
                    rusqlite::params_from_iter(cells.iter().map(to_sql)),
                )
                .with_context(|| format!("seeding '{table}'"))?;
        }
        Ok(())
    }

    fn key_column(st: &MemState, table: &str) -> Option<String> {
        st.keys.get(table).and_then(|k| k.first()).cloned()
    }

    /// Committed change by "another user", addressed by a single-column key.
    pub fn set_value(&self, table: &str, key: &Value, column: &str, value: Value) -> bool {
        let st = self.st();
        let Some(key_col) = Self::key_column(&st, table) else {
            return false;
        };
        let sql = format!("update \"{table}\" set \"{column}\" = ?1 where \"{key_col}\" = ?2");
        match st.db.execute(&sql, params![to_sql(&value), to_sql(key)]) {
            Ok(n) => n > 0,
            Err(e) => {
                log::warn!("memory backend: {e}");
                false
            }
        }
    }

    /// Committed delete by "another user".
    pub fn remove_row(&self, table: &str, key: &Value) -> bool {
        let st = self.st();
        let Some(key_col) = Self::key_column(&st, table) else {
            return false;
        };
        let sql = format!("delete from \"{table}\" where \"{key_col}\" = ?1");
        match st.db.execute(&sql, params![to_sql(key)]) {
            Ok(n) => n > 0,
            Err(e) => {
                log::warn!("memory backend: {e}");
                false
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Values> {
        let st = self.st();
        match query(&st.db, &format!("select * from \"{table}\" order by rowid"), &[]) {
            Ok((columns, rows)) => rows
                .into_iter()
                .map(|r| columns.iter().cloned().zip(r).collect())
                .collect(),
            Err(e) => {
                log::warn!("memory backend: {e}");
                Vec::new()
            }
        }
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<(Verb, Request)> {
        self.st().log.clone()
    }

    pub fn count(&self, verb: Verb) -> usize {
        self.st().log.iter().filter(|(v, _)| *v == verb).count()
    }

    /// Make the next request with `verb` fail with `message`.
    pub fn fail_next(&self, verb: Verb, message: &str) {
        self.st().failures.push((verb, message.to_string()));
    }

    /// Hold the next select/fetch response back for `delay`.
    pub fn delay_next_select(&self, delay: Duration) {
        self.st().delays.push_back(delay);
    }

    fn handle(&self, verb: Verb, request: &Request) -> Response {
        let mut st = self.st();
        st.log.push((verb, request.clone()));
        if let Some(i) = st.failures.iter().position(|(v, _)| *v == verb) {
            let (_, message) = st.failures.remove(i);
            return Response::fail(message);
        }
        st.dispatch(verb, request)
    }
}

impl MemState {
    fn dispatch(&mut self, verb: Verb, request: &Request) -> Response {
        let session = request.session.clone();
        if verb != Verb::Connect {
            if let Some(s) = &session {
                if !self.sessions.contains_key(s) {
                    return Response::fail(format!("unknown session '{s}'"));
                }
            }
        }
        let ended = match (verb, &session) {
            (Verb::Commit, Some(s)) => self.commit(s),
            (Verb::Rollback, Some(s)) => self.rollback(s),
            (Verb::Release | Verb::Disconnect, Some(s)) => self.rollback(s).map(|()| {
                self.cursors.retain(|_, c| c.owner != *s);
                if verb == Verb::Disconnect {
                    self.sessions.remove(s);
                }
            }),
            _ => Ok(()),
        };
        if let Err(e) = ended {
            return Response::fail(format!("{verb}: {e}"));
        }
        match verb {
            Verb::Connect => self.connect(request),
            Verb::Disconnect | Verb::Ping | Verb::Commit | Verb::Rollback | Verb::Release => {
                Response::ok()
            }
            Verb::Fetch => self.fetch(request),
            Verb::Select | Verb::Lock | Verb::Insert | Verb::Update | Verb::Delete => {
                self.execute(verb, request, session.as_deref())
            }
            Verb::Batch => self.batch(&request.statements, session.as_deref()),
            Verb::Script => self.script(request, session.as_deref()),
            Verb::Call => Response::fail("stored procedures are not supported"),
        }
    }

    fn connect(&mut self, request: &Request) -> Response {
        let scope = request.scope.unwrap_or(Scope::Dedicated);
        if scope == Scope::Stateless {
            return Response::ok();
        }
        let token = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(token.clone(), Session { scope });
        Response {
            session: Some(token),
            ..Response::ok()
        }
    }

    /// Sessions without server-side state run in autocommit.
    fn transactional(&self, session: Option<&str>) -> Option<String> {
        let s = session?;
        match self.sessions.get(s) {
            Some(sess) if sess.scope != Scope::Stateless => Some(s.to_string()),
            _ => None,
        }
    }

    /// Run `f` with the undo log attributed to `owner`.
    fn logged<T>(
        &self,
        owner: Option<&str>,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        self.db.execute("delete from undo_owner", [])?;
        if let Some(o) = owner {
            self.db.execute("insert into undo_owner (session) values (?1)", [o])?;
        }
        let out = f(&self.db);
        self.db.execute("delete from undo_owner", [])?;
        out
    }

    fn commit(&mut self, session: &str) -> rusqlite::Result<()> {
        self.db
            .execute("delete from undo_log where session = ?1", [session])?;
        self.locks.retain(|_, owner| owner != session);
        Ok(())
    }

    fn rollback(&mut self, session: &str) -> rusqlite::Result<()> {
        let undo: Vec<String> = {
            let mut stmt = self
                .db
                .prepare("select stmt from undo_log where session = ?1 order by seq desc")?;
            let rows = stmt.query_map([session], |r| r.get(0))?;
            let undo = rows.collect::<rusqlite::Result<Vec<String>>>()?;
            undo
        };
        self.logged(None, |db| {
            for stmt in &undo {
                db.execute_batch(stmt)?;
            }
            Ok(())
        })?;
        self.commit(session)
    }

    fn target(
        &self,
        table: &str,
        clause: &str,
        request: &Request,
        owner: Option<&str>,
    ) -> std::result::Result<Target, Response> {
        let sql = format!("select rowid, * from {table} where {clause}");
        let (mut columns, rows) = query(&self.db, &sql, &request.bindvalues)
            .map_err(|e| Response::fail(e.to_string()))?;
        if !columns.is_empty() {
            columns.remove(0);
        }
        let Some(mut row) = rows.into_iter().next() else {
            return Err(Response {
                assert: Some(false),
                rows: Some(Vec::new()),
                columns: Some(columns),
                ..Response::fail("row no longer exists")
            });
        };
        let rowid = row.remove(0).as_i64().unwrap_or_default();
        let cell = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .and_then(|i| row.get(i))
                .unwrap_or(&Value::Null)
        };
        let violations: Vec<String> = request
            .assert
            .iter()
            .filter(|a| !same(cell(&a.name), &a.value))
            .map(|a| a.name.clone())
            .collect();
        if !violations.is_empty() {
            return Err(Response {
                assert: Some(false),
                violations: Some(violations),
                rows: Some(vec![row]),
                columns: Some(columns),
                ..Response::fail("row was changed by another session")
            });
        }
        if let Some(holder) = self.locks.get(&(table.to_string(), rowid)) {
            if Some(holder.as_str()) != owner {
                return Err(Response {
                    lock: Some(false),
                    ..Response::fail("row is locked by another session")
                });
            }
        }
        Ok(Target { rowid, columns, row })
    }

    fn execute(&mut self, verb: Verb, request: &Request, session: Option<&str>) -> Response {
        let Some(sql) = request.sql.as_deref() else {
            return Response::fail("missing sql");
        };
        let owner = self.transactional(session);
        let locking = verb == Verb::Lock || strip_for_update(sql).len() != sql.trim_end().len();
        if verb == Verb::Select && !locking {
            return self.select(sql, request, session);
        }
        if verb == Verb::Insert {
            return match self.logged(owner.as_deref(), |db| run(db, sql, &request.bindvalues)) {
                Ok(n) => Response {
                    affected: Some(n),
                    ..Response::ok()
                },
                Err(e) => Response::fail(e.to_string()),
            };
        }

        let Some((table, clause)) = keyed_target(sql) else {
            return Response::fail(format!("cannot address a row with '{sql}'"));
        };
        let target = match self.target(table, clause, request, owner.as_deref()) {
            Ok(t) => t,
            Err(resp) => return resp,
        };
        let key = (table.to_string(), target.rowid);
        if locking {
            if let Some(o) = owner {
                self.locks.insert(key, o);
            }
            return Response {
                lock: Some(true),
                columns: Some(target.columns),
                rows: Some(vec![target.row]),
                ..Response::ok()
            };
        }

        match self.logged(owner.as_deref(), |db| run(db, sql, &request.bindvalues)) {
            Ok(n) => {
                match (verb, owner) {
                    (Verb::Delete, _) => {
                        self.locks.remove(&key);
                    }
                    (_, Some(o)) => {
                        self.locks.insert(key, o);
                    }
                    _ => {}
                }
                Response {
                    affected: Some(n),
                    ..Response::ok()
                }
            }
            Err(e) => Response::fail(e.to_string()),
        }
    }

    fn select(&mut self, sql: &str, request: &Request, session: Option<&str>) -> Response {
        let (columns, rows) = match query(&self.db, sql, &request.bindvalues) {
            Ok(found) => found,
            Err(e) => return Response::fail(e.to_string()),
        };
        let mut rows: VecDeque<Vec<Value>> = rows
            .into_iter()
            .skip(request.position.unwrap_or(0))
            .collect();

        let size = request.rows.unwrap_or(usize::MAX).min(rows.len());
        let page: Vec<Vec<Value>> = rows.drain(..size).collect();
        let more = !rows.is_empty();
        let cursor = match self.transactional(session) {
            Some(owner) if more => {
                self.next_cursor += 1;
                let name = format!("c{}", self.next_cursor);
                self.cursors.insert(
                    name.clone(),
                    ServerCursor {
                        owner,
                        columns: columns.clone(),
                        rows,
                    },
                );
                Some(name)
            }
            _ => None,
        };
        Response {
            columns: Some(columns),
            rows: Some(page),
            more: Some(more),
            cursor,
            ..Response::ok()
        }
    }

    fn fetch(&mut self, request: &Request) -> Response {
        let Some(name) = request.cursor.clone() else {
            return Response::fail("missing cursor");
        };
        let cursor = match self.cursors.get_mut(&name) {
            Some(c) if request.session.as_deref() == Some(c.owner.as_str()) => c,
            _ => return Response::fail(format!("unknown cursor '{name}'")),
        };
        let size = request.rows.unwrap_or(usize::MAX).min(cursor.rows.len());
        let page: Vec<Vec<Value>> = cursor.rows.drain(..size).collect();
        let more = !cursor.rows.is_empty();
        let columns = cursor.columns.clone();
        if !more {
            self.cursors.remove(&name);
        }
        Response {
            columns: Some(columns),
            rows: Some(page),
            more: Some(more),
            cursor: more.then_some(name),
            ..Response::ok()
        }
    }

    fn batch(&mut self, statements: &[BatchStatement], session: Option<&str>) -> Response {
        let mut affected = 0;
        for stmt in statements {
            let mut request = stmt.request.clone();
            request.session = session.map(str::to_string);
            let resp = match stmt.verb {
                Verb::Select | Verb::Lock | Verb::Insert | Verb::Update | Verb::Delete => {
                    self.execute(stmt.verb, &request, session)
                }
                other => Response::fail(format!("'{other}' cannot be batched")),
            };
            if !resp.success {
                return resp;
            }
            affected += resp.affected.unwrap_or(0);
        }
        Response {
            affected: Some(affected),
            ..Response::ok()
        }
    }

    /// Several statements in one text. No locks or asserts apply.
    fn script(&mut self, request: &Request, session: Option<&str>) -> Response {
        let Some(text) = request.sql.as_deref() else {
            return Response::fail("missing script");
        };
        let owner = self.transactional(session);
        let result = self.logged(owner.as_deref(), |db| {
            let mut batch = rusqlite::Batch::new(db, text);
            let mut affected = 0;
            while let Some(mut stmt) = batch.next()? {
                bind(&mut stmt, &request.bindvalues)?;
                affected += stmt.raw_execute()?;
            }
            Ok(affected)
        });
        match result {
            Ok(n) => Response {
                affected: Some(n),
                ..Response::ok()
            },
            Err(e) => Response::fail(e.to_string()),
        }
    }
}

#[async_trait]
impl Transport for MemoryBackend {
    async fn send(&self, verb: Verb, request: &Request) -> Result<Response> {
        if matches!(verb, Verb::Select | Verb::Fetch) {
            let delay = self.st().delays.pop_front();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
        }
        Ok(self.handle(verb, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> (MemoryBackend, String) {
        let b = MemoryBackend::new().unwrap();
        b.create_table("lines", &["id", "order_id", "item", "qty"], &["id"])
            .unwrap();
        b.seed(
            "lines",
            vec![
                json!([1, 10, "bolt", 4]),
                json!([2, 10, "nut", 8]),
                json!([3, 11, "washer", 1]),
            ],
        )
        .unwrap();
        let s = b.connect();
        (b, s)
    }

    impl MemoryBackend {
        fn connect(&self) -> String {
            let resp = self.handle(
                Verb::Connect,
                &Request {
                    scope: Some(Scope::Transactional),
                    ..Request::default()
                },
            );
            resp.session.unwrap()
        }
    }

    fn req(session: &str, sql: &str, binds: Vec<BindValue>) -> Request {
        Request {
            session: Some(session.to_string()),
            ..Request::sql(sql, binds)
        }
    }

    #[test]
    fn keyed_statements_name_their_table() {
        assert_eq!(
            keyed_target("select id, qty from lines where id = :k0 for update"),
            Some(("lines", "id = :k0"))
        );
        assert_eq!(
            keyed_target("update lines set qty = :s0 where id = :k0 and order_id = :k1"),
            Some(("lines", "id = :k0 and order_id = :k1"))
        );
        assert_eq!(keyed_target("delete from lines where id = :k0"), Some(("lines", "id = :k0")));
        assert_eq!(keyed_target("delete from lines"), None);
    }

    #[test]
    fn filtered_select_with_paging_cursor() {
        let (b, s) = backend();
        let mut r = req(
            &s,
            "select id, item from lines where order_id = :w0 and item like :w1 order by id",
            vec![
                BindValue::new("w0", json!(10), "integer"),
                BindValue::new("w1", json!("%t"), "string"),
            ],
        );
        r.rows = Some(1);
        let resp = b.handle(Verb::Select, &r);
        assert_eq!(resp.records()[0]["item"], json!("bolt"));
        assert_eq!(resp.more, Some(true));
        let cursor = resp.cursor.clone().unwrap();

        // someone else's cursor is not reachable
        let other = b.connect();
        let stolen = Request {
            session: Some(other),
            cursor: Some(cursor.clone()),
            ..Request::default()
        };
        assert!(!b.handle(Verb::Fetch, &stolen).success);

        let fetch = Request {
            session: Some(s.clone()),
            cursor: Some(cursor),
            rows: Some(5),
            ..Request::default()
        };
        let resp = b.handle(Verb::Fetch, &fetch);
        assert_eq!(resp.records()[0]["item"], json!("nut"));
        assert_eq!(resp.more, Some(false));
    }

    #[test]
    fn rollback_restores_rows_and_releases_locks() {
        let (b, s) = backend();
        let key = vec![BindValue::new("k0", json!(1), "integer")];
        let upd = req(
            &s,
            "update lines set qty = :s0 where id = :k0",
            vec![
                BindValue::new("s0", json!(99), "integer"),
                BindValue::new("k0", json!(1), "integer"),
            ],
        );
        assert!(b.handle(Verb::Update, &upd).success);
        let del = req(
            &s,
            "delete from lines where id = :k0",
            vec![BindValue::new("k0", json!(3), "integer")],
        );
        assert!(b.handle(Verb::Delete, &del).success);
        let ins = req(
            &s,
            "insert into lines (id, order_id, item, qty) values (:v0, :v1, :v2, :v3)",
            vec![
                BindValue::new("v0", json!(4), "integer"),
                BindValue::new("v1", json!(11), "integer"),
                BindValue::new("v2", json!("gear"), "string"),
                BindValue::new("v3", Value::Null, "integer"),
            ],
        );
        assert!(b.handle(Verb::Insert, &ins).success);
        assert_eq!(b.rows("lines").len(), 3);

        // another session cannot touch the updated row
        let other = b.connect();
        let lock_sql = "select id from lines where id = :k0 for update";
        let lock = b.handle(Verb::Lock, &req(&other, lock_sql, key.clone()));
        assert_eq!(lock.lock, Some(false));

        let rb = Request {
            session: Some(s.clone()),
            ..Request::default()
        };
        assert!(b.handle(Verb::Rollback, &rb).success);
        let rows = b.rows("lines");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["qty"], json!(4));
        assert_eq!(rows[2]["item"], json!("washer"));
        let lock = b.handle(Verb::Lock, &req(&other, lock_sql, key));
        assert!(lock.success);
    }

    #[test]
    fn commit_keeps_changes() {
        let (b, s) = backend();
        let upd = req(
            &s,
            "update lines set item = :s0 where id = :k0",
            vec![
                BindValue::new("s0", json!("screw"), "string"),
                BindValue::new("k0", json!(2), "integer"),
            ],
        );
        assert!(b.handle(Verb::Update, &upd).success);
        let end = Request {
            session: Some(s),
            ..Request::default()
        };
        assert!(b.handle(Verb::Commit, &end).success);
        assert!(b.handle(Verb::Rollback, &end).success);
        assert_eq!(b.rows("lines")[1]["item"], json!("screw"));
    }

    #[test]
    fn assert_violation_lists_columns() {
        let (b, s) = backend();
        let r = req(
            &s,
            "update lines set qty = :s0 where id = :k0",
            vec![
                BindValue::new("s0", json!(5), "integer"),
                BindValue::new("k0", json!(2), "integer"),
            ],
        )
        .with_assert(vec![
            BindValue::new("item", json!("nut"), "string"),
            BindValue::new("qty", json!(7), "integer"),
        ]);
        let resp = b.handle(Verb::Update, &r);
        assert!(resp.assert_failed());
        assert_eq!(resp.violations, Some(vec!["qty".to_string()]));
        assert_eq!(resp.records()[0]["qty"], json!(8));

        let gone = req(
            &s,
            "delete from lines where id = :k0",
            vec![BindValue::new("k0", json!(42), "integer")],
        );
        let resp = b.handle(Verb::Delete, &gone);
        assert!(resp.assert_failed());
        assert!(resp.records().is_empty());
    }

    #[test]
    fn release_drops_only_its_own_cursors() {
        let (b, s) = backend();
        let other = b.connect();
        let page = |session: &str| {
            let mut r = req(session, "select id from lines order by id", vec![]);
            r.rows = Some(1);
            b.handle(Verb::Select, &r).cursor.unwrap()
        };
        let mine = page(&s);
        let theirs = page(&other);

        let release = Request {
            session: Some(s.clone()),
            ..Request::default()
        };
        assert!(b.handle(Verb::Release, &release).success);

        let fetch = |session: &str, cursor: String| Request {
            session: Some(session.to_string()),
            cursor: Some(cursor),
            rows: Some(1),
            ..Request::default()
        };
        assert!(!b.handle(Verb::Fetch, &fetch(&s, mine)).success);
        assert!(b.handle(Verb::Fetch, &fetch(&other, theirs)).success);
    }

    #[test]
    fn injected_failure_applies_once() {
        let (b, s) = backend();
        b.fail_next(Verb::Commit, "disk full");
        let c = Request {
            session: Some(s),
            ..Request::default()
        };
        assert!(!b.handle(Verb::Commit, &c).success);
        assert!(b.handle(Verb::Commit, &c).success);
        assert_eq!(b.count(Verb::Commit), 2);
    }
}
