//! A form: named blocks, the master/detail tree between them and every
//! operation that moves, edits, queries or writes records.
//!
//! Block state lives behind one `std::sync::Mutex`. It is only ever locked
//! inside synchronous sections; every backend round-trip and trigger runs
//! with the lock released, so triggers may read the form freely.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::block::{Block, FlushStrategy};
use crate::connection::{Connection, Outcome, Verb};
use crate::context::ApplicationContext;
use crate::datasource::{Criterion, Statement};
use crate::error::{FormError, Result};
use crate::model::{Record, RecordId, RecordState, Status, Values, MIRROR_ROW};
use crate::query::{BlockCoordinator, ChainId, Link, QueryManager};
use crate::queue::{FieldAddress, InputEvent, InputKind, InputTarget, Key};
use crate::render::{Indicator, Severity};
use crate::triggers::{EventKind, TriggerEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

struct FormState {
    blocks: IndexMap<String, Block>,
    current: String,
    coordinator: BlockCoordinator,
    queries: QueryManager,
    open: bool,
}

enum QueryPlan {
    Stale,
    Clear,
    Select { stmt: Statement, rows: usize },
}

enum FieldStep {
    Done(bool),
    Edit {
        record: RecordId,
        first_edit: bool,
        needs_lock: bool,
    },
}

pub struct Form {
    name: String,
    connection: String,
    ctx: Arc<ApplicationContext>,
    state: Mutex<FormState>,
}

impl Form {
    pub fn new(
        ctx: &Arc<ApplicationContext>,
        name: &str,
        connection: &str,
        blocks: Vec<Block>,
        links: Vec<Link>,
    ) -> Result<Arc<Self>> {
        let mut map = IndexMap::new();
        for b in blocks {
            if map.contains_key(b.name()) {
                return Err(FormError::Definition(format!(
                    "form '{name}': duplicate block '{}'",
                    b.name()
                )));
            }
            map.insert(b.name().to_string(), b);
        }
        let Some(current) = map.keys().next().cloned() else {
            return Err(FormError::Definition(format!("form '{name}' has no blocks")));
        };

        let mut coordinator = BlockCoordinator::new();
        for link in links {
            for b in [&link.master, &link.detail] {
                if !map.contains_key(b.as_str()) {
                    return Err(FormError::Definition(format!(
                        "form '{name}': link references unknown block '{b}'"
                    )));
                }
            }
            coordinator.link(link)?;
        }

        let form = Arc::new(Self {
            name: name.to_string(),
            connection: connection.to_string(),
            ctx: ctx.clone(),
            state: Mutex::new(FormState {
                blocks: map,
                current,
                coordinator,
                queries: QueryManager::new(),
                open: false,
            }),
        });
        ctx.register_form(&form);
        Ok(form)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<ApplicationContext> {
        &self.ctx
    }

    pub fn connection(&self) -> Result<Arc<Connection>> {
        self.ctx.connection(&self.connection)
    }

    fn st(&self) -> MutexGuard<'_, FormState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_block<R>(&self, block: &str, f: impl FnOnce(&mut Block) -> R) -> Result<R> {
        let mut st = self.st();
        let b = st
            .blocks
            .get_mut(block)
            .ok_or_else(|| FormError::UnknownBlock(block.to_string()))?;
        Ok(f(b))
    }

    /// Read-only access to a block.
    pub fn inspect<R>(&self, block: &str, f: impl FnOnce(&Block) -> R) -> Result<R> {
        self.with_block(block, |b| f(b))
    }

    pub fn is_open(&self) -> bool {
        self.st().open
    }

    pub fn current_block(&self) -> String {
        self.st().current.clone()
    }

    pub fn block_names(&self) -> Vec<String> {
        self.st().blocks.keys().cloned().collect()
    }

    pub fn links(&self) -> Vec<Link> {
        self.st().coordinator.links().to_vec()
    }

    /// Newest query chain started for `block`.
    pub fn latest_chain(&self, block: &str) -> Option<ChainId> {
        self.st().queries.latest(block)
    }

    fn descendants(&self, block: &str) -> Vec<String> {
        self.st().coordinator.descendants(block)
    }

    fn event(&self, kind: EventKind, block: &str, field: Option<&str>) -> Result<TriggerEvent> {
        self.with_block(block, |b| {
            let record = b.current_record().map(|r| r.id());
            TriggerEvent::block(kind, &self.name, block)
                .with_field(field)
                .at(b.current_row_index() as i32, record)
        })
    }

    fn field_event(&self, kind: EventKind, block: &str) -> Result<TriggerEvent> {
        let field = self.with_block(block, |b| b.current_field().map(str::to_string))?;
        self.event(kind, block, field.as_deref())
    }

    /// Fire `event` inside the block's event-transaction slot.
    async fn guarded(&self, block: &str, event: TriggerEvent) -> Result<bool> {
        let kind = event.kind;
        let record = event.record;
        self.with_block(block, |b| b.guard_mut().set_event_transaction(kind, block, record))??;
        let ok = self.ctx.triggers().fire(event).await;
        self.with_block(block, |b| b.guard_mut().end_event_transaction(kind, block))?;
        Ok(ok)
    }

    // ----- rendering -----

    fn render(&self, block: &str) {
        let snapshot = {
            let mut st = self.st();
            let focused = st.current == block;
            st.blocks.get_mut(block).map(|b| {
                let views = b.rebind();
                (
                    views,
                    b.current_row_index() as i32,
                    b.current_field().map(str::to_string),
                    b.is_query_mode(),
                    focused,
                )
            })
        };
        let Some((views, current, field, querymode, focused)) = snapshot else {
            return;
        };
        let r = self.ctx.renderer();
        for (row, view) in &views {
            match view {
                Some(v) => r.display(block, *row, v),
                None => r.clear(block, *row),
            }
        }
        for (row, _) in views.iter().filter(|(i, _)| *i != MIRROR_ROW) {
            let indicator = match (*row == current, querymode) {
                (true, true) => Indicator::Filter,
                (true, false) => Indicator::Current,
                _ => Indicator::Off,
            };
            r.set_indicator(block, *row, indicator);
        }
        if focused {
            if let Some(f) = field {
                r.focus(block, current, &f);
            }
        }
    }

    fn display_current(&self, block: &str) {
        let views = self.with_block(block, |b| {
            let row = b.current_row_index() as i32;
            [(row, b.view(row)), (MIRROR_ROW, b.view(row))]
        });
        if let Ok(views) = views {
            for (row, view) in views {
                if let Some(v) = view {
                    self.ctx.renderer().display(block, row, &v);
                }
            }
        }
    }

    fn refocus(&self, block: &str) {
        let at = self.with_block(block, |b| {
            (b.current_row_index() as i32, b.current_field().map(str::to_string))
        });
        if let Ok((row, Some(field))) = at {
            self.ctx.renderer().focus(block, row, &field);
        }
    }

    /// Blank every row on screen without touching state.
    pub fn clear_view(&self) {
        let layout: Vec<(String, usize)> = {
            let st = self.st();
            st.blocks.iter().map(|(n, b)| (n.clone(), b.rows())).collect()
        };
        for (block, rows) in layout {
            for row in 0..rows as i32 {
                self.ctx.renderer().clear(&block, row);
            }
            self.ctx.renderer().clear(&block, MIRROR_ROW);
        }
    }

    // ----- lifecycle -----

    pub async fn open(&self) -> Result<bool> {
        if !self
            .ctx
            .triggers()
            .fire(TriggerEvent::form(EventKind::PreForm, &self.name))
            .await
        {
            return Ok(false);
        }
        self.st().open = true;
        self.ctx
            .triggers()
            .fire(TriggerEvent::form(EventKind::OnNewForm, &self.name))
            .await;
        for block in self.block_names() {
            self.render(&block);
        }
        log::info!("form '{}' opened", self.name);
        Ok(true)
    }

    pub async fn close(&self) -> Result<bool> {
        if let Some(dirty) = self.dirty_block() {
            return Err(FormError::PendingChanges(dirty));
        }
        if !self
            .ctx
            .triggers()
            .fire(TriggerEvent::form(EventKind::PostForm, &self.name))
            .await
        {
            return Ok(false);
        }
        self.st().open = false;
        self.clear_view();
        log::info!("form '{}' closed", self.name);
        Ok(true)
    }

    fn dirty_block(&self) -> Option<String> {
        let st = self.st();
        st.blocks
            .iter()
            .find(|(_, b)| b.records().has_dirty() || b.has_pending_changes())
            .map(|(n, _)| n.clone())
    }

    /// Unflushed or uncommitted changes anywhere in the form.
    pub fn is_dirty(&self) -> bool {
        self.dirty_block().is_some()
    }

    // ----- navigation -----

    pub async fn go_block(&self, target: &str) -> Result<bool> {
        self.with_block(target, |_| ())?;
        let current = self.current_block();
        if current == target {
            return Ok(true);
        }
        if !self.validate_row(&current).await? {
            self.refocus(&current);
            return Ok(false);
        }
        if !self
            .guarded(&current, self.event(EventKind::PostBlock, &current, None)?)
            .await?
        {
            return Ok(false);
        }
        self.st().current = target.to_string();
        if !self
            .guarded(target, self.event(EventKind::PreBlock, target, None)?)
            .await?
        {
            self.st().current = current.clone();
            self.refocus(&current);
            return Ok(false);
        }
        self.render(target);
        Ok(true)
    }

    pub async fn go_field(&self, block: &str, field: &str) -> Result<bool> {
        let previous = self.with_block(block, |b| {
            b.field_def(field)
                .map(|_| b.current_field().map(str::to_string))
                .ok_or_else(|| FormError::UnknownField {
                    block: block.to_string(),
                    field: field.to_string(),
                })
        })??;
        if previous.as_deref() == Some(field) {
            return Ok(true);
        }
        if let Some(prev) = &previous {
            if !self.validate_field(block, prev).await? {
                self.refocus(block);
                return Ok(false);
            }
            if !self
                .guarded(block, self.event(EventKind::PostField, block, Some(prev))?)
                .await?
            {
                return Ok(false);
            }
        }
        self.with_block(block, |b| b.set_current_field(field))?;
        if !self
            .guarded(block, self.event(EventKind::PreField, block, Some(field))?)
            .await?
        {
            if let Some(prev) = &previous {
                self.with_block(block, |b| b.set_current_field(prev))?;
            }
            self.refocus(block);
            return Ok(false);
        }
        self.refocus(block);
        Ok(true)
    }

    /// Step to the next (or previous) field that takes input.
    pub async fn next_field(&self, block: &str, forward: bool) -> Result<bool> {
        let target = self.with_block(block, |b| {
            let inputs: Vec<String> = b
                .field_defs()
                .iter()
                .filter(|d| d.kind.accepts_input())
                .map(|d| d.name.clone())
                .collect();
            if inputs.is_empty() {
                return None;
            }
            let pos = b
                .current_field()
                .and_then(|f| inputs.iter().position(|n| n == f))
                .unwrap_or(0);
            let next = if forward {
                (pos + 1) % inputs.len()
            } else {
                (pos + inputs.len() - 1) % inputs.len()
            };
            Some(inputs[next].clone())
        })?;
        match target {
            Some(f) => self.go_field(block, &f).await,
            None => Ok(false),
        }
    }

    /// Make display row `row` current.
    pub async fn go_row(&self, block: &str, row: usize) -> Result<bool> {
        let offset = self.with_block(block, |b| b.offset())?;
        self.move_to(block, offset + row).await
    }

    /// Make the record at absolute index `index` current.
    pub async fn go_record(&self, block: &str, index: usize) -> Result<bool> {
        self.move_to(block, index).await
    }

    pub async fn next_record(&self, block: &str, page: bool) -> Result<bool> {
        let (idx, rows) = self.with_block(block, |b| (b.record_index(), b.rows()))?;
        let step = if page { rows } else { 1 };
        self.move_to(block, idx + step).await
    }

    pub async fn prev_record(&self, block: &str, page: bool) -> Result<bool> {
        let (idx, rows) = self.with_block(block, |b| (b.record_index(), b.rows()))?;
        if idx == 0 {
            return Ok(false);
        }
        let step = if page { rows } else { 1 };
        self.move_to(block, idx.saturating_sub(step)).await
    }

    async fn move_to(&self, block: &str, target: usize) -> Result<bool> {
        let (querymode, current, flush) =
            self.with_block(block, |b| (b.is_query_mode(), b.record_index(), b.flush_strategy()))?;
        if querymode || target == current {
            return Ok(false);
        }

        if !self.validate_row(block).await? {
            self.refocus(block);
            return Ok(false);
        }

        let mut target = if target > current {
            current + self.prefetch(block, Direction::Forward, target - current).await?
        } else {
            current - self.prefetch(block, Direction::Backward, current - target).await?
        };
        if target == current {
            return Ok(false);
        }

        if !self
            .guarded(block, self.field_event(EventKind::PostField, block)?)
            .await?
            || !self
                .guarded(block, self.event(EventKind::PostRecord, block, None)?)
                .await?
        {
            return Ok(false);
        }

        if flush == FlushStrategy::Row {
            let pending = self.with_block(block, |b| {
                b.current_record()
                    .filter(|r| r.state().needs_flush())
                    .map(|r| r.id())
            })?;
            if let Some(id) = pending {
                if !self.flush_record(block, id).await? {
                    return Ok(false);
                }
            }
        }

        // details must not lose unflushed work when their master moves
        for detail in self.descendants(block) {
            if self.with_block(&detail, |b| b.records().iter().any(|r| r.state().needs_flush()))?
                && !self.flush(&detail).await?
            {
                return Ok(false);
            }
        }

        let (before, previous, dropped) = self.with_block(block, |b| {
            let before = b.position();
            let previous = b.current_record().map(|r| r.id());
            let idx = b.record_index();
            let untouched = b
                .current_record()
                .map(|r| r.state() == RecordState::New)
                .unwrap_or(false);
            let mut dropped = None;
            if untouched {
                dropped = b.records_mut().remove(idx).map(|r| (idx, r));
                if target > idx {
                    target -= 1;
                }
                b.clamp();
            }
            b.show(target.min(b.records().len().saturating_sub(1)));
            (before, previous, dropped)
        })?;

        if !self
            .guarded(block, self.event(EventKind::PreRecord, block, None)?)
            .await?
            || !self
                .guarded(block, self.field_event(EventKind::PreField, block)?)
                .await?
        {
            self.with_block(block, |b| {
                if let Some((idx, record)) = dropped {
                    b.records_mut().insert(idx, record);
                }
                b.restore_position(before);
            })?;
            self.render(block);
            return Ok(false);
        }

        self.render(block);
        let now = self.with_block(block, |b| b.current_record().map(|r| r.id()))?;
        if now != previous {
            self.requery_details(block).await?;
        }
        Ok(true)
    }

    /// Make up to `count` records past the current one available in
    /// `direction`, fetching from the open cursor at the window edge.
    /// Returns how many are available.
    pub async fn prefetch(&self, block: &str, direction: Direction, count: usize) -> Result<usize> {
        if direction == Direction::Backward {
            return self.with_block(block, |b| count.min(b.record_index()));
        }
        loop {
            let step = self.with_block(block, |b| {
                let available = b.records().len().saturating_sub(b.record_index() + 1);
                if available >= count || b.records().eof() || !b.has_cursor() {
                    return Err(available.min(count));
                }
                let len = b.records().len();
                Ok((b.take_cursor(), b.chain(), len))
            })?;
            let (cursor, chain, len) = match step {
                Ok(s) => s,
                Err(available) => return Ok(available),
            };
            let Some(mut cursor) = cursor else {
                return Ok(0);
            };
            let fetched = self.connection()?.fetch(&mut cursor).await;
            let appended = self.with_block(block, |b| {
                if b.chain() != chain {
                    // the block was re-queried meanwhile
                    return Ok(false);
                }
                b.put_cursor(cursor);
                match fetched {
                    Ok(page) => {
                        let empty = page.rows.is_empty();
                        b.append(page.rows, page.more);
                        if empty {
                            b.records_mut().set_eof(true);
                        }
                        Ok(true)
                    }
                    Err(e) => Err(e),
                }
            })??;
            if !appended {
                return self.with_block(block, |b| {
                    b.records().len().saturating_sub(b.record_index() + 1).min(count)
                });
            }
            self.fire_on_fetch(block, len).await?;
        }
    }

    // ----- query -----

    pub async fn enter_query_mode(&self, block: &str) -> Result<bool> {
        let (allowed, pending) =
            self.with_block(block, |b| (b.allowed().query, b.has_pending_changes() || b.records().has_dirty()))?;
        if !allowed {
            return Err(FormError::NotAllowed {
                block: block.to_string(),
                operation: "query",
            });
        }
        if pending {
            return Err(FormError::PendingChanges(block.to_string()));
        }
        for detail in self.descendants(block) {
            if self.with_block(&detail, |b| b.records().has_dirty())? {
                return Err(FormError::PendingChanges(detail));
            }
        }
        self.with_block(block, |b| b.enter_query())?;
        for detail in self.descendants(block) {
            self.with_block(&detail, |b| {
                if !b.is_query_mode() {
                    b.clear();
                }
            })?;
            self.render(&detail);
        }
        self.render(block);
        Ok(true)
    }

    /// Run the query for `block`, redirected to the topmost master that
    /// still holds query filters, and cascade into every detail.
    pub async fn execute_query(&self, block: &str) -> Result<bool> {
        let chain_blocks = {
            let st = self.st();
            if !st.blocks.contains_key(block) {
                return Err(FormError::UnknownBlock(block.to_string()));
            }
            let top = st.coordinator.query_master(block, |b| {
                st.blocks.get(b).map(|x| x.is_query_mode()).unwrap_or(false)
            });
            let mut all = vec![top.clone()];
            all.extend(st.coordinator.descendants(&top));
            all
        };
        let top = chain_blocks[0].clone();

        if !self.with_block(&top, |b| b.allowed().query)? {
            return Err(FormError::NotAllowed {
                block: top,
                operation: "query",
            });
        }
        for b in &chain_blocks {
            if self.with_block(b, |x| x.records().has_dirty() || x.has_pending_changes())? {
                return Err(FormError::PendingChanges(b.clone()));
            }
        }
        if !self
            .guarded(&top, self.event(EventKind::PreQuery, &top, None)?)
            .await?
        {
            return Ok(false);
        }

        let chain = self
            .st()
            .queries
            .start(chain_blocks.iter().map(String::as_str));
        log::debug!("form '{}': query {chain:?} from '{top}'", self.name);
        for detail in &chain_blocks[1..] {
            let rows = self.with_block(detail, |b| {
                if !b.is_query_mode() {
                    b.clear();
                }
                b.rows()
            })?;
            for row in 0..rows as i32 {
                self.ctx.renderer().clear(detail, row);
            }
        }

        self.run_cascade(chain, vec![top.clone()]).await?;
        self.guarded(&top, self.event(EventKind::PostQuery, &top, None)?)
            .await?;
        Ok(true)
    }

    /// Re-query only the details joined on `field` of `block`, each under
    /// a fresh chain.
    pub async fn query_field_details(&self, block: &str, field: &str) -> Result<()> {
        let targets: Vec<(String, ChainId)> = {
            let mut st = self.st();
            let column = st
                .blocks
                .get(block)
                .and_then(|b| b.field_def(field))
                .and_then(|d| d.column.clone());
            let Some(column) = column else {
                return Ok(());
            };
            let details: Vec<String> = st
                .coordinator
                .details_joined_on(block, &column)
                .into_iter()
                .map(|l| l.detail.clone())
                .collect();
            details
                .into_iter()
                .map(|d| {
                    let mut covered = vec![d.clone()];
                    covered.extend(st.coordinator.descendants(&d));
                    let chain = st.queries.start(covered.iter().map(String::as_str));
                    (d, chain)
                })
                .collect()
        };
        for (detail, chain) in targets {
            self.run_cascade(chain, vec![detail]).await?;
        }
        Ok(())
    }

    async fn requery_details(&self, master: &str) -> Result<()> {
        let (details, covered) = {
            let st = self.st();
            let details: Vec<String> = st
                .coordinator
                .details_of(master)
                .into_iter()
                .map(|l| l.detail.clone())
                .collect();
            (details, st.coordinator.descendants(master))
        };
        if details.is_empty() {
            return Ok(());
        }
        let chain = self.st().queries.start(covered.iter().map(String::as_str));
        self.run_cascade(chain, details).await
    }

    /// Depth-first query of `start` and everything below it.
    async fn run_cascade(&self, chain: ChainId, start: Vec<String>) -> Result<()> {
        let mut stack: Vec<String> = start.into_iter().rev().collect();
        while let Some(block) = stack.pop() {
            if !self.query_block(&block, chain).await? {
                continue;
            }
            let details: Vec<String> = {
                let st = self.st();
                st.coordinator
                    .details_of(&block)
                    .into_iter()
                    .rev()
                    .map(|l| l.detail.clone())
                    .collect()
            };
            stack.extend(details);
        }
        Ok(())
    }

    fn plan_query(&self, block: &str, chain: ChainId) -> Result<QueryPlan> {
        let st = self.st();
        if !st.queries.is_current(block, chain) {
            return Ok(QueryPlan::Stale);
        }
        let b = st
            .blocks
            .get(block)
            .ok_or_else(|| FormError::UnknownBlock(block.to_string()))?;
        let Some(ds) = b.datasource() else {
            return Ok(QueryPlan::Clear);
        };
        let mut criteria = b.criteria().map_err(|reason| FormError::InvalidFilter {
            block: block.to_string(),
            reason,
        })?;
        if let Some(link) = st.coordinator.master_of(block) {
            let master = st
                .blocks
                .get(&link.master)
                .filter(|m| !m.is_query_mode())
                .and_then(|m| m.current_record())
                .filter(|r| !r.state().is_local());
            let Some(master) = master else {
                return Ok(QueryPlan::Clear);
            };
            for (mcol, dcol) in &link.join {
                let v = master.get(mcol).cloned().unwrap_or(Value::Null);
                criteria.push(Criterion::eq(dcol, v, ds.datatype(dcol)));
            }
        }
        Ok(QueryPlan::Select {
            stmt: ds.select(&criteria),
            rows: b.fetch_size(),
        })
    }

    /// Returns false when the result belongs to a superseded chain.
    async fn query_block(&self, block: &str, chain: ChainId) -> Result<bool> {
        let (stmt, rows) = match self.plan_query(block, chain)? {
            QueryPlan::Stale => {
                log::debug!("'{block}': chain {chain:?} superseded before select");
                return Ok(false);
            }
            QueryPlan::Clear => {
                self.with_block(block, |b| b.clear())?;
                self.render(block);
                return Ok(true);
            }
            QueryPlan::Select { stmt, rows } => (stmt, rows),
        };

        let (cursor, fetched) = self
            .connection()?
            .select(stmt.sql, stmt.bindvalues, rows)
            .await?;

        let loaded = {
            let mut st = self.st();
            if st.queries.is_current(block, chain) {
                if let Some(b) = st.blocks.get_mut(block) {
                    b.load(fetched.rows, fetched.more, Some(cursor), chain);
                }
                true
            } else {
                false
            }
        };
        if !loaded {
            log::debug!("'{block}': discarding result of superseded chain {chain:?}");
            return Ok(false);
        }
        self.fire_on_fetch(block, 0).await?;
        self.render(block);
        Ok(true)
    }

    /// Fire OnFetch for records `from..`, each made current while its
    /// trigger runs. A rejection drops that record and everything after.
    async fn fire_on_fetch(&self, block: &str, from: usize) -> Result<()> {
        if !self.ctx.triggers().has(EventKind::OnFetch) {
            return Ok(());
        }
        let (ids, saved) = self.with_block(block, |b| {
            b.guard_mut()
                .set_event_transaction(EventKind::OnFetch, block, None)?;
            let ids: Vec<RecordId> = b.records().iter().skip(from).map(|r| r.id()).collect();
            Ok::<_, FormError>((ids, b.position()))
        })??;

        let mut cut = None;
        for (i, id) in ids.iter().enumerate() {
            let ev = self.with_block(block, |b| {
                b.show(from + i);
                TriggerEvent::block(EventKind::OnFetch, &self.name, block)
                    .at(b.current_row_index() as i32, Some(*id))
            })?;
            if !self.ctx.triggers().fire(ev).await {
                cut = Some(from + i);
                break;
            }
        }

        self.with_block(block, |b| {
            if let Some(at) = cut {
                while b.records().len() > at {
                    b.records_mut().remove(at);
                }
                b.records_mut().set_eof(true);
                b.take_cursor();
            }
            b.restore_position(saved);
            b.clamp();
            b.guard_mut().end_event_transaction(EventKind::OnFetch, block);
        })?;
        Ok(())
    }

    // ----- record operations -----

    /// Create a placeholder before or after the current record.
    pub async fn insert(&self, block: &str, before: bool) -> Result<bool> {
        let (querymode, allowed, missing, presets) = {
            let st = self.st();
            let b = st
                .blocks
                .get(block)
                .ok_or_else(|| FormError::UnknownBlock(block.to_string()))?;
            let missing = st.coordinator.ancestors(block).into_iter().find(|a| {
                st.blocks
                    .get(a)
                    .and_then(|m| m.current_record())
                    .map(|r| matches!(r.state(), RecordState::New | RecordState::QueryFilter))
                    .unwrap_or(true)
            });
            let presets: Vec<(String, Value)> = st
                .coordinator
                .master_of(block)
                .and_then(|l| {
                    let m = st.blocks.get(&l.master)?.current_record()?;
                    Some(
                        l.join
                            .iter()
                            .map(|(mc, dc)| (dc.clone(), m.get(mc).cloned().unwrap_or(Value::Null)))
                            .collect(),
                    )
                })
                .unwrap_or_default();
            (b.is_query_mode(), b.allowed().insert, missing, presets)
        };
        if querymode || !allowed {
            return Err(FormError::NotAllowed {
                block: block.to_string(),
                operation: "insert",
            });
        }
        if let Some(master) = missing {
            self.ctx.message(
                Severity::Info,
                "Insert",
                format!("'{block}' needs a current record in '{master}' first"),
            );
            return Ok(false);
        }

        let has_current = self.with_block(block, |b| b.current_record().is_some())?;
        if has_current {
            if !self.validate_row(block).await? {
                self.refocus(block);
                return Ok(false);
            }
            let pending = self.with_block(block, |b| {
                (b.flush_strategy() == FlushStrategy::Row)
                    .then(|| b.current_record().filter(|r| r.state().needs_flush()).map(|r| r.id()))
                    .flatten()
            })?;
            if let Some(id) = pending {
                if !self.flush_record(block, id).await? {
                    return Ok(false);
                }
            }
            if !self
                .guarded(block, self.event(EventKind::PostRecord, block, None)?)
                .await?
            {
                return Ok(false);
            }
        }

        let (id, saved) = self.with_block(block, |b| {
            let saved = b.position();
            let id = b.records_mut().allocate_id();
            let columns: Vec<String> = match b.datasource() {
                Some(ds) => ds.column_names().map(str::to_string).collect(),
                None => b.field_defs().iter().filter_map(|d| d.column.clone()).collect(),
            };
            let mut record = Record::placeholder(id, columns.iter().map(String::as_str));
            for (column, value) in presets {
                record.preset(&column, value);
            }
            let idx = if b.records().is_empty() {
                0
            } else if before {
                b.record_index()
            } else {
                b.record_index() + 1
            };
            b.records_mut().insert(idx, record);
            b.show(idx);
            (id, saved)
        })?;

        let undo_create = |form: &Self| -> Result<()> {
            form.with_block(block, |b| {
                if let Some(pos) = b.records().position(id) {
                    b.records_mut().remove(pos);
                }
                b.restore_position(saved);
                b.clamp();
            })?;
            form.render(block);
            Ok(())
        };

        if !self
            .guarded(block, self.event(EventKind::OnCreateRecord, block, None)?)
            .await?
            || !self
                .guarded(block, self.event(EventKind::PreRecord, block, None)?)
                .await?
        {
            undo_create(self)?;
            return Ok(false);
        }
        self.render(block);
        self.requery_details(block).await?;
        Ok(true)
    }

    /// Toggle the delete mark of the current record. Records the backend
    /// never saw are dropped on the spot.
    pub async fn delete(&self, block: &str) -> Result<bool> {
        let (querymode, allowed, current, idx) = self.with_block(block, |b| {
            (
                b.is_query_mode(),
                b.allowed().delete,
                b.current_record().map(|r| (r.id(), r.state())),
                b.record_index(),
            )
        })?;
        if querymode {
            return Err(FormError::NotAllowed {
                block: block.to_string(),
                operation: "delete",
            });
        }
        let Some((id, state)) = current else {
            return Ok(false);
        };
        if state.is_local() {
            self.with_block(block, |b| {
                b.records_mut().remove(idx);
                b.clamp();
            })?;
            self.render(block);
            return Ok(true);
        }
        if !allowed {
            return Err(FormError::NotAllowed {
                block: block.to_string(),
                operation: "delete",
            });
        }
        if state == RecordState::Deleted {
            return Ok(false);
        }
        if state != RecordState::Delete {
            if !self
                .guarded(block, self.event(EventKind::PreDelete, block, None)?)
                .await?
            {
                return Ok(false);
            }
            if !self.lock_record(block, id).await? {
                return Ok(false);
            }
        }
        let toggled = self.with_block(block, |b| {
            b.records_mut()
                .by_id_mut(id)
                .map(|r| r.toggle_delete())
                .unwrap_or(false)
        })?;
        self.render(block);
        Ok(toggled)
    }

    /// Lock the current record on the backend.
    pub async fn lock(&self, block: &str) -> Result<bool> {
        let current = self.with_block(block, |b| {
            if b.is_query_mode() {
                return Err(FormError::NotAllowed {
                    block: block.to_string(),
                    operation: "lock",
                });
            }
            Ok(b.current_record().map(|r| r.id()))
        })??;
        match current {
            Some(id) => self.lock_record(block, id).await,
            None => Ok(false),
        }
    }

    async fn lock_record(&self, block: &str, id: RecordId) -> Result<bool> {
        let prepared = self.with_block(block, |b| {
            let ds = b.datasource()?;
            let r = b.records().by_id(id)?;
            if r.state().is_local() || r.is_locked() || r.state() == RecordState::Deleted {
                return None;
            }
            Some(ds.lock(r))
        })?;
        let Some((stmt, asserts)) = prepared else {
            return Ok(true);
        };
        let outcome = self
            .connection()?
            .lock(stmt.sql, stmt.bindvalues, asserts)
            .await?;
        self.apply_outcome(block, id, Verb::Lock, outcome).await
    }

    async fn apply_outcome(
        &self,
        block: &str,
        id: RecordId,
        verb: Verb,
        outcome: Outcome,
    ) -> Result<bool> {
        match outcome {
            Outcome::Done { first_lock } => {
                self.with_block(block, |b| {
                    if let Some(r) = b.records_mut().by_id_mut(id) {
                        if verb != Verb::Lock {
                            r.mark_flushed();
                        }
                        r.set_locked(true);
                    }
                })?;
                let at = self.event(EventKind::OnTransaction, block, None)?;
                if first_lock {
                    let ev = TriggerEvent { record: Some(id), ..at.clone() };
                    if !self.guarded(block, ev).await? {
                        log::debug!("'{block}': OnTransaction rejected for {id}");
                    }
                }
                if verb == Verb::Lock {
                    let ev = TriggerEvent {
                        kind: EventKind::OnLock,
                        record: Some(id),
                        ..at
                    };
                    self.guarded(block, ev).await?;
                }
                Ok(true)
            }
            Outcome::Changed { violations, fresh } => {
                self.with_block(block, |b| {
                    if let Some(r) = b.records_mut().by_id_mut(id) {
                        match fresh {
                            Some(values) => r.refresh(values),
                            None => r.set_failed(true),
                        }
                    }
                })?;
                let err = FormError::RecordChanged {
                    block: block.to_string(),
                    record: id.0,
                    columns: violations.join(", "),
                };
                log::warn!("{verb}: {err}");
                self.ctx.message(Severity::Warning, "Record changed", err.to_string());
                self.render(block);
                Ok(false)
            }
            Outcome::Vanished => {
                self.with_block(block, |b| {
                    if let Some(r) = b.records_mut().by_id_mut(id) {
                        r.mark_vanished();
                    }
                })?;
                let err = FormError::RecordDeleted {
                    block: block.to_string(),
                    record: id.0,
                };
                log::warn!("{verb}: {err}");
                self.ctx.message(Severity::Warning, "Record deleted", err.to_string());
                self.render(block);
                Ok(false)
            }
            Outcome::Refused(message) => {
                self.with_block(block, |b| {
                    if let Some(r) = b.records_mut().by_id_mut(id) {
                        r.set_failed(true);
                    }
                })?;
                self.ctx.report(&FormError::backend(verb.as_str(), message));
                self.render(block);
                Ok(false)
            }
        }
    }

    /// Write one record's pending change to the backend.
    async fn flush_record(&self, block: &str, id: RecordId) -> Result<bool> {
        let snapshot = self.with_block(block, |b| {
            let ds = b.datasource()?.clone();
            let r = b.records().by_id(id)?.clone();
            Some((ds, r))
        })?;
        let Some((ds, record)) = snapshot else {
            return Ok(true);
        };
        let conn = self.connection()?;
        match record.state() {
            RecordState::Insert => {
                let ev = TriggerEvent {
                    record: Some(id),
                    ..self.event(EventKind::PreInsert, block, None)?
                };
                if !self.guarded(block, ev).await? {
                    return Ok(false);
                }
                let stmt = ds.insert(&record);
                let outcome = conn.insert(stmt.sql, stmt.bindvalues).await?;
                self.apply_outcome(block, id, Verb::Insert, outcome).await
            }
            RecordState::Update => {
                if !record.is_locked() && !self.lock_record(block, id).await? {
                    return Ok(false);
                }
                let ev = TriggerEvent {
                    record: Some(id),
                    ..self.event(EventKind::PreUpdate, block, None)?
                };
                if !self.guarded(block, ev).await? {
                    return Ok(false);
                }
                match ds.update(&record) {
                    Some((stmt, asserts)) => {
                        let outcome = conn.update(stmt.sql, stmt.bindvalues, asserts).await?;
                        self.apply_outcome(block, id, Verb::Update, outcome).await
                    }
                    None => {
                        self.with_block(block, |b| {
                            if let Some(r) = b.records_mut().by_id_mut(id) {
                                r.mark_flushed();
                            }
                        })?;
                        Ok(true)
                    }
                }
            }
            RecordState::Delete => {
                if !record.is_locked() && !self.lock_record(block, id).await? {
                    return Ok(false);
                }
                let (stmt, asserts) = ds.delete(&record);
                let outcome = conn.delete(stmt.sql, stmt.bindvalues, asserts).await?;
                self.apply_outcome(block, id, Verb::Delete, outcome).await
            }
            _ => Ok(true),
        }
    }

    /// Flush every record of `block` with a pending change.
    pub async fn flush(&self, block: &str) -> Result<bool> {
        let ids: Vec<RecordId> = self.with_block(block, |b| {
            b.records()
                .iter()
                .filter(|r| r.state().needs_flush())
                .map(|r| r.id())
                .collect()
        })?;
        let mut ok = true;
        for id in ids {
            if !self.flush_record(block, id).await? {
                ok = false;
                break;
            }
        }
        self.render(block);
        Ok(ok)
    }

    pub async fn flush_all(&self) -> Result<bool> {
        for block in self.block_names() {
            if !self.flush(&block).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Back to the last committed state in every block.
    pub async fn undo(&self) -> Result<()> {
        let blocks = self.block_names();
        self.undo_blocks(&blocks, TriggerEvent::form(EventKind::OnUndo, &self.name))
            .await
    }

    pub async fn undo_block(&self, block: &str) -> Result<()> {
        let ev = self.event(EventKind::OnUndo, block, None)?;
        self.undo_blocks(&[block.to_string()], ev).await
    }

    async fn undo_blocks(&self, blocks: &[String], event: TriggerEvent) -> Result<()> {
        for block in blocks {
            if let Some(running) = self.with_block(block, |b| b.guard().running())? {
                return Err(FormError::UndoFailed {
                    form: self.name.clone(),
                    reason: format!("block '{block}' is running {:?}", running.event),
                });
            }
        }
        if !self.ctx.triggers().fire(event).await {
            return Err(FormError::UndoFailed {
                form: self.name.clone(),
                reason: "OnUndo rejected".to_string(),
            });
        }
        for block in blocks {
            self.with_block(block, |b| b.undo())?;
            self.render(block);
        }
        Ok(())
    }

    /// Drop the records of `block` and its details.
    pub async fn clear(&self, block: &str) -> Result<()> {
        let mut affected = vec![block.to_string()];
        affected.extend(self.descendants(block));
        for b in &affected {
            if self.with_block(b, |x| x.records().has_dirty() || x.has_pending_changes())? {
                return Err(FormError::PendingChanges(b.clone()));
            }
        }
        for b in &affected {
            self.with_block(b, |x| x.clear())?;
            self.render(b);
        }
        Ok(())
    }

    /// Commit went through: adopt every flushed change.
    pub fn synchronize(&self) {
        for block in self.block_names() {
            let _ = self.with_block(&block, |b| b.synchronize());
            self.render(&block);
        }
    }

    // ----- input & validation -----

    /// Raw input typed into a field instance. Moves to the row first when
    /// needed; an empty block gets a fresh record.
    pub async fn input(
        &self,
        block: &str,
        row: i32,
        field: &str,
        instance: usize,
        raw: &str,
    ) -> Result<bool> {
        if self.current_block() != block && !self.go_block(block).await? {
            return Ok(false);
        }
        let (current, offset) = self.with_block(block, |b| (b.current_row_index(), b.offset()))?;
        let target = if row == MIRROR_ROW { current as i32 } else { row };
        if target != current as i32 {
            let Ok(slot) = usize::try_from(target) else {
                return Ok(false);
            };
            if !self.move_to(block, offset + slot).await? {
                return Ok(false);
            }
        }

        let (bound, empty, querymode) = self.with_block(block, |b| {
            (b.current_row().record().is_some(), b.records().is_empty(), b.is_query_mode())
        })?;
        if !bound {
            if !(empty && !querymode && self.insert(block, false).await?) {
                return Ok(false);
            }
        }

        let parsed = self.with_block(block, |b| {
            let def = b.field_def(field).cloned().ok_or_else(|| FormError::UnknownField {
                block: block.to_string(),
                field: field.to_string(),
            })?;
            let idx = b.current_row_index() as i32;
            let status = b.current_row().status();
            if !def.editable_in(status) {
                return Ok(None);
            }
            let outcome = match b.current_row_mut().field_mut(field) {
                Some(f) if status == Status::Qbe => {
                    f.input_filter(instance, raw);
                    Ok(true)
                }
                Some(f) => f.input(instance, raw),
                None => Ok(false),
            };
            if let Some(m) = b.mirror_mut().field_mut(field) {
                if status == Status::Qbe {
                    m.input_filter(instance, raw);
                } else {
                    let _ = m.input(instance, raw);
                }
            }
            Ok::<_, FormError>(Some((idx, outcome)))
        })??;

        match parsed {
            None => Ok(false),
            Some((idx, Err(msg))) => {
                log::debug!("'{block}.{field}': rejected input: {msg}");
                self.ctx.renderer().mark_invalid(block, idx, field, true);
                self.ctx.message(Severity::Info, field, msg);
                Ok(false)
            }
            Some((idx, Ok(_))) => {
                self.ctx.renderer().mark_invalid(block, idx, field, false);
                Ok(true)
            }
        }
    }

    /// Type `raw` into `field` of the current row and validate it.
    pub async fn set_value(&self, block: &str, field: &str, raw: &str) -> Result<bool> {
        let row = self.with_block(block, |b| b.current_row_index() as i32)?;
        if !self.input(block, row, field, 0, raw).await? {
            return Ok(false);
        }
        self.validate_field(block, field).await
    }

    /// Move a dirty field's input into its record.
    pub async fn validate_field(&self, block: &str, field: &str) -> Result<bool> {
        let step = self.with_block(block, |b| {
            let row = b.current_row();
            let status = row.status();
            let f = row.field(field).ok_or_else(|| FormError::UnknownField {
                block: block.to_string(),
                field: field.to_string(),
            })?;
            if !f.is_dirty() {
                return Ok(FieldStep::Done(f.is_valid(status)));
            }
            if f.error().is_some() {
                return Ok(FieldStep::Done(false));
            }
            let column = f.def().column.clone();
            if status == Status::Qbe {
                let value = f.pending_value().clone();
                if let (Some(column), Some(filter)) = (column, b.current_record_mut()) {
                    filter.set(&column, value);
                }
                if let Some(f) = b.current_row_mut().field_mut(field) {
                    f.accept();
                    f.set_validated(true);
                }
                return Ok(FieldStep::Done(true));
            }
            let Some(record) = b.current_record() else {
                return Ok(FieldStep::Done(false));
            };
            let state = record.state();
            if !state.is_local() && !b.allowed().update {
                return Err(FormError::NotAllowed {
                    block: block.to_string(),
                    operation: "update",
                });
            }
            Ok::<_, FormError>(FieldStep::Edit {
                record: record.id(),
                first_edit: !record.is_dirty(),
                needs_lock: !state.is_local() && !record.is_locked(),
            })
        })??;

        let (id, first_edit, needs_lock) = match step {
            FieldStep::Done(valid) => return Ok(valid),
            FieldStep::Edit {
                record,
                first_edit,
                needs_lock,
            } => (record, first_edit, needs_lock),
        };

        if first_edit {
            let ev = self.event(EventKind::OnEdit, block, Some(field))?;
            if !self.guarded(block, ev).await? {
                self.with_block(block, |b| {
                    let original = b
                        .field_def(field)
                        .and_then(|d| d.column.clone())
                        .and_then(|c| b.records().by_id(id).and_then(|r| r.get(&c)).cloned())
                        .unwrap_or(Value::Null);
                    if let Some(f) = b.current_row_mut().field_mut(field) {
                        f.load(original);
                    }
                })?;
                self.display_current(block);
                return Ok(false);
            }
        }
        if needs_lock && !self.lock_record(block, id).await? {
            return Ok(false);
        }

        let column = self.with_block(block, |b| {
            let row = b.current_row_mut();
            let (column, value) = match row.field_mut(field) {
                Some(f) => (f.def().column.clone(), f.accept()),
                None => return None,
            };
            row.set_validated(false);
            if let Some(m) = b.mirror_mut().field_mut(field) {
                m.load(value.clone());
            }
            if let (Some(c), Some(r)) = (&column, b.records_mut().by_id_mut(id)) {
                r.set(c, value);
            }
            column
        })?;

        let ev = self.event(EventKind::WhenValidateField, block, Some(field))?;
        let valid = self.guarded(block, ev).await?;
        let row = self.with_block(block, |b| {
            if let Some(f) = b.current_row_mut().field_mut(field) {
                f.set_validated(valid);
            }
            b.current_row_index() as i32
        })?;
        self.ctx.renderer().mark_invalid(block, row, field, !valid);
        if !valid {
            return Ok(false);
        }
        self.display_current(block);

        if let Some(column) = column {
            let joined = !self
                .st()
                .coordinator
                .details_joined_on(block, &column)
                .is_empty();
            if joined {
                self.query_field_details(block, field).await?;
            }
        }
        Ok(true)
    }

    /// Validate every dirty field of the current row, then the required
    /// check and WhenValidateRecord.
    pub async fn validate_row(&self, block: &str) -> Result<bool> {
        let (dirty, bound, querymode) = self.with_block(block, |b| {
            let row = b.current_row();
            let dirty: Vec<String> = row
                .fields()
                .filter(|f| f.is_dirty())
                .map(|f| f.name().to_string())
                .collect();
            (dirty, row.record().is_some(), b.is_query_mode())
        })?;
        if !bound {
            return Ok(true);
        }
        for field in dirty {
            if !self.validate_field(block, &field).await? {
                return Ok(false);
            }
        }
        if querymode {
            return Ok(true);
        }

        let check = self.with_block(block, |b| {
            let state = b.current_record().map(|r| r.state())?;
            if state == RecordState::New || state.is_deleted() {
                return None;
            }
            let row = b.current_row();
            Some((row.invalid_fields(), row.is_validated(), row.index()))
        })?;
        let Some((invalid, validated, row)) = check else {
            return Ok(true);
        };
        if !invalid.is_empty() {
            for f in &invalid {
                self.ctx.renderer().mark_invalid(block, row, f, true);
            }
            self.with_block(block, |b| b.current_row_mut().set_validated(false))?;
            self.ctx.message(
                Severity::Info,
                "Validation",
                format!("{block}: required: {}", invalid.join(", ")),
            );
            return Ok(false);
        }
        if validated {
            return Ok(true);
        }
        if !self
            .guarded(block, self.event(EventKind::WhenValidateRecord, block, None)?)
            .await?
        {
            return Ok(false);
        }
        self.with_block(block, |b| b.current_row_mut().set_validated(true))?;
        Ok(true)
    }

    /// Validate the current row of every block.
    pub async fn validate(&self) -> Result<bool> {
        for block in self.block_names() {
            if !self.validate_row(&block).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Column values of the record `offset` away from the current one.
    /// During an event transaction only offset 0 is reachable.
    pub fn record_values(&self, block: &str, offset: i64) -> Result<Option<Values>> {
        self.with_block(block, |b| {
            b.guard().check_offset(block, offset)?;
            Ok(b.record_at(offset).map(|r| r.values().clone()))
        })?
    }

    // ----- keys -----

    pub async fn handle_key(&self, block: &str, key: Key) -> Result<()> {
        match key {
            Key::Enter | Key::NextField => {
                self.next_field(block, true).await?;
            }
            Key::PrevField => {
                self.next_field(block, false).await?;
            }
            Key::NextRecord => {
                self.next_record(block, false).await?;
            }
            Key::PrevRecord => {
                self.prev_record(block, false).await?;
            }
            Key::PageDown => {
                self.next_record(block, true).await?;
            }
            Key::PageUp => {
                self.prev_record(block, true).await?;
            }
            Key::InsertBefore => {
                self.insert(block, true).await?;
            }
            Key::InsertAfter => {
                self.insert(block, false).await?;
            }
            Key::Delete => {
                self.delete(block).await?;
            }
            Key::EnterQuery => {
                self.enter_query_mode(block).await?;
            }
            Key::ExecuteQuery => {
                self.execute_query(block).await?;
            }
            Key::Lock => {
                self.lock(block).await?;
            }
            Key::Commit => {
                self.ctx.commit().await?;
            }
            Key::Rollback => {
                self.ctx.rollback().await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, address: &FieldAddress, instance: usize, event: InputEvent) -> Result<()> {
        match event.kind {
            InputKind::Change => {
                if let Some(value) = event.value {
                    self.input(&address.block, address.row, &address.field, instance, &value)
                        .await?;
                }
            }
            InputKind::Blur => {
                self.validate_field(&address.block, &address.field).await?;
            }
            InputKind::Focus => {
                if self.go_block(&address.block).await? {
                    self.go_field(&address.block, &address.field).await?;
                }
            }
            InputKind::KeyDown => {
                if let Some(key) = event.key {
                    self.handle_key(&address.block, key).await?;
                }
            }
            InputKind::KeyUp | InputKind::Click => {}
        }
        Ok(())
    }
}

#[async_trait]
impl InputTarget for Form {
    /// Errors become messages; the queue keeps running.
    async fn on_input(
        &self,
        address: &FieldAddress,
        instance: usize,
        event: InputEvent,
    ) -> anyhow::Result<()> {
        if let Err(e) = self.dispatch(address, instance, event).await {
            log::warn!("form '{}': {}.{}: {e}", self.name, address.block, address.field);
            self.ctx.report(&e);
        }
        Ok(())
    }
}
