// Console front end: loads a form definition, connects to the backend and
// drives the form from line commands through the event queue.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use blockform::config::{load, Backend, Config};
use blockform::{
    ApplicationContext, FieldAddress, Form, FormDefinition, HttpTransport, Indicator, InputEvent,
    InputTarget, Key, MemoryBackend, Message, RecordView, Renderer, Transport,
};

const DEMO_FORM: &str = include_str!("../../demos/orders.toml");

const HELP: &str = "\
commands:
  query [block]        run the query (filters typed in query mode apply)
  filter [block]       enter query mode
  next | prev          move one record
  pagedown | pageup    move one page
  set <field> <value>  type a value into the current record
  insert | delete      create a record / toggle the delete mark
  lock                 lock the current record
  block <name>         switch to another block
  commit | rollback    end the transaction
  show                 print the current block
  quit";

/// Prints every render call as a line.
struct ConsoleRenderer;

impl Renderer for ConsoleRenderer {
    fn display(&self, block: &str, row: i32, view: &RecordView) {
        if row < 0 {
            return;
        }
        let cells: Vec<String> = view.values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let failed = if view.failed { " !" } else { "" };
        println!("  {block}[{row}] {:?}{failed}  {}", view.status, cells.join("  "));
    }

    fn clear(&self, block: &str, row: i32) {
        log::debug!("clear {block}[{row}]");
    }

    fn set_indicator(&self, block: &str, row: i32, indicator: Indicator) {
        if indicator != Indicator::Off {
            log::debug!("{block}[{row}] is {indicator:?}");
        }
    }

    fn mark_invalid(&self, block: &str, row: i32, field: &str, invalid: bool) {
        if invalid {
            println!("  {block}[{row}].{field} is invalid");
        }
    }

    fn focus(&self, block: &str, row: i32, field: &str) {
        log::debug!("focus {block}[{row}].{field}");
    }

    fn block_input(&self, blocked: bool) {
        log::debug!("input blocked: {blocked}");
    }

    fn message(&self, message: &Message) {
        println!("[{:?}] {}: {}", message.severity, message.title, message.text);
    }
}

/// Tables for every block, plus a few rows when running the built-in demo.
fn memory_backend(def: &FormDefinition, demo: bool) -> Result<Arc<MemoryBackend>> {
    let backend = Arc::new(MemoryBackend::new()?);
    for block in &def.blocks {
        let Some(table) = &block.table else {
            continue;
        };
        let columns: Vec<&str> = block
            .fields
            .iter()
            .filter(|f| !f.unbound)
            .map(|f| f.column.as_deref().unwrap_or(&f.name))
            .collect();
        let key: Vec<&str> = block.primary_key.iter().map(String::as_str).collect();
        backend.create_table(table, &columns, &key)?;
    }
    if demo {
        backend.seed(
            "orders",
            vec![
                json!([1, "Ada", "2024-03-01"]),
                json!([2, "Grace", "2024-03-04"]),
                json!([3, "Linus", "2024-03-09"]),
                json!([4, "Barbara", "2024-03-12"]),
            ],
        )?;
        backend.seed(
            "lines",
            vec![
                json!([10, 1, "paper", 5]),
                json!([11, 1, "ink", 2]),
                json!([20, 2, "stapler", 1]),
                json!([30, 3, "pens", 12]),
            ],
        )?;
    }
    Ok(backend)
}

fn transport(config: &Config, def: &FormDefinition, demo: bool) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match config.backend {
        Backend::Memory => memory_backend(def, demo)?,
        Backend::Http => Arc::new(HttpTransport::new(
            &config.backend_url,
            config.request_timeout_ms,
            u8::try_from(config.request_retries).unwrap_or(u8::MAX),
        )),
    };
    Ok(transport)
}

/// Queue a keystroke or input on the current block and wait for it.
async fn send(ctx: &Arc<ApplicationContext>, form: &Arc<Form>, field: &str, event: InputEvent) {
    let block = form.current_block();
    let row = form
        .inspect(&block, |b| b.current_row_index() as i32)
        .unwrap_or(0);
    let target: Arc<dyn InputTarget> = form.clone();
    ctx.queue()
        .stack(target, FieldAddress::new(&block, field, row), 0, &event);
    ctx.queue().wait_idle().await;
}

async fn key(ctx: &Arc<ApplicationContext>, form: &Arc<Form>, key: Key) {
    let block = form.current_block();
    let field = form
        .inspect(&block, |b| b.current_field().unwrap_or_default().to_string())
        .unwrap_or_default();
    send(ctx, form, &field, InputEvent::key(key)).await;
}

fn show(form: &Form) {
    let block = form.current_block();
    let listing = form.inspect(&block, |b| {
        let current = b.record_index();
        let mut lines = vec![format!(
            "{block}: {} record(s){}{}",
            b.records().len(),
            if b.records().eof() { "" } else { ", more available" },
            if b.is_query_mode() { ", query mode" } else { "" }
        )];
        for (i, r) in b.records().iter().enumerate() {
            let marker = if i == current { '>' } else { ' ' };
            let cells: Vec<String> = r.values().iter().map(|(k, v)| format!("{k}={v}")).collect();
            lines.push(format!("{marker} {:?} {}", r.state(), cells.join("  ")));
        }
        lines
    });
    match listing {
        Ok(lines) => lines.iter().for_each(|l| println!("{l}")),
        Err(e) => println!("{e}"),
    }
}

async fn focus_block(ctx: &Arc<ApplicationContext>, form: &Arc<Form>, block: Option<&str>) {
    if let Some(name) = block {
        let field = form
            .inspect(name, |b| b.current_field().unwrap_or_default().to_string())
            .unwrap_or_default();
        let target: Arc<dyn InputTarget> = form.clone();
        ctx.queue()
            .stack(target, FieldAddress::new(name, &field, 0), 0, &InputEvent::focus());
        ctx.queue().wait_idle().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = load().context("Failed to load configuration")?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.as_str()))
        .init();
    config.print_summary();

    let (def, demo) = match &config.form_file {
        Some(path) => (FormDefinition::load(Path::new(path))?, false),
        None => (FormDefinition::from_toml_str(DEMO_FORM)?, true),
    };

    let transport = transport(&config, &def, demo)?;
    let username = config.username.clone();
    let password = config.password.clone();
    let ctx = ApplicationContext::new(config, Arc::new(ConsoleRenderer));
    let conn = ctx.add_connection(&def.connection, transport);
    conn.connect(username.as_deref(), password.as_deref())
        .await
        .with_context(|| format!("connecting '{}'", def.connection))?;

    let form = def.build(&ctx)?;
    form.open().await?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("{}> ", form.current_block());
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else {
            continue;
        };
        match cmd {
            "quit" | "exit" => break,
            "help" => println!("{HELP}"),
            "query" => {
                focus_block(&ctx, &form, words.next()).await;
                key(&ctx, &form, Key::ExecuteQuery).await;
            }
            "filter" => {
                focus_block(&ctx, &form, words.next()).await;
                key(&ctx, &form, Key::EnterQuery).await;
            }
            "next" => key(&ctx, &form, Key::NextRecord).await,
            "prev" => key(&ctx, &form, Key::PrevRecord).await,
            "pagedown" => key(&ctx, &form, Key::PageDown).await,
            "pageup" => key(&ctx, &form, Key::PageUp).await,
            "insert" => key(&ctx, &form, Key::InsertAfter).await,
            "delete" => key(&ctx, &form, Key::Delete).await,
            "lock" => key(&ctx, &form, Key::Lock).await,
            "commit" => key(&ctx, &form, Key::Commit).await,
            "rollback" => key(&ctx, &form, Key::Rollback).await,
            "block" => focus_block(&ctx, &form, words.next()).await,
            "set" => {
                let (Some(field), value) = (words.next(), words.collect::<Vec<_>>().join(" ")) else {
                    println!("usage: set <field> <value>");
                    continue;
                };
                send(&ctx, &form, field, InputEvent::change(value)).await;
                send(&ctx, &form, field, InputEvent::blur()).await;
            }
            "show" => show(&form),
            other => println!("unknown command '{other}' (try 'help')"),
        }
    }

    if form.is_dirty() {
        log::info!("discarding uncommitted changes");
        ctx.rollback().await.ok();
    }
    if let Err(e) = conn.disconnect().await {
        log::warn!("disconnect: {e}");
    }
    Ok(())
}
