//! Form behavior against the in-memory backend: queries, navigation,
//! master/detail cascades, inserts, query mode and trigger rules.

mod common;

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blockform::{
    EventKind, FieldAddress, FormError, InputEvent, InputTarget, Key, RecordState, Severity,
    TriggerScope, Verb,
};
use common::Harness;

#[tokio::test]
async fn query_cascades_into_details() {
    let h = Harness::new().await;
    let form = h.form("orders");
    assert!(form.open().await.unwrap());

    assert!(form.execute_query("orders").await.unwrap());
    assert_eq!(h.column(&form, "orders", "id"), vec![json!(1), json!(2)]);
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("paper"), json!("ink")]);
    assert_eq!(h.column(&form, "lines", "order_id"), vec![json!(1), json!(1)]);
}

#[tokio::test]
async fn scrolling_fetches_pages_and_requeries_details() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();

    assert!(form.next_record("orders", false).await.unwrap());
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("stapler")]);

    // the third order is past the first page
    assert!(form.next_record("orders", false).await.unwrap());
    assert_eq!(h.column(&form, "orders", "id").len(), 4);
    let (offset, row) = form.inspect("orders", |b| (b.offset(), b.current_row_index())).unwrap();
    assert_eq!((offset, row), (1, 1));
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("pens")]);
    assert_eq!(h.backend.count(Verb::Fetch), 1);

    assert!(form.prev_record("orders", false).await.unwrap());
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("stapler")]);
}

#[tokio::test]
async fn detail_insert_presets_join_columns() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();

    assert!(form.go_block("lines").await.unwrap());
    assert_eq!(form.current_block(), "lines");
    assert!(form.insert("lines", false).await.unwrap());
    let (index, order_id, state) = form
        .inspect("lines", |b| {
            let r = b.current_record().unwrap();
            (b.record_index(), r.get("order_id").cloned(), r.state())
        })
        .unwrap();
    assert_eq!(index, 1);
    assert_eq!(order_id, Some(json!(1)));
    assert_eq!(state, RecordState::New);

    assert!(form.set_value("lines", "id", "12").await.unwrap());
    assert!(form.set_value("lines", "item", "glue").await.unwrap());
    assert!(h.ctx.commit().await.unwrap());
    assert_eq!(h.backend_value("lines", 12, "order_id"), Some(json!(1)));
    assert_eq!(h.backend_value("lines", 12, "item"), Some(json!("glue")));
}

#[tokio::test]
async fn detail_insert_needs_a_master_record() {
    let h = Harness::new().await;
    let form = h.form("orders");

    assert!(!form.insert("lines", false).await.unwrap());
    assert!(h
        .renderer
        .messages()
        .iter()
        .any(|m| m.severity == Severity::Info && m.text.contains("needs a current record in 'orders'")));
    assert!(h.column(&form, "lines", "id").is_empty());
}

#[tokio::test]
async fn leaving_an_untouched_placeholder_drops_it() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();

    assert!(form.insert("orders", true).await.unwrap());
    assert_eq!(h.column(&form, "orders", "id").len(), 3);
    assert!(form.next_record("orders", false).await.unwrap());
    assert_eq!(h.column(&form, "orders", "id"), vec![json!(1), json!(2)]);
    let current = form
        .inspect("orders", |b| b.current_record().and_then(|r| r.get("id").cloned()))
        .unwrap();
    assert_eq!(current, Some(json!(1)));
}

#[tokio::test]
async fn query_mode_filters_and_refuses_edits() {
    let h = Harness::new().await;
    let form = h.form("orders");

    assert!(form.enter_query_mode("orders").await.unwrap());
    assert!(form.set_value("orders", "customer", "Grace").await.unwrap());
    assert!(matches!(
        form.insert("orders", false).await,
        Err(FormError::NotAllowed { operation: "insert", .. })
    ));
    assert!(matches!(
        form.delete("orders").await,
        Err(FormError::NotAllowed { operation: "delete", .. })
    ));

    assert!(form.execute_query("orders").await.unwrap());
    assert_eq!(h.column(&form, "orders", "id"), vec![json!(2)]);
    assert!(!form.inspect("orders", |b| b.is_query_mode()).unwrap());
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("stapler")]);
}

#[tokio::test]
async fn unparsable_filter_is_rejected() {
    let h = Harness::new().await;
    let form = h.form("orders");

    form.enter_query_mode("orders").await.unwrap();
    form.set_value("orders", "id", "abc").await.unwrap();
    assert!(matches!(
        form.execute_query("orders").await,
        Err(FormError::InvalidFilter { .. })
    ));
    assert_eq!(h.backend.count(Verb::Select), 0);
}

#[tokio::test]
async fn pending_changes_block_a_new_query() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();

    form.set_value("orders", "customer", "Zed").await.unwrap();
    assert!(matches!(
        form.execute_query("orders").await,
        Err(FormError::PendingChanges(block)) if block == "orders"
    ));
    assert!(matches!(
        form.enter_query_mode("orders").await,
        Err(FormError::PendingChanges(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn late_result_of_a_superseded_query_is_discarded() {
    let h = Harness::new().await;
    let form = h.form("orders");
    h.backend.delay_next_select(Duration::from_millis(50));

    let first = form.execute_query("orders");
    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        form.enter_query_mode("orders").await?;
        form.set_value("orders", "id", "2").await?;
        form.execute_query("orders").await
    };
    let (first, second) = tokio::join!(first, second);
    assert!(first.unwrap());
    assert!(second.unwrap());

    assert_eq!(h.column(&form, "orders", "id"), vec![json!(2)]);
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("stapler")]);
    // the superseded chain never reached its detail
    assert_eq!(h.backend.count(Verb::Select), 3);
}

#[tokio::test]
async fn on_fetch_rejection_truncates_the_result() {
    let h = Harness::new().await;
    let form = h.form("orders");
    let ctx = Arc::downgrade(&h.ctx);
    let far_read_refused = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let refused = far_read_refused.clone();
        let seen = seen.clone();
        h.ctx.triggers().on_sync(
            EventKind::OnFetch,
            TriggerScope::block("orders", "orders"),
            "stop at closed",
            move |_| {
                let Some(form) = ctx.upgrade().and_then(|c| c.form("orders").ok()) else {
                    return true;
                };
                if matches!(
                    form.record_values("orders", 1),
                    Err(FormError::TransactionRowAccess { .. })
                ) {
                    refused.store(true, Ordering::SeqCst);
                }
                let values = form.record_values("orders", 0).unwrap().unwrap();
                seen.lock().unwrap().push(values["id"].clone());
                values["status"] != json!("CLOSED")
            },
        );
    }

    form.execute_query("orders").await.unwrap();
    assert!(form.next_record("orders", false).await.unwrap());
    assert!(!form.next_record("orders", false).await.unwrap());

    assert_eq!(h.column(&form, "orders", "id"), vec![json!(1), json!(2)]);
    assert!(form.inspect("orders", |b| b.records().eof()).unwrap());
    assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2), json!(3)]);
    assert!(far_read_refused.load(Ordering::SeqCst));
}

#[tokio::test]
async fn rejected_pre_record_keeps_the_position() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();
    h.ctx.triggers().on_sync(
        EventKind::PreRecord,
        TriggerScope::block("orders", "orders"),
        "pinned",
        |_| false,
    );

    assert!(!form.next_record("orders", false).await.unwrap());
    assert_eq!(form.inspect("orders", |b| b.record_index()).unwrap(), 0);
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("paper"), json!("ink")]);
}

#[tokio::test]
async fn undo_is_refused_while_a_trigger_runs() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();

    let ctx = Arc::downgrade(&h.ctx);
    let refused = Arc::new(AtomicBool::new(false));
    let flag = refused.clone();
    h.ctx.triggers().on(
        EventKind::OnLock,
        TriggerScope::form("orders"),
        "undo inside lock",
        move |_| {
            let ctx = ctx.clone();
            let flag = flag.clone();
            async move {
                if let Some(form) = ctx.upgrade().and_then(|c| c.form("orders").ok()) {
                    if matches!(form.undo().await, Err(FormError::UndoFailed { .. })) {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
                Ok(true)
            }
        },
    );

    assert!(form.lock("orders").await.unwrap());
    assert!(refused.load(Ordering::SeqCst));
    assert!(form.inspect("orders", |b| b.current_record().unwrap().is_locked()).unwrap());
}

#[tokio::test]
async fn queued_input_runs_in_order() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();
    let edits = Arc::new(AtomicUsize::new(0));
    let counter = edits.clone();
    h.ctx.triggers().on_sync(
        EventKind::OnEdit,
        TriggerScope::field("orders", "orders", "customer"),
        "count edits",
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        },
    );

    let target: Arc<dyn InputTarget> = form.clone();
    let at = FieldAddress::new("orders", "customer", 0);
    let queue = h.ctx.queue();
    queue.stack(target.clone(), at.clone(), 0, &InputEvent::change("Zed"));
    queue.stack(target.clone(), at.clone(), 0, &InputEvent::blur());
    queue.stack(target, at, 0, &InputEvent::key(Key::NextRecord));
    queue.wait_idle().await;

    assert_eq!(queue.processed(), 3);
    assert_eq!(edits.load(Ordering::SeqCst), 1);
    assert_eq!(h.column(&form, "orders", "customer")[0], json!("Zed"));
    assert_eq!(form.inspect("orders", |b| b.record_index()).unwrap(), 1);
    assert_eq!(h.conn.locks(), 1);
}

#[tokio::test]
async fn bad_input_is_marked_not_stored() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();

    assert!(!form.set_value("orders", "id", "twelve").await.unwrap());
    assert_eq!(h.column(&form, "orders", "id")[0], json!(1));
    assert_eq!(h.conn.locks(), 0);
    assert!(h.renderer.calls().iter().any(|c| matches!(
        c,
        blockform::render::RenderCall::Invalid { field, invalid: true, .. } if field == "id"
    )));
}

fn selects_from(h: &Harness, table: &str) -> usize {
    let from = format!(" from {table}");
    h.backend
        .requests()
        .iter()
        .filter(|(v, r)| *v == Verb::Select && r.sql.as_deref().is_some_and(|s| s.contains(&from)))
        .count()
}

#[tokio::test]
async fn editing_a_join_column_requeries_only_its_details() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();
    let orders = selects_from(&h, "orders");
    let lines = selects_from(&h, "lines");
    assert_eq!(h.column(&form, "lines", "item"), vec![json!("paper"), json!("ink")]);

    assert!(form.set_value("orders", "id", "7").await.unwrap());
    assert_eq!(selects_from(&h, "orders"), orders);
    assert_eq!(selects_from(&h, "lines"), lines + 1);
    assert!(h.column(&form, "lines", "item").is_empty());

    // unjoined columns leave the details alone
    assert!(form.set_value("orders", "customer", "Zed").await.unwrap());
    assert_eq!(selects_from(&h, "lines"), lines + 1);
}

#[tokio::test]
async fn rejected_post_record_writes_nothing() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();
    assert!(form.go_block("lines").await.unwrap());
    assert!(form.set_value("lines", "item", "glue").await.unwrap());
    h.ctx.triggers().on_sync(
        EventKind::PostRecord,
        TriggerScope::block("orders", "orders"),
        "stay",
        |_| false,
    );

    assert!(!form.next_record("orders", false).await.unwrap());
    assert_eq!(h.backend.count(Verb::Update), 0);
    assert_eq!(h.backend_value("lines", 10, "item"), Some(json!("paper")));
    assert_eq!(form.inspect("orders", |b| b.record_index()).unwrap(), 0);
    let state = form
        .inspect("lines", |b| b.current_record().unwrap().state())
        .unwrap();
    assert_eq!(state, RecordState::Update);
}

#[tokio::test]
async fn rejected_entry_keeps_the_placeholder() {
    let h = Harness::new().await;
    let form = h.form("orders");
    form.execute_query("orders").await.unwrap();
    assert!(form.insert("orders", false).await.unwrap());
    h.ctx.triggers().on_sync(
        EventKind::PreRecord,
        TriggerScope::block("orders", "orders"),
        "pinned",
        |_| false,
    );

    assert!(!form.prev_record("orders", false).await.unwrap());
    assert_eq!(h.column(&form, "orders", "id").len(), 3);
    let (index, state) = form
        .inspect("orders", |b| (b.record_index(), b.current_record().unwrap().state()))
        .unwrap();
    assert_eq!(index, 1);
    assert_eq!(state, RecordState::New);
}
