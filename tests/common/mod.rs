#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;

use blockform::config::Config;
use blockform::{
    ApplicationContext, Connection, Form, FormDefinition, MemoryBackend, RecordingRenderer,
};

pub const ORDERS: &str = r#"
name = "orders"

[[blocks]]
name = "orders"
table = "orders"
primary_key = ["id"]
order_by = ["id"]
rows = 2
fetch_size = 2

[[blocks.fields]]
name = "id"
datatype = "integer"
required = true

[[blocks.fields]]
name = "customer"
required = true

[[blocks.fields]]
name = "status"

[[blocks]]
name = "lines"
table = "lines"
primary_key = ["id"]
order_by = ["id"]
rows = 3

[[blocks.fields]]
name = "id"
datatype = "integer"
required = true

[[blocks.fields]]
name = "order_id"
datatype = "integer"

[[blocks.fields]]
name = "item"
required = true

[[blocks.fields]]
name = "qty"
datatype = "integer"

[[links]]
master = "orders"
detail = "lines"
join = [["id", "order_id"]]
"#;

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub renderer: Arc<RecordingRenderer>,
    pub ctx: Arc<ApplicationContext>,
    pub conn: Arc<Connection>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config {
            keepalive_ms: 0,
            ..Config::default()
        })
        .await
    }

    pub async fn with_config(config: Config) -> Self {
        let backend = Arc::new(MemoryBackend::new().unwrap());
        backend
            .create_table("orders", &["id", "customer", "status"], &["id"])
            .unwrap();
        backend.seed(
            "orders",
            vec![
                json!([1, "Ada", "OPEN"]),
                json!([2, "Grace", "OPEN"]),
                json!([3, "Linus", "CLOSED"]),
                json!([4, "Barbara", "OPEN"]),
                json!([5, "Edsger", "OPEN"]),
            ],
        )
        .unwrap();
        backend
            .create_table("lines", &["id", "order_id", "item", "qty"], &["id"])
            .unwrap();
        backend.seed(
            "lines",
            vec![
                json!([10, 1, "paper", 5]),
                json!([11, 1, "ink", 2]),
                json!([20, 2, "stapler", 1]),
                json!([30, 3, "pens", 12]),
            ],
        )
        .unwrap();

        let renderer = Arc::new(RecordingRenderer::new());
        let ctx = ApplicationContext::new(config, renderer.clone());
        let conn = ctx.add_connection("main", backend.clone());
        conn.connect(None, None).await.unwrap();
        Self {
            backend,
            renderer,
            ctx,
            conn,
        }
    }

    /// The orders/lines form, optionally renamed.
    pub fn form(&self, name: &str) -> Arc<Form> {
        let text = ORDERS.replacen("name = \"orders\"", &format!("name = \"{name}\""), 1);
        FormDefinition::from_toml_str(&text)
            .unwrap()
            .build(&self.ctx)
            .unwrap()
    }

    pub fn column(&self, form: &Form, block: &str, column: &str) -> Vec<serde_json::Value> {
        form.inspect(block, |b| {
            b.records()
                .iter()
                .map(|r| r.get(column).cloned().unwrap_or_default())
                .collect()
        })
        .unwrap()
    }

    pub fn backend_value(&self, table: &str, id: i64, column: &str) -> Option<serde_json::Value> {
        self.backend
            .rows(table)
            .into_iter()
            .find(|r| r.get("id") == Some(&json!(id)))
            .and_then(|r| r.get(column).cloned())
    }
}
