//! Declarative form definitions loaded from TOML.
//!
//! ```toml
//! name = "orders"
//! connection = "main"
//!
//! [[blocks]]
//! name = "orders"
//! table = "orders"
//! primary_key = ["id"]
//! rows = 5
//! [[blocks.fields]]
//! name = "id"
//! datatype = "integer"
//!
//! [[links]]
//! master = "orders"
//! detail = "lines"
//! join = [["id", "order_id"]]
//! ```

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use crate::block::{Allowed, Block, FlushStrategy};
use crate::context::ApplicationContext;
use crate::datasource::{Column, DataSource};
use crate::form::Form;
use crate::model::{DataType, FieldDef, FieldKind, FieldProperties, SelectOption, StatusProperties};
use crate::query::{BlockCoordinator, Link};

fn default_rows() -> usize {
    1
}
fn default_fetch() -> usize {
    20
}
fn default_instances() -> usize {
    1
}
fn default_kind() -> String {
    "input".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormDefinition {
    pub name: String,
    #[serde(default = "default_connection")]
    pub connection: String,
    pub blocks: Vec<BlockDefinition>,
    #[serde(default)]
    pub links: Vec<Link>,
}

fn default_connection() -> String {
    "main".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockDefinition {
    pub name: String,
    /// Without a table the block is a control block: no queries, no flush.
    pub table: Option<String>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default = "default_rows")]
    pub rows: usize,
    #[serde(default = "default_fetch")]
    pub fetch_size: usize,
    #[serde(default)]
    pub flush: FlushStrategy,
    #[serde(default)]
    pub allowed: Allowed,
    pub fields: Vec<FieldDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDefinition {
    pub name: String,
    /// Defaults to the field name; `unbound = true` leaves the field without one.
    pub column: Option<String>,
    #[serde(default)]
    pub unbound: bool,
    /// display, input, textarea, select, radio or checkbox.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub options: Vec<SelectOption>,
    pub checked: Option<Value>,
    pub unchecked: Option<Value>,
    #[serde(default)]
    pub datatype: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// Per-status overrides; anything not given falls back to the flags above.
    pub qbe: Option<FieldProperties>,
    pub insert: Option<FieldProperties>,
    pub update: Option<FieldProperties>,
}

impl FieldDefinition {
    fn field_kind(&self) -> anyhow::Result<FieldKind> {
        Ok(match self.kind.as_str() {
            "display" => FieldKind::Display,
            "input" => FieldKind::Input,
            "textarea" => FieldKind::Textarea,
            "radio" => FieldKind::Radio,
            "select" => FieldKind::Select {
                options: self.options.clone(),
            },
            "checkbox" => FieldKind::Checkbox {
                checked: self.checked.clone().unwrap_or(Value::Bool(true)),
                unchecked: self.unchecked.clone().unwrap_or(Value::Bool(false)),
            },
            other => bail!("field '{}': unknown kind '{other}'", self.name),
        })
    }

    fn column(&self) -> Option<String> {
        if self.unbound {
            return None;
        }
        Some(self.column.clone().unwrap_or_else(|| self.name.clone()))
    }

    fn to_def(&self) -> anyhow::Result<FieldDef> {
        let base = FieldProperties {
            required: self.required,
            readonly: self.readonly,
            hidden: self.hidden,
            ..FieldProperties::default()
        };
        let mut properties = StatusProperties::uniform(base);
        if let Some(p) = &self.qbe {
            properties.qbe = Arc::new(p.clone());
        }
        if let Some(p) = &self.insert {
            properties.insert = Arc::new(p.clone());
        }
        if let Some(p) = &self.update {
            properties.update = Arc::new(p.clone());
        }
        Ok(FieldDef {
            name: self.name.clone(),
            column: self.column(),
            kind: self.field_kind()?,
            datatype: self.datatype,
            properties,
            instances: self.instances.max(1),
        })
    }
}

impl BlockDefinition {
    fn datasource(&self) -> Option<DataSource> {
        let table = self.table.as_deref()?;
        let columns = self
            .fields
            .iter()
            .filter_map(|f| {
                f.column().map(|name| Column {
                    name,
                    datatype: f.datatype,
                })
            })
            .collect();
        let mut ds = DataSource::new(table, columns, self.primary_key.clone());
        ds.order_by = self.order_by.clone();
        Some(ds)
    }

    fn has_column(&self, column: &str) -> bool {
        self.fields.iter().any(|f| f.column().as_deref() == Some(column))
    }

    fn build(&self) -> anyhow::Result<Block> {
        let defs = self
            .fields
            .iter()
            .map(|f| f.to_def().map(Arc::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Block::new(&self.name, self.datasource(), defs, self.rows)
            .with_flush_strategy(self.flush)
            .with_allowed(self.allowed)
            .with_fetch_size(self.fetch_size))
    }
}

impl FormDefinition {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let def: Self = toml::from_str(text).context("failed to parse form definition")?;
        def.validate()?;
        Ok(def)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read form file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.blocks.is_empty() {
            bail!("form '{}' has no blocks", self.name);
        }
        let mut names = HashSet::new();
        for block in &self.blocks {
            if !names.insert(block.name.as_str()) {
                bail!("form '{}': duplicate block '{}'", self.name, block.name);
            }
            if block.rows == 0 {
                bail!("block '{}': rows must be at least 1", block.name);
            }
            if block.fields.is_empty() {
                bail!("block '{}' has no fields", block.name);
            }
            let mut fields = HashSet::new();
            for f in &block.fields {
                if !fields.insert(f.name.as_str()) {
                    bail!("block '{}': duplicate field '{}'", block.name, f.name);
                }
                f.field_kind()
                    .with_context(|| format!("in block '{}'", block.name))?;
            }
            if block.table.is_some() {
                if block.primary_key.is_empty() {
                    bail!("block '{}': a table block needs a primary key", block.name);
                }
                for key in &block.primary_key {
                    if !block.has_column(key) {
                        bail!("block '{}': key column '{key}' has no field", block.name);
                    }
                }
            }
        }

        let mut coordinator = BlockCoordinator::new();
        for link in &self.links {
            let master = self.block(&link.master)?;
            let detail = self.block(&link.detail)?;
            for (mcol, dcol) in &link.join {
                if !master.has_column(mcol) {
                    bail!("link {} -> {}: '{mcol}' is not a column of '{}'", link.master, link.detail, master.name);
                }
                if !detail.has_column(dcol) {
                    bail!("link {} -> {}: '{dcol}' is not a column of '{}'", link.master, link.detail, detail.name);
                }
            }
            coordinator.link(link.clone())?;
        }
        Ok(())
    }

    fn block(&self, name: &str) -> anyhow::Result<&BlockDefinition> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .with_context(|| format!("form '{}': link references unknown block '{name}'", self.name))
    }

    /// Instantiate the form inside `ctx`.
    pub fn build(&self, ctx: &Arc<ApplicationContext>) -> anyhow::Result<Arc<Form>> {
        let blocks = self
            .blocks
            .iter()
            .map(BlockDefinition::build)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let form = Form::new(ctx, &self.name, &self.connection, blocks, self.links.clone())?;
        log::info!(
            "form '{}' built with {} block(s) on connection '{}'",
            self.name,
            self.blocks.len(),
            self.connection
        );
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: &str = r#"
name = "orders"
connection = "main"

[[blocks]]
name = "orders"
table = "orders"
primary_key = ["id"]
rows = 3
flush = "row"

[[blocks.fields]]
name = "id"
datatype = "integer"
readonly = true

[[blocks.fields]]
name = "customer"
required = true

[[blocks]]
name = "lines"
table = "lines"
primary_key = ["id"]
rows = 5
allowed = { delete = false }

[[blocks.fields]]
name = "id"
datatype = "integer"

[[blocks.fields]]
name = "order_id"
datatype = "integer"

[[blocks.fields]]
name = "status"
kind = "select"
options = [{ value = "open", label = "Open" }, { value = "done", label = "Done" }]

[[links]]
master = "orders"
detail = "lines"
join = [["id", "order_id"]]
"#;

    #[test]
    fn parses_blocks_fields_and_links() {
        let def = FormDefinition::from_toml_str(ORDERS).unwrap();
        assert_eq!(def.blocks.len(), 2);
        assert_eq!(def.links[0].join, vec![("id".to_string(), "order_id".to_string())]);

        let orders = def.blocks[0].build().unwrap();
        assert_eq!(orders.rows(), 3);
        assert_eq!(orders.flush_strategy(), FlushStrategy::Row);
        assert_eq!(orders.datasource().unwrap().datatype("id"), DataType::Integer);

        let customer = orders.field_def("customer").unwrap();
        assert!(customer.required_in(crate::model::Status::Insert));
        assert!(!customer.required_in(crate::model::Status::Qbe));

        let lines = def.blocks[1].build().unwrap();
        assert!(!lines.allowed().delete);
        assert!(lines.allowed().insert);
        assert!(matches!(
            lines.field_def("status").unwrap().kind,
            FieldKind::Select { ref options } if options.len() == 2
        ));
    }

    #[test]
    fn rejects_bad_links() {
        let unknown = ORDERS.replace("detail = \"lines\"", "detail = \"nope\"");
        let err = FormDefinition::from_toml_str(&unknown).unwrap_err();
        assert!(format!("{err:#}").contains("unknown block 'nope'"));

        let bad_join = ORDERS.replace("join = [[\"id\", \"order_id\"]]", "join = [[\"id\", \"missing\"]]");
        let err = FormDefinition::from_toml_str(&bad_join).unwrap_err();
        assert!(format!("{err:#}").contains("'missing'"));

        let cycle = format!("{ORDERS}\n[[links]]\nmaster = \"lines\"\ndetail = \"orders\"\njoin = [[\"order_id\", \"id\"]]\n");
        assert!(FormDefinition::from_toml_str(&cycle).is_err());
    }

    #[test]
    fn rejects_structural_mistakes() {
        let no_key = ORDERS.replacen("primary_key = [\"id\"]\n", "", 1);
        assert!(FormDefinition::from_toml_str(&no_key).is_err());

        let zero_rows = ORDERS.replacen("rows = 3", "rows = 0", 1);
        assert!(FormDefinition::from_toml_str(&zero_rows).is_err());

        assert!(FormDefinition::from_toml_str("name = \"empty\"\nblocks = []\n").is_err());

        let bad_kind = ORDERS.replacen("kind = \"select\"", "kind = \"slider\"", 1);
        let err = FormDefinition::from_toml_str(&bad_kind).unwrap_err();
        assert!(format!("{err:#}").contains("unknown kind 'slider'"));
    }

    #[test]
    fn unbound_fields_have_no_column() {
        let text = r#"
name = "search"
[[blocks]]
name = "control"
[[blocks.fields]]
name = "hint"
unbound = true
kind = "display"
"#;
        let def = FormDefinition::from_toml_str(text).unwrap();
        let block = def.blocks[0].build().unwrap();
        assert!(block.datasource().is_none());
        assert!(block.field_def("hint").unwrap().column.is_none());
        assert_eq!(def.connection, "main");
    }
}
