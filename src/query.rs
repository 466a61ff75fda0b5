//! Master/detail graph and query chain bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{FormError, Result};

/// Identity of one top-level query invocation and the detail queries it
/// cascades into. Ids only grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(pub u64);

/// Tracks the newest chain per block so late results can be recognized.
#[derive(Debug, Default)]
pub struct QueryManager {
    last: u64,
    latest: HashMap<String, ChainId>,
}

impl QueryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a chain id and make it the current one for every block given.
    pub fn start<'a>(&mut self, blocks: impl IntoIterator<Item = &'a str>) -> ChainId {
        self.last += 1;
        let id = ChainId(self.last);
        for b in blocks {
            self.latest.insert(b.to_string(), id);
        }
        id
    }

    pub fn is_current(&self, block: &str, chain: ChainId) -> bool {
        self.latest.get(block) == Some(&chain)
    }

    pub fn latest(&self, block: &str) -> Option<ChainId> {
        self.latest.get(block).copied()
    }
}

/// Detail block joined to its master on `(master column, detail column)` pairs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub master: String,
    pub detail: String,
    pub join: Vec<(String, String)>,
}

impl Link {
    pub fn joins_on(&self, master_column: &str) -> bool {
        self.join.iter().any(|(m, _)| m == master_column)
    }
}

/// The master/detail tree of one form.
#[derive(Debug, Default)]
pub struct BlockCoordinator {
    links: Vec<Link>,
}

impl BlockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A detail has one master and the graph stays a tree.
    pub fn link(&mut self, link: Link) -> Result<()> {
        if link.master == link.detail {
            return Err(FormError::Definition(format!(
                "block '{}' cannot be its own master",
                link.master
            )));
        }
        if let Some(existing) = self.master_of(&link.detail) {
            return Err(FormError::Definition(format!(
                "block '{}' already has master '{}'",
                link.detail, existing.master
            )));
        }
        if self.ancestors(&link.master).contains(&link.detail) {
            return Err(FormError::Definition(format!(
                "linking '{}' under '{}' would create a cycle",
                link.detail, link.master
            )));
        }
        if link.join.is_empty() {
            return Err(FormError::Definition(format!(
                "link '{}' -> '{}' has no join columns",
                link.master, link.detail
            )));
        }
        self.links.push(link);
        Ok(())
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn master_of(&self, detail: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.detail == detail)
    }

    pub fn details_of(&self, master: &str) -> Vec<&Link> {
        self.links.iter().filter(|l| l.master == master).collect()
    }

    /// Details whose join uses `master_column` of `master`.
    pub fn details_joined_on(&self, master: &str, master_column: &str) -> Vec<&Link> {
        self.links
            .iter()
            .filter(|l| l.master == master && l.joins_on(master_column))
            .collect()
    }

    /// Masters of `block`, nearest first.
    pub fn ancestors(&self, block: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut cur = block;
        while let Some(l) = self.master_of(cur) {
            if out.contains(&l.master) {
                break;
            }
            out.push(l.master.clone());
            cur = &l.master;
        }
        out
    }

    /// All details below `block`, depth-first.
    pub fn descendants(&self, block: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = self
            .details_of(block)
            .into_iter()
            .rev()
            .map(|l| l.detail.as_str())
            .collect();
        while let Some(b) = stack.pop() {
            if out.iter().any(|o| o == b) {
                continue;
            }
            out.push(b.to_string());
            stack.extend(self.details_of(b).into_iter().rev().map(|l| l.detail.as_str()));
        }
        out
    }

    /// Where a query on `block` should really start: walk up while the
    /// master still holds unexecuted query filters.
    pub fn query_master(&self, block: &str, has_filters: impl Fn(&str) -> bool) -> String {
        let mut top = block.to_string();
        while let Some(l) = self.master_of(&top) {
            if !has_filters(&l.master) {
                break;
            }
            top = l.master.clone();
        }
        top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(m: &str, d: &str) -> Link {
        Link {
            master: m.into(),
            detail: d.into(),
            join: vec![("id".into(), format!("{m}_id"))],
        }
    }

    fn tree() -> BlockCoordinator {
        let mut c = BlockCoordinator::new();
        c.link(link("customers", "orders")).unwrap();
        c.link(link("orders", "lines")).unwrap();
        c.link(link("orders", "notes")).unwrap();
        c.link(link("lines", "shipments")).unwrap();
        c
    }

    #[test]
    fn chain_ids_are_monotonic_and_per_block() {
        let mut q = QueryManager::new();
        let a = q.start(["orders", "lines"]);
        assert!(q.is_current("lines", a));
        let b = q.start(["lines"]);
        assert!(b > a);
        assert!(!q.is_current("lines", a));
        assert!(q.is_current("orders", a));
        assert_eq!(q.latest("lines"), Some(b));
        assert!(!q.is_current("unknown", a));
    }

    #[test]
    fn rejects_second_master_and_cycles() {
        let mut c = tree();
        assert!(c.link(link("customers", "lines")).is_err());
        assert!(c.link(link("shipments", "customers")).is_err());
        assert!(c.link(link("x", "x")).is_err());
    }

    #[test]
    fn descendants_depth_first() {
        let c = tree();
        assert_eq!(c.descendants("orders"), vec!["lines", "shipments", "notes"]);
        assert_eq!(c.ancestors("shipments"), vec!["lines", "orders", "customers"]);
    }

    #[test]
    fn query_master_redirects_through_filtered_masters() {
        let c = tree();
        assert_eq!(c.query_master("lines", |_| false), "lines");
        assert_eq!(c.query_master("lines", |b| b == "orders"), "orders");
        assert_eq!(
            c.query_master("lines", |b| b == "orders" || b == "customers"),
            "customers"
        );
        // a gap stops the walk
        assert_eq!(c.query_master("lines", |b| b == "customers"), "lines");
    }

    #[test]
    fn joined_on_column() {
        let mut c = BlockCoordinator::new();
        c.link(Link {
            master: "orders".into(),
            detail: "lines".into(),
            join: vec![("order_id".into(), "order_id".into())],
        })
        .unwrap();
        c.link(Link {
            master: "orders".into(),
            detail: "audit".into(),
            join: vec![("customer".into(), "customer".into())],
        })
        .unwrap();
        let hits: Vec<_> = c
            .details_joined_on("orders", "order_id")
            .into_iter()
            .map(|l| l.detail.clone())
            .collect();
        assert_eq!(hits, vec!["lines"]);
    }
}
