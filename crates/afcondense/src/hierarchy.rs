//! Flat hierarchy tables: one row per node
//!
//! Built from roots plus a depth-bounded descendant fetch. Columns are
//! `Node, Path, Name, Level, Template` and, when any node is an event,
//! `Starttime, Endtime` in the display timezone. Attribute and
//! referenced-element columns are added per scope on demand.

use crate::condense::{CondensedTable, Condenser};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::source::{DataSource, NodeQuery};
use crate::table::{Column, Table, Tabular};
use crate::time::now_in;
use crate::value::{Value, cast_numeric};
use chrono::DateTime;
use chrono_tz::Tz;
use diagnostics::*;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;

pub const NODE: &str = "Node";
pub const PATH: &str = "Path";
pub const NAME: &str = "Name";
pub const LEVEL: &str = "Level";
pub const TEMPLATE: &str = "Template";
pub const START: &str = "Starttime";
pub const END: &str = "Endtime";

/// Column name used for referenced elements of a scope.
pub const REFERENCED: &str = "Referenced_el";

/// Which rows an augmentation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Template(String),
    /// Rows without a template.
    Untemplated,
    /// The template of the first row at this level.
    Level(usize),
}

impl Scope {
    pub fn template<S: Into<String>>(name: S) -> Self {
        Scope::Template(name.into())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyTable {
    table: Table,
    tz: Tz,
}

impl HierarchyTable {
    /// Project nodes into rows, keeping the first occurrence of each path.
    pub fn from_nodes<I>(nodes: I, tz: Tz) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<Node>>,
    {
        let mut seen = HashSet::new();
        let nodes: Vec<Arc<Node>> = nodes
            .into_iter()
            .filter(|n| seen.insert(n.path().as_str().to_string()))
            .collect();
        let has_time = nodes.iter().any(|n| n.bounds().is_some());

        let mut columns = vec![
            Column::new(NODE, nodes.iter().map(|n| Value::Node(n.clone())).collect()),
            Column::new(PATH, nodes.iter().map(|n| Value::from(n.path().as_str())).collect()),
            Column::new(NAME, nodes.iter().map(|n| Value::from(n.name())).collect()),
            Column::new(LEVEL, nodes.iter().map(|n| Value::Int(n.level() as i64)).collect()),
            Column::new(TEMPLATE, nodes.iter().map(|n| Value::from(n.template())).collect()),
        ];
        if has_time {
            columns.push(Column::new(
                START,
                nodes
                    .iter()
                    .map(|n| Value::from(n.start().map(|t| t.with_timezone(&tz))))
                    .collect(),
            ));
            columns.push(Column::new(
                END,
                nodes
                    .iter()
                    .map(|n| Value::from(n.end().map(|t| t.with_timezone(&tz))))
                    .collect(),
            ));
        }
        Self::try_new(Table::from_columns(columns)?, tz)
    }

    /// Wrap an existing table, checking it has the hierarchy shape.
    pub fn try_new(table: Table, tz: Tz) -> Result<Self> {
        for name in [NODE, PATH, LEVEL] {
            if table.column(name).is_none() {
                return Err(Error::invalid_shape(format!(
                    "hierarchy table needs a '{name}' column"
                )));
            }
        }
        let nodes = table.require(NODE)?;
        if let Some(row) = nodes.values.iter().position(|v| v.as_node().is_none()) {
            return Err(Error::invalid_shape(format!("row {row} has no node")));
        }
        Ok(Self { table, tz })
    }

    /// Roots plus their descendants down to `depth`.
    pub async fn build(
        source: &dyn DataSource,
        roots: &[Arc<Node>],
        depth: usize,
        config: &EngineConfig,
    ) -> Result<Self> {
        let count = roots.len();
        info!("Fetching hierarchy for {count} roots to depth {depth}", count: count, depth: depth);
        let descendants = source
            .load_descendants(roots, depth)
            .await
            .map_err(|e| Error::data_source(format!("descendants of {count} roots"), e))?;
        let nodes = roots
            .iter()
            .cloned()
            .chain(descendants.into_iter().map(Arc::new));
        let table = Self::from_nodes(nodes, config.display_timezone)?;
        let rows = table.num_rows();
        debug!("Hierarchy has {rows} rows after dedup", rows: rows);
        Ok(table)
    }

    /// Search roots by `query` and build their hierarchy.
    pub async fn find(
        source: &dyn DataSource,
        query: &NodeQuery,
        depth: usize,
        config: &EngineConfig,
    ) -> Result<Self> {
        let roots: Vec<Arc<Node>> = source
            .find_nodes(query)
            .await
            .map_err(|e| Error::data_source(format!("node search '{}'", query.name), e))?
            .into_iter()
            .map(Arc::new)
            .collect();
        Self::build(source, &roots, depth, config).await
    }

    #[must_use]
    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Rows `offset..offset + len`, clamped to the table.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        Self {
            table: self.table.slice(offset, len),
            tz: self.tz,
        }
    }

    /// True when the table carries `Starttime`/`Endtime`.
    #[must_use]
    pub fn has_time(&self) -> bool {
        self.table.column(START).is_some()
    }

    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.table
            .column(NODE)
            .map(|c| c.values.iter().filter_map(Value::as_node).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn levels(&self) -> Option<(usize, usize)> {
        let nodes = self.nodes();
        let min = nodes.iter().map(|n| n.level()).min()?;
        let max = nodes.iter().map(|n| n.level()).max()?;
        Some((min, max))
    }

    #[must_use]
    pub fn rows_at_level(&self, level: usize) -> Vec<usize> {
        self.nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.level() == level)
            .map(|(i, _)| i)
            .collect()
    }

    /// Label and row indices selected by `scope`.
    pub fn scope_rows(&self, scope: &Scope) -> Result<(String, Vec<usize>)> {
        let nodes = self.nodes();
        match scope {
            Scope::Template(name) => {
                let rows: Vec<usize> = nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.template() == Some(name.as_str()))
                    .map(|(i, _)| i)
                    .collect();
                if rows.is_empty() {
                    return Err(Error::template_not_found(name.as_str()));
                }
                Ok((name.clone(), rows))
            }
            Scope::Untemplated => {
                let rows: Vec<usize> = nodes
                    .iter()
                    .enumerate()
                    .filter(|(_, n)| n.template().is_none())
                    .map(|(i, _)| i)
                    .collect();
                if rows.is_empty() {
                    return Err(Error::template_not_found("None"));
                }
                Ok(("None".to_string(), rows))
            }
            Scope::Level(level) => {
                let first = nodes
                    .iter()
                    .find(|n| n.level() == *level)
                    .ok_or_else(|| Error::not_found("level", level.to_string()))?;
                match first.template() {
                    Some(t) => self.scope_rows(&Scope::Template(t.to_string())),
                    None => self.scope_rows(&Scope::Untemplated),
                }
            }
        }
    }

    /// Fetch `names` for every row in `scope` into `"<name> [<template>]"`
    /// columns. A failed fetch leaves that cell missing.
    pub async fn add_attributes(
        &mut self,
        source: &dyn DataSource,
        names: &[&str],
        scope: &Scope,
        config: &EngineConfig,
    ) -> Result<()> {
        let (label, rows) = self.scope_rows(scope)?;
        let nodes = self.nodes();
        let count = rows.len();
        info!(
            "Adding {attributes} attributes to {count} rows of {label}",
            attributes: names.len(),
            count: count,
            label: label
        );

        for &name in names {
            let fetched: Vec<(usize, Value)> = stream::iter(rows.iter().copied())
                .map(|row| {
                    let node = nodes[row].clone();
                    async move {
                        let value = match source.attribute_value(&node, name).await {
                            Ok(value) => value,
                            Err(e) => {
                                let reason = e.to_string();
                                debug!(
                                    "Attribute {name} unavailable on {path}: {reason}",
                                    name: name,
                                    path: node.path().as_str(),
                                    reason: reason
                                );
                                Value::Null
                            }
                        };
                        (row, value)
                    }
                })
                .buffered(config.max_concurrency.max(1))
                .collect()
                .await;

            let column_name = format!("{name} [{label}]");
            let mut values = self
                .table
                .column(&column_name)
                .map(|c| c.values.clone())
                .unwrap_or_else(|| vec![Value::Null; self.table.num_rows()]);
            for (row, value) in fetched {
                values[row] = value;
            }
            self.table.set_column(Column::new(column_name, values))?;
        }

        self.cast_numeric_columns();
        Ok(())
    }

    fn cast_numeric_columns(&mut self) {
        let names: Vec<String> = self.table.column_names().iter().map(|s| s.to_string()).collect();
        for name in names {
            if let Some(column) = self.table.column_mut(&name) {
                if cast_numeric(&mut column.values) {
                    debug!("Column {name} is numeric", name: name);
                }
            }
        }
    }

    /// Fan referenced element names of each row in `scope` out into
    /// `"Referenced_el [<template>](<i>)"` columns. Returns the column count.
    pub async fn add_referenced_elements(
        &mut self,
        source: &dyn DataSource,
        scope: &Scope,
        config: &EngineConfig,
    ) -> Result<usize> {
        let (label, rows) = self.scope_rows(scope)?;
        let nodes = self.nodes();

        let fetched: Vec<(usize, Vec<String>)> = stream::iter(rows.iter().copied())
            .map(|row| {
                let node = nodes[row].clone();
                async move {
                    source
                        .referenced_elements(&node)
                        .await
                        .map(|names| (row, names))
                        .map_err(|e| {
                            Error::data_source(format!("referenced elements of {}", node.path()), e)
                        })
                }
            })
            .buffered(config.max_concurrency.max(1))
            .try_collect()
            .await?;

        let width = fetched.iter().map(|(_, names)| names.len()).max().unwrap_or(0);
        if width == 0 {
            return Err(Error::Empty(format!(
                "no referenced elements for template {label}"
            )));
        }
        let total = self.table.num_rows();
        for i in 0..width {
            let mut values = vec![Value::Null; total];
            for (row, names) in &fetched {
                if let Some(name) = names.get(i) {
                    values[*row] = Value::from(name.as_str());
                }
            }
            self.table
                .set_column(Column::new(format!("{REFERENCED} [{label}]({i})"), values))?;
        }
        info!("Added {width} referenced element columns for {label}", width: width, label: label);
        Ok(width)
    }

    /// Merge all levels into one row per leaf path, stamping open end times
    /// with the current time.
    pub async fn condense(&self) -> Result<CondensedTable> {
        self.condense_at(now_in(self.tz)).await
    }

    pub async fn condense_at(&self, now: DateTime<Tz>) -> Result<CondensedTable> {
        Condenser::default().condense_at(self, now).await
    }
}

impl Tabular for HierarchyTable {
    fn table(&self) -> &Table {
        &self.table
    }
}
