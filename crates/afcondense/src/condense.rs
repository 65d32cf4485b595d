//! Level merge: one wide row per leaf path
//!
//! Every level of a hierarchy table becomes an Arrow batch keyed by the path
//! segments of its nodes. Level `L` carries key columns `0..=L` and is full
//! outer joined onto the running result on keys `0..L`, the ancestor chain it
//! shares with level `L-1`. The joins run as one DataFusion query over the
//! registered level batches.
//!
//! Non-key columns get a `" [<label>]"` suffix so that columns from different
//! levels can coexist; a name already taken by a shallower level is qualified
//! again with the level number. Key columns are dropped at the end, identical
//! rows collapse, and missing end times are filled level by level from the
//! shallower level.
//!
//! A level without rows contributes key columns of missing values. Missing
//! keys never match, so nodes below such a gap keep their own rows instead of
//! joining a made-up ancestor.

use crate::error::{Error, Result};
use crate::hierarchy::{END, HierarchyTable, LEVEL, NAME, NODE, PATH, START, TEMPLATE};
use crate::node::Node;
use crate::table::{Column, Table, Tabular};
use crate::value::Value;
use arrow::compute::{concat_batches, take_record_batch};
use arrow::row::{RowConverter, SortField};
use arrow_array::{ArrayRef, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field, Schema};
use chrono::DateTime;
use chrono_tz::Tz;
use datafusion::prelude::SessionContext;
use diagnostics::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Columns kept per level even when every value is missing.
const CORE_COLUMNS: [&str; 5] = [NODE, NAME, LEVEL, START, END];

const KEY_PREFIX: &str = "__key_";
const ROW: &str = "__row";

/// How level columns are told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelLabel {
    /// `" [<level>]"`
    #[default]
    Level,
    /// `" [<template>]"` when every row of the level shares one template.
    Template,
}

/// Append `" [<label>]"` unless the name already carries a bracket.
#[must_use]
pub fn level_suffixed(name: &str, label: &str) -> String {
    if name.contains('[') {
        name.to_string()
    } else {
        format!("{name} [{label}]")
    }
}

fn key_name(k: usize) -> String {
    format!("{KEY_PREFIX}{k}")
}

fn quoted(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One registered level batch and the data columns it contributes.
struct LevelFrame {
    level: usize,
    columns: Vec<String>,
}

impl LevelFrame {
    fn table_name(&self) -> String {
        format!("level_{}", self.level)
    }

    fn alias(&self) -> String {
        format!("l{}", self.level)
    }

    fn ordinal(&self) -> String {
        format!("{ROW}_{}", self.level)
    }

    fn key(&self, k: usize) -> String {
        format!("{}.{}", self.alias(), quoted(&key_name(k)))
    }
}

/// FULL OUTER JOIN chain over the level batches.
///
/// Key `k` of the running result is the first present key among the joined
/// levels that have one, so rows carried in from either side keep matching
/// deeper levels. Rows come out in level order, unmatched rows last.
fn join_sql(first: &LevelFrame, rest: &[LevelFrame]) -> String {
    let frames: Vec<&LevelFrame> = std::iter::once(first).chain(rest).collect();
    let mut select = Vec::new();
    for frame in &frames {
        let alias = frame.alias();
        for column in &frame.columns {
            select.push(format!("{alias}.{}", quoted(column)));
        }
        select.push(format!("{alias}.{} AS {}", quoted(ROW), quoted(&frame.ordinal())));
    }

    let mut from = format!("FROM {} AS {}", first.table_name(), first.alias());
    for (i, frame) in rest.iter().enumerate() {
        let joined = &frames[..=i];
        let conditions: Vec<String> = (0..frame.level)
            .map(|k| {
                let left: Vec<String> = joined
                    .iter()
                    .filter(|j| j.level >= k)
                    .map(|j| j.key(k))
                    .collect();
                let left = if left.len() == 1 {
                    left.join("")
                } else {
                    format!("COALESCE({})", left.join(", "))
                };
                format!("{left} = {}", frame.key(k))
            })
            .collect();
        from.push_str(&format!(
            "\nFULL OUTER JOIN {} AS {} ON {}",
            frame.table_name(),
            frame.alias(),
            conditions.join(" AND ")
        ));
    }

    let order: Vec<String> = frames
        .iter()
        .map(|f| format!("{} ASC NULLS LAST", quoted(&f.ordinal())))
        .collect();
    format!(
        "SELECT\n  {}\n{}\nORDER BY {}",
        select.join(",\n  "),
        from,
        order.join(", ")
    )
}

/// `batch` plus key columns `0..=level` taken from each row's path segments
/// and a row ordinal.
fn keyed_batch(batch: &RecordBatch, ancestries: &[&[String]], level: usize) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();
    for k in 0..=level {
        let keys: StringArray = ancestries
            .iter()
            .map(|a| a.get(k).map(String::as_str))
            .collect();
        fields.push(Field::new(key_name(k), DataType::Utf8, true));
        columns.push(Arc::new(keys));
    }
    let ordinals = UInt64Array::from_iter_values((0..batch.num_rows()).map(|i| i as u64));
    fields.push(Field::new(ROW, DataType::UInt64, false));
    columns.push(Arc::new(ordinals));
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Keep the first of every group of identical rows.
fn distinct_rows(batch: &RecordBatch) -> Result<RecordBatch> {
    let fields = batch
        .schema()
        .fields()
        .iter()
        .map(|f| SortField::new(f.data_type().clone()))
        .collect();
    let converter = RowConverter::new(fields)?;
    let rows = converter.convert_columns(batch.columns())?;
    let mut seen = HashSet::new();
    let keep = UInt32Array::from_iter_values(
        rows.iter()
            .enumerate()
            .filter(|(_, row)| seen.insert(*row))
            .map(|(i, _)| i as u32),
    );
    if keep.len() == batch.num_rows() {
        return Ok(batch.clone());
    }
    Ok(take_record_batch(batch, &keep)?)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Condenser {
    pub label: LevelLabel,
}

impl Condenser {
    #[must_use]
    pub fn new(label: LevelLabel) -> Self {
        Self { label }
    }

    pub async fn condense_at(
        &self,
        hierarchy: &HierarchyTable,
        now: DateTime<Tz>,
    ) -> Result<CondensedTable> {
        let tz = hierarchy.tz();
        let Some((lmin, lmax)) = hierarchy.levels() else {
            return Ok(CondensedTable {
                table: Table::default(),
                tz,
            });
        };
        let input_rows = hierarchy.num_rows();
        let levels = lmax - lmin + 1;
        info!(
            "Condensing {levels} levels from {input_rows} rows",
            levels: levels,
            input_rows: input_rows
        );

        let nodes = hierarchy.nodes();
        let ctx = SessionContext::new();
        let mut taken: HashSet<String> = HashSet::new();
        let mut frames: Vec<LevelFrame> = Vec::with_capacity(levels);
        for level in lmin..=lmax {
            let rows = hierarchy.rows_at_level(level);
            let sub = if rows.is_empty() {
                debug!("Level {level} has no rows", level: level);
                Table::with_rows(0)
            } else {
                self.level_table(hierarchy, &rows, level, &mut taken)?
            };
            let ancestries: Vec<&[String]> = rows.iter().map(|&r| nodes[r].path().ancestry()).collect();
            let frame = LevelFrame {
                level,
                columns: sub.column_names().iter().map(|s| s.to_string()).collect(),
            };
            let batch = keyed_batch(&sub.to_record_batch()?, &ancestries, level)?;
            let _ = ctx.register_batch(&frame.table_name(), batch)?;
            frames.push(frame);
        }

        let Some((first, rest)) = frames.split_first() else {
            return Err(Error::invalid_shape("hierarchy has no levels"));
        };
        let sql = join_sql(first, rest);
        debug!("Condensing with SQL:\n{sql}", sql: sql.as_str());
        let df = ctx.sql(&sql).await?;
        let planned = df.schema().inner().clone();
        let batches = df.collect().await?;
        let schema = batches.first().map_or(planned, RecordBatch::schema);
        let joined = concat_batches(&schema, &batches)?;

        let data: Vec<usize> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.name().starts_with(ROW))
            .map(|(i, _)| i)
            .collect();
        let joined = joined.project(&data)?;
        let distinct = distinct_rows(&joined)?;
        let removed = joined.num_rows() - distinct.num_rows();
        if removed > 0 {
            debug!("Removed {removed} duplicate rows", removed: removed);
        }

        let mut table = Table::from_record_batch(&distinct, tz)?;
        restore_nodes(&mut table, &nodes);
        fill_end_times(&mut table, now);

        let rows = table.num_rows();
        info!("Condensed table has {rows} rows", rows: rows);
        CondensedTable::try_new(table, tz)
    }

    /// Rows of one level with sparse columns dropped and every column name
    /// unique among the levels seen so far.
    fn level_table(
        &self,
        hierarchy: &HierarchyTable,
        rows: &[usize],
        level: usize,
        taken: &mut HashSet<String>,
    ) -> Result<Table> {
        let mut sub = hierarchy.table().take_rows(rows);
        let dropped = sub.drop_all_null_columns(|name| CORE_COLUMNS.contains(&name));
        debug!(
            "Level {level} has {count} rows, dropped {sparse} empty columns",
            level: level,
            count: rows.len(),
            sparse: dropped.len()
        );
        sub.drop_column(PATH);

        let label = self.label_for(&sub, level, taken);
        let columns = sub
            .into_columns()
            .into_iter()
            .map(|column| {
                let mut name = level_suffixed(&column.name, &label);
                // attribute columns keep their own bracket and can repeat per level
                while taken.contains(&name) {
                    name = format!("{name} [{level}]");
                }
                taken.insert(name.clone());
                Column::new(name, column.values)
            })
            .collect();
        Table::from_columns(columns)
    }

    fn label_for(&self, sub: &Table, level: usize, taken: &HashSet<String>) -> String {
        let by_level = level.to_string();
        if self.label == LevelLabel::Level {
            return by_level;
        }
        let Some(templates) = sub.column(TEMPLATE) else {
            return by_level;
        };
        let first = templates.values.first().and_then(Value::as_str);
        let shared = first.filter(|t| {
            templates
                .values
                .iter()
                .all(|v| v.as_str() == Some(*t))
        });
        let Some(template) = shared else {
            return by_level;
        };
        // a template used on an earlier level would collide with its columns
        let collides = sub
            .column_names()
            .iter()
            .any(|n| taken.contains(&level_suffixed(n, template)));
        if collides {
            by_level
        } else {
            template.to_string()
        }
    }

    pub async fn condense(&self, hierarchy: &HierarchyTable) -> Result<CondensedTable> {
        self.condense_at(hierarchy, crate::time::now_in(hierarchy.tz()))
            .await
    }
}

/// Node columns travel through the join as paths; map them back to handles.
fn restore_nodes(table: &mut Table, nodes: &[Arc<Node>]) {
    let by_path: HashMap<&str, &Arc<Node>> =
        nodes.iter().map(|n| (n.path().as_str(), n)).collect();
    let prefix = format!("{NODE} [");
    let names: Vec<String> = table
        .column_names()
        .into_iter()
        .filter(|n| n.starts_with(&prefix))
        .map(str::to_string)
        .collect();
    for name in names {
        let Some(column) = table.column_mut(&name) else {
            continue;
        };
        for value in column.values.iter_mut() {
            let node = value
                .as_str()
                .and_then(|path| by_path.get(path))
                .map(|n| Value::Node(Arc::clone(n)));
            if let Some(node) = node {
                *value = node;
            }
        }
    }
}

/// First end-time column falls back to `now`, each deeper one to the
/// column before it.
fn fill_end_times(table: &mut Table, now: DateTime<Tz>) {
    let prefix = format!("{END} [");
    let names: Vec<String> = table
        .column_names()
        .into_iter()
        .filter(|n| n.starts_with(&prefix))
        .map(str::to_string)
        .collect();

    let mut previous: Option<Vec<Value>> = None;
    for name in names {
        let Some(column) = table.column_mut(&name) else {
            continue;
        };
        for (row, value) in column.values.iter_mut().enumerate() {
            if value.is_null() {
                *value = match &previous {
                    None => Value::Time(now),
                    Some(prev) => prev[row].clone(),
                };
            }
        }
        previous = Some(column.values.clone());
    }
}

/// Result of condensation: one row per leaf path.
#[derive(Debug, Clone, PartialEq)]
pub struct CondensedTable {
    table: Table,
    tz: Tz,
}

impl CondensedTable {
    /// Wrap a table, requiring at least one `Node [..]` column unless empty.
    pub fn try_new(table: Table, tz: Tz) -> Result<Self> {
        let condensed = Self { table, tz };
        if condensed.table.num_columns() > 0 && condensed.bottom_node_column().is_none() {
            return Err(Error::invalid_shape(
                "condensed table needs at least one 'Node [..]' column",
            ));
        }
        Ok(condensed)
    }

    #[must_use]
    pub fn tz(&self) -> Tz {
        self.tz
    }

    #[must_use]
    pub fn node_columns(&self) -> Vec<&str> {
        let prefix = format!("{NODE} [");
        self.table
            .column_names()
            .into_iter()
            .filter(|n| n.starts_with(&prefix))
            .collect()
    }

    /// The deepest node column: the one extraction runs against.
    #[must_use]
    pub fn bottom_node_column(&self) -> Option<&str> {
        self.node_columns().last().copied()
    }

    /// Names of the columns forming the `prefix` family, e.g. all `Name [..]`.
    #[must_use]
    pub fn family(&self, prefix: &str) -> Vec<&str> {
        let prefix = format!("{prefix} [");
        self.table
            .column_names()
            .into_iter()
            .filter(|n| n.starts_with(&prefix))
            .collect()
    }

    #[must_use]
    pub fn take_rows(&self, rows: &[usize]) -> Self {
        Self {
            table: self.table.take_rows(rows),
            tz: self.tz,
        }
    }

    /// Rows `offset..offset + len`, clamped to the table.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Self {
        Self {
            table: self.table.slice(offset, len),
            tz: self.tz,
        }
    }
}

impl Tabular for CondensedTable {
    fn table(&self) -> &Table {
        &self.table
    }
}
