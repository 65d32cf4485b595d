//! Time-series extraction against hierarchy and condensed tables
//!
//! Per-row operations query each row's own time bounds. Grouped operations
//! (continuous interpolation, recorded and plot values) merge all rows sharing
//! a top-level ancestor into one range, from the first member's start to the
//! last member's end, and attach each returned point to the member whose
//! bounds contain it.
//!
//! Timestamps come back from the data source as naive UTC and are converted
//! to the table's display timezone; the source's open-ended sentinel becomes a
//! missing value.

use crate::condense::CondensedTable;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::hierarchy::HierarchyTable;
use crate::node::Node;
use crate::source::{
    BoundaryType, CalculationBasis, DataSource, ExpressionSampleType, SummaryRequest,
    SummaryType, SummaryValue, TagSeries, TimestampCalculation,
};
use crate::tags::{ResolveMode, TagCache, TagResolver, TagSet, TagSpec};
use crate::table::{Column, Table, Tabular};
use crate::time::{TimeRange, format_span, to_display};
use crate::value::Value;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use diagnostics::*;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TIME: &str = "Time";
pub const TAG: &str = "Tag";
pub const VALUE: &str = "Value";
pub const SUMMARY: &str = "Summary";
pub const DATA: &str = "Data";
pub const PROCEDURE: &str = "Procedure";
pub const NODE: &str = "Node";

/// Recorded or plot values: procedure, then tag, then `Node, Time, Data` rows.
pub type GroupedSeries = BTreeMap<String, BTreeMap<String, Table>>;

/// Rows an extraction runs over.
#[derive(Debug, Clone)]
pub struct ExtractionFrame {
    /// Columns copied into every output row produced for a frame row.
    pub carried: Table,
    pub nodes: Vec<Arc<Node>>,
    /// Index of each frame row in the target table.
    pub rows: Vec<usize>,
}

/// A table extraction can run against.
pub trait ExtractTarget: Tabular + Send + Sync {
    fn display_tz(&self) -> Tz;

    fn extraction_frame(&self) -> Result<ExtractionFrame>;
}

impl ExtractTarget for HierarchyTable {
    fn display_tz(&self) -> Tz {
        self.tz()
    }

    /// Every row, every column carried.
    fn extraction_frame(&self) -> Result<ExtractionFrame> {
        let nodes = self.nodes();
        Ok(ExtractionFrame {
            carried: self.table().clone(),
            rows: (0..nodes.len()).collect(),
            nodes,
        })
    }
}

impl ExtractTarget for CondensedTable {
    fn display_tz(&self) -> Tz {
        self.tz()
    }

    /// Rows with a node in the deepest node column, carrying
    /// `Procedure` and `Node`.
    fn extraction_frame(&self) -> Result<ExtractionFrame> {
        let mut nodes = Vec::new();
        let mut rows = Vec::new();
        if let Some(column) = self.bottom_node_column() {
            let cells = &self.table().require(column)?.values;
            for (i, cell) in cells.iter().enumerate() {
                if let Some(node) = cell.as_node() {
                    nodes.push(node.clone());
                    rows.push(i);
                }
            }
            let dropped = cells.len() - rows.len();
            if dropped > 0 {
                warn!("Dropped {dropped} rows without a node in {column}", dropped: dropped, column: column);
            }
        }
        let carried = Table::from_columns(vec![
            Column::new(PROCEDURE, nodes.iter().map(|n| Value::from(n.procedure())).collect()),
            Column::new(NODE, nodes.iter().map(|n| Value::Node(n.clone())).collect()),
        ])?;
        Ok(ExtractionFrame {
            carried,
            nodes,
            rows,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpolatedArgs {
    pub interval: String,
    pub filter_expression: Option<String>,
}

impl Default for InterpolatedArgs {
    fn default() -> Self {
        Self {
            interval: "1h".to_string(),
            filter_expression: None,
        }
    }
}

/// Summary over each row's range. With an `interval` the range is split into
/// windows; with a `filter_expression` only samples passing it count.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryArgs {
    pub summary_types: SummaryType,
    pub calculation_basis: CalculationBasis,
    pub time_type: TimestampCalculation,
    pub interval: Option<String>,
    pub filter_expression: Option<String>,
    pub filter_interval: Option<String>,
}

impl Default for SummaryArgs {
    fn default() -> Self {
        Self {
            summary_types: SummaryType::AVERAGE,
            calculation_basis: CalculationBasis::default(),
            time_type: TimestampCalculation::default(),
            interval: None,
            filter_expression: None,
            filter_interval: None,
        }
    }
}

impl SummaryArgs {
    fn request(&self) -> SummaryRequest {
        SummaryRequest {
            types: self.summary_types,
            basis: self.calculation_basis,
            time_type: self.time_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionSpec {
    Literal(String),
    /// Expression text read per row from this column.
    Column(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalcSummaryArgs {
    /// Window length, or `"event"` for the whole row range.
    pub interval: String,
    pub summary_types: SummaryType,
    pub expression: ExpressionSpec,
    pub calculation_basis: CalculationBasis,
    pub time_type: TimestampCalculation,
    pub sample_type: ExpressionSampleType,
    pub filter_interval: Option<String>,
}

impl CalcSummaryArgs {
    pub fn new(expression: ExpressionSpec) -> Self {
        Self {
            interval: "event".to_string(),
            summary_types: SummaryType::AVERAGE,
            expression,
            calculation_basis: CalculationBasis::default(),
            time_type: TimestampCalculation::default(),
            sample_type: ExpressionSampleType::default(),
            filter_interval: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedArgs {
    pub filter_expression: Option<String>,
    pub boundary: BoundaryType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotArgs {
    pub intervals: usize,
}

impl Default for PlotArgs {
    fn default() -> Self {
        Self { intervals: 128 }
    }
}

/// Output rows accumulated column-wise, each tied to a frame row.
/// Grouped outputs carry nothing and tie every row to a one-row empty table.
struct OutputRows {
    names: Vec<String>,
    frame_rows: Vec<usize>,
    columns: Vec<Vec<Value>>,
}

impl OutputRows {
    fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
            frame_rows: Vec::new(),
            columns: vec![Vec::new(); names.len()],
        }
    }

    fn push(&mut self, frame_row: usize, row: Vec<Value>) {
        self.frame_rows.push(frame_row);
        for (column, value) in self.columns.iter_mut().zip(row) {
            column.push(value);
        }
    }

    fn finish(self, carried: &Table) -> Result<Table> {
        let mut table = carried.take_rows(&self.frame_rows);
        for (name, values) in self.names.into_iter().zip(self.columns) {
            table.push_column(Column::new(name, values))?;
        }
        Ok(table)
    }
}

fn display(raw: NaiveDateTime, tz: Tz) -> Value {
    Value::from(to_display(raw, tz))
}

fn context(what: &str, node: &Node, range: &TimeRange) -> String {
    format!("{what} for {} over {range}", node.path())
}

/// Interval string covering the whole range.
fn span_interval(range: &TimeRange) -> String {
    format!("{}s", range.span().num_seconds().max(1))
}

fn resolve_interval(interval: &str, range: &TimeRange) -> String {
    if interval.eq_ignore_ascii_case("event") {
        span_interval(range)
    } else {
        interval.to_string()
    }
}

/// Align series on timestamps: one row per distinct time, one value per name.
fn wide_rows(series: &[TagSeries], names: &[&str]) -> BTreeMap<NaiveDateTime, Vec<Value>> {
    let mut rows: BTreeMap<NaiveDateTime, Vec<Value>> = BTreeMap::new();
    for s in series {
        let Some(col) = names.iter().position(|n| *n == s.tag) else {
            continue;
        };
        for p in &s.points {
            rows.entry(p.timestamp)
                .or_insert_with(|| vec![Value::Null; names.len()])[col] = p.value.clone();
        }
    }
    rows
}

fn summary_row(value: SummaryValue, tz: Tz) -> (String, Vec<Value>) {
    let label = value.summary.label();
    (
        value.tag,
        vec![
            Value::from(label),
            value.value,
            display(value.timestamp, tz),
        ],
    )
}

/// Stable sort on the `Time` column, missing times last.
fn sort_by_time(table: &Table) -> Table {
    let Some(times) = table.column(TIME) else {
        return table.clone();
    };
    let mut order: Vec<usize> = (0..table.num_rows()).collect();
    order.sort_by_key(|&i| {
        let t = times.values[i].as_time().map(|t| t.with_timezone(&Utc));
        (t.is_none(), t)
    });
    table.take_rows(&order)
}

/// Rows of one top-level ancestor, ordered by start time.
struct Procedure {
    name: String,
    members: Vec<usize>,
    range: TimeRange,
}

fn procedures(frame: &ExtractionFrame, now: DateTime<Utc>) -> Result<Vec<Procedure>> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, node) in frame.nodes.iter().enumerate() {
        groups.entry(node.procedure().to_string()).or_default().push(i);
    }
    let mut out = Vec::with_capacity(groups.len());
    for (name, mut members) in groups {
        members.sort_by_key(|&i| frame.nodes[i].start());
        let (Some(&first), Some(&last)) = (members.first(), members.last()) else {
            continue;
        };
        let start = frame.nodes[first].range(now)?.start;
        let end = frame.nodes[last].range(now)?.end;
        out.push(Procedure {
            name,
            members,
            range: TimeRange::new(start, end),
        });
    }
    Ok(out)
}

/// The member whose bounds contain `t`; later members win.
fn member_at(frame: &ExtractionFrame, members: &[usize], raw: NaiveDateTime, now: DateTime<Utc>) -> Value {
    let t = raw.and_utc();
    members
        .iter()
        .rev()
        .map(|&i| &frame.nodes[i])
        .find(|n| n.contains(t, now))
        .map_or(Value::Null, |n| Value::Node(n.clone()))
}

#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn DataSource>,
    config: Arc<EngineConfig>,
    cache: Option<Arc<TagCache>>,
}

impl Extractor {
    pub fn new(source: Arc<dyn DataSource>, config: Arc<EngineConfig>) -> Self {
        Self {
            source,
            config,
            cache: None,
        }
    }

    /// Share tag resolutions across calls through `cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<TagCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn source(&self) -> &dyn DataSource {
        self.source.as_ref()
    }

    fn warn_load(&self, operation: &str, frame: &ExtractionFrame, now: DateTime<Utc>) {
        let rows = frame.nodes.len();
        info!("Extracting {operation} for {rows} rows", operation: operation, rows: rows);
        if rows > self.config.row_count_warning {
            warn!(
                "{operation} extraction over {rows} rows makes one data source call per row",
                operation: operation,
                rows: rows
            );
        }
        let limit = TimeDelta::days(self.config.long_duration_warning_days);
        if let Some(longest) = frame.nodes.iter().map(|n| n.duration(now)).max() {
            if longest > limit {
                let span = format_span(longest);
                warn!(
                    "{operation} extraction includes a row spanning {span}, long ranges are slow and may hit the collection limit",
                    operation: operation,
                    span: span
                );
            }
        }
    }

    async fn row_tags<T: ExtractTarget>(
        &self,
        target: &T,
        frame: &ExtractionFrame,
        spec: &TagSpec,
        mode: ResolveMode,
    ) -> Result<Vec<TagSet>> {
        let resolver = TagResolver::new(self.source.as_ref()).with_cache(self.cache.as_deref());
        match spec {
            TagSpec::Column(column) => {
                let rows = target.table().take_rows(&frame.rows);
                resolver.resolve_rows(&rows, column, mode).await
            }
            _ => {
                let tags = resolver.resolve(spec).await?;
                Ok(vec![tags; frame.nodes.len()])
            }
        }
    }

    /// Interpolated values over each row's range.
    ///
    /// A shared tag list yields wide output (`Time` plus one column per tag);
    /// a tag column yields long output (`Tag, Time, Value`).
    pub async fn interpolated_extract<T: ExtractTarget>(
        &self,
        target: &T,
        tags: &TagSpec,
        args: &InterpolatedArgs,
    ) -> Result<Table> {
        let frame = target.extraction_frame()?;
        let now = self.source.now();
        let tz = target.display_tz();
        self.warn_load("interpolated", &frame, now);
        let row_tags = self.row_tags(target, &frame, tags, ResolveMode::TimeSeries).await?;
        let long = matches!(tags, TagSpec::Column(_));

        let mut all = TagSet::new();
        for set in &row_tags {
            all.extend_from(set);
        }
        let names = all.names();
        let mut out = if long {
            OutputRows::new(&[TAG, TIME, VALUE])
        } else {
            let mut header = vec![TIME];
            header.extend(names.iter().copied());
            OutputRows::new(&header)
        };

        for (i, node) in frame.nodes.iter().enumerate() {
            let range = node.range(now)?;
            let series = self
                .source
                .interpolated_values(
                    &row_tags[i],
                    &range,
                    &args.interval,
                    args.filter_expression.as_deref(),
                    &self.config.paging,
                )
                .await
                .map_err(|e| Error::data_source(context("interpolated values", node, &range), e))?;

            if long {
                let before = out.frame_rows.len();
                for s in series {
                    for p in s.points {
                        out.push(
                            i,
                            vec![Value::from(s.tag.as_str()), display(p.timestamp, tz), p.value],
                        );
                    }
                }
                if out.frame_rows.len() == before {
                    out.push(i, vec![Value::Null; 3]);
                }
            } else {
                let rows = wide_rows(&series, &names);
                if rows.is_empty() {
                    out.push(i, vec![Value::Null; names.len() + 1]);
                }
                for (ts, values) in rows {
                    let mut row = Vec::with_capacity(values.len() + 1);
                    row.push(display(ts, tz));
                    row.extend(values);
                    out.push(i, row);
                }
            }
        }
        out.finish(&frame.carried)
    }

    /// One output row per (row, tag, summary type): `Tag, Summary, Value, Time`.
    ///
    /// A tag column must hold exactly one tag per cell.
    pub async fn summary_extract<T: ExtractTarget>(
        &self,
        target: &T,
        tags: &TagSpec,
        args: &SummaryArgs,
    ) -> Result<Table> {
        let frame = target.extraction_frame()?;
        let now = self.source.now();
        let tz = target.display_tz();
        self.warn_load("summary", &frame, now);
        let row_tags = self.row_tags(target, &frame, tags, ResolveMode::Summary).await?;
        let request = args.request();
        let paging = &self.config.paging;
        let mut out = OutputRows::new(&[TAG, SUMMARY, VALUE, TIME]);

        for (i, node) in frame.nodes.iter().enumerate() {
            let range = node.range(now)?;
            let set = &row_tags[i];
            let result = match (&args.filter_expression, &args.interval) {
                (Some(filter), interval) => {
                    let interval = interval
                        .as_deref()
                        .map_or_else(|| span_interval(&range), |iv| resolve_interval(iv, &range));
                    self.source
                        .filtered_summaries(
                            set,
                            &range,
                            &interval,
                            filter,
                            args.filter_interval.as_deref(),
                            &request,
                            paging,
                        )
                        .await
                }
                (None, Some(interval)) => {
                    let interval = resolve_interval(interval, &range);
                    self.source
                        .summaries(set, &range, &interval, &request, paging)
                        .await
                }
                (None, None) => self.source.summary(set, &range, &request, paging).await,
            };
            let values =
                result.map_err(|e| Error::data_source(context("summary", node, &range), e))?;

            if values.is_empty() {
                out.push(i, vec![Value::Null; 4]);
            }
            for value in values {
                let (tag, mut row) = summary_row(value, tz);
                row.insert(0, Value::from(tag));
                out.push(i, row);
            }
        }
        out.finish(&frame.carried)
    }

    /// Summaries of a calculated expression per row: `Summary, Value, Time`.
    pub async fn calc_summary_extract<T: ExtractTarget>(
        &self,
        target: &T,
        args: &CalcSummaryArgs,
    ) -> Result<Table> {
        let frame = target.extraction_frame()?;
        let now = self.source.now();
        let tz = target.display_tz();
        self.warn_load("calculation summary", &frame, now);

        let expressions: Vec<String> = match &args.expression {
            ExpressionSpec::Literal(expr) => vec![expr.clone(); frame.nodes.len()],
            ExpressionSpec::Column(column) => {
                let cells = target.table().column(column).ok_or_else(|| {
                    Error::invalid_shape(format!("expression column '{column}' is missing"))
                })?;
                frame
                    .rows
                    .iter()
                    .map(|&r| match &cells.values[r] {
                        v if v.is_null() => Err(Error::invalid_shape(format!(
                            "row {r} of expression column '{column}' is empty"
                        ))),
                        v => Ok(v.to_string()),
                    })
                    .collect::<Result<_>>()?
            }
        };

        let request = SummaryRequest {
            types: args.summary_types,
            basis: args.calculation_basis,
            time_type: args.time_type,
        };
        let mut out = OutputRows::new(&[SUMMARY, VALUE, TIME]);
        for (i, node) in frame.nodes.iter().enumerate() {
            let range = node.range(now)?;
            let interval = resolve_interval(&args.interval, &range);
            let expression = &expressions[i];
            let values = self
                .source
                .calc_summaries(
                    expression,
                    &range,
                    &interval,
                    &request,
                    args.sample_type,
                    args.filter_interval.as_deref(),
                )
                .await
                .map_err(|e| {
                    Error::data_source(context(&format!("expression {expression}"), node, &range), e)
                })?;
            if values.is_empty() {
                out.push(i, vec![Value::Null; 3]);
            }
            for value in values {
                out.push(i, summary_row(value, tz).1);
            }
        }
        out.finish(&frame.carried)
    }

    fn group_tags(row_tags: &[TagSet], members: &[usize]) -> TagSet {
        let mut set = TagSet::new();
        for &m in members {
            set.extend_from(&row_tags[m]);
        }
        set
    }

    /// Interpolated values across each procedure's whole range:
    /// `Procedure, Node, Time, <tags..>`, sorted by time.
    pub async fn continuous_interpolated_extract<T: ExtractTarget>(
        &self,
        target: &T,
        tags: &TagSpec,
        args: &InterpolatedArgs,
    ) -> Result<Table> {
        let frame = target.extraction_frame()?;
        let now = self.source.now();
        let tz = target.display_tz();
        self.warn_load("continuous interpolated", &frame, now);
        let row_tags = self.row_tags(target, &frame, tags, ResolveMode::TimeSeries).await?;

        let mut tables = Vec::new();
        for procedure in procedures(&frame, now)? {
            let set = Self::group_tags(&row_tags, &procedure.members);
            let series = self
                .source
                .interpolated_values(
                    &set,
                    &procedure.range,
                    &args.interval,
                    args.filter_expression.as_deref(),
                    &self.config.paging,
                )
                .await
                .map_err(|e| {
                    Error::data_source(
                        format!("interpolated values for {} over {}", procedure.name, procedure.range),
                        e,
                    )
                })?;
            let names = set.names();
            let mut header = vec![PROCEDURE, NODE, TIME];
            header.extend(names.iter().copied());
            let mut out = OutputRows::new(&header);
            for (ts, values) in wide_rows(&series, &names) {
                let mut row = Vec::with_capacity(values.len() + 3);
                row.push(Value::from(procedure.name.as_str()));
                row.push(member_at(&frame, &procedure.members, ts, now));
                row.push(display(ts, tz));
                row.extend(values);
                out.push(0, row);
            }
            tables.push(out.finish(&Table::with_rows(1))?);
        }
        Ok(sort_by_time(&Table::concat(&tables)))
    }

    async fn grouped<T, F, Fut>(&self, target: &T, tags: &TagSpec, operation: &str, fetch: F) -> Result<GroupedSeries>
    where
        T: ExtractTarget,
        F: Fn(TagSet, TimeRange) -> Fut,
        Fut: std::future::Future<Output = crate::source::SourceResult<Vec<TagSeries>>>,
    {
        let frame = target.extraction_frame()?;
        let now = self.source.now();
        let tz = target.display_tz();
        self.warn_load(operation, &frame, now);
        let row_tags = self.row_tags(target, &frame, tags, ResolveMode::TimeSeries).await?;

        let mut grouped = GroupedSeries::new();
        for procedure in procedures(&frame, now)? {
            let set = Self::group_tags(&row_tags, &procedure.members);
            let series = fetch(set, procedure.range).await.map_err(|e| {
                Error::data_source(
                    format!("{operation} for {} over {}", procedure.name, procedure.range),
                    e,
                )
            })?;
            let per_tag = grouped.entry(procedure.name.clone()).or_default();
            for s in series {
                let mut out = OutputRows::new(&[NODE, TIME, DATA]);
                for p in s.points {
                    out.push(
                        0,
                        vec![
                            member_at(&frame, &procedure.members, p.timestamp, now),
                            display(p.timestamp, tz),
                            p.value,
                        ],
                    );
                }
                per_tag.insert(s.tag, out.finish(&Table::with_rows(1))?);
            }
        }
        Ok(grouped)
    }

    /// Recorded values per procedure and tag.
    pub async fn recorded_extract<T: ExtractTarget>(
        &self,
        target: &T,
        tags: &TagSpec,
        args: &RecordedArgs,
    ) -> Result<GroupedSeries> {
        let source = self.source.clone();
        let paging = self.config.paging;
        self.grouped(target, tags, "recorded values", |set, range| {
            let source = source.clone();
            let filter = args.filter_expression.clone();
            async move {
                source
                    .recorded_values(&set, &range, args.boundary, filter.as_deref(), &paging)
                    .await
            }
        })
        .await
    }

    /// Plot-decimated values per procedure and tag.
    pub async fn plot_extract<T: ExtractTarget>(
        &self,
        target: &T,
        tags: &TagSpec,
        args: &PlotArgs,
    ) -> Result<GroupedSeries> {
        let source = self.source.clone();
        let paging = self.config.paging;
        let intervals = args.intervals;
        self.grouped(target, tags, "plot values", |set, range| {
            let source = source.clone();
            async move { source.plot_values(&set, &range, intervals, &paging).await }
        })
        .await
    }
}
