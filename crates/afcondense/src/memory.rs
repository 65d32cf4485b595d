//! In-memory data source
//!
//! Holds a fixed hierarchy, attributes, referenced elements and recorded tag
//! samples, and answers every [`DataSource`] request from them. Summaries are
//! simple event-weighted statistics over the recorded samples. Used by tests
//! and for working with the engine without a live server.

use crate::node::{Node, NodeId};
use crate::source::{
    BoundaryType, DataSource, ExpressionSampleType, NodeQuery, PagingConfig, RawPoint,
    SourceError, SourceResult, SummaryRequest, SummaryType, SummaryValue, TagSeries,
    TimestampCalculation,
};
use crate::tags::{Tag, TagSet};
use crate::time::{TimeBounds, TimeRange, format_span};
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wax::{Glob, Pattern};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse `YYYY-MM-DD HH:MM:SS` as a raw source timestamp.
pub fn parse_source_time(s: &str) -> SourceResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| SourceError::Other(format!("bad timestamp '{s}': {e}")))
}

/// Glob match, falling back to equality for names that are not valid patterns.
fn name_matches(pattern: &str, name: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.is_match(name),
        Err(_) => pattern == name,
    }
}

fn parse_interval(interval: &str) -> SourceResult<TimeDelta> {
    let step = parse_duration::parse(interval)
        .map_err(|e| SourceError::Other(format!("bad interval '{interval}': {e}")))?;
    let step = TimeDelta::from_std(step)
        .map_err(|e| SourceError::Other(format!("bad interval '{interval}': {e}")))?;
    if step <= TimeDelta::zero() {
        return Err(SourceError::Other(format!("interval '{interval}' must be positive")));
    }
    Ok(step)
}

/// Sample value at `t`: linear between numeric neighbours, otherwise the
/// previous sample. Missing before the first sample.
fn interpolate(samples: &[RawPoint], t: NaiveDateTime) -> Value {
    let idx = samples.partition_point(|p| p.timestamp <= t);
    if idx == 0 {
        return Value::Null;
    }
    let prev = &samples[idx - 1];
    if prev.timestamp == t || idx == samples.len() {
        return prev.value.clone();
    }
    let next = &samples[idx];
    match (prev.value.as_f64(), next.value.as_f64()) {
        (Some(a), Some(b)) => {
            let total = (next.timestamp - prev.timestamp).num_milliseconds() as f64;
            let part = (t - prev.timestamp).num_milliseconds() as f64;
            Value::Float(a + (b - a) * part / total)
        }
        _ => prev.value.clone(),
    }
}

/// Comparison filter of the form `'TAG' <op> number`.
#[derive(Debug, Clone, PartialEq)]
struct Filter {
    tag: String,
    op: String,
    threshold: f64,
}

impl Filter {
    fn parse(expression: &str) -> SourceResult<Self> {
        let unsupported = || SourceError::Unsupported(format!("filter expression '{expression}'"));
        let rest = expression.trim().strip_prefix('\'').ok_or_else(unsupported)?;
        let (tag, rest) = rest.split_once('\'').ok_or_else(unsupported)?;
        let rest = rest.trim();
        let op_len = if rest.starts_with(">=") || rest.starts_with("<=") || rest.starts_with("<>") {
            2
        } else if rest.starts_with(['>', '<', '=']) {
            1
        } else {
            return Err(unsupported());
        };
        let (op, number) = rest.split_at(op_len);
        let threshold = number.trim().parse::<f64>().map_err(|_| unsupported())?;
        Ok(Self {
            tag: tag.to_string(),
            op: op.to_string(),
            threshold,
        })
    }

    fn holds(&self, value: &Value) -> bool {
        let Some(v) = value.as_f64() else {
            return false;
        };
        match self.op.as_str() {
            ">" => v > self.threshold,
            ">=" => v >= self.threshold,
            "<" => v < self.threshold,
            "<=" => v <= self.threshold,
            "=" => v == self.threshold,
            "<>" => v != self.threshold,
            _ => false,
        }
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryDataSource {
    nodes: Vec<Arc<Node>>,
    attributes: HashMap<(String, String), Value>,
    failing_attributes: HashSet<(String, String)>,
    references: HashMap<String, Vec<String>>,
    tags: Vec<(Tag, Vec<RawPoint>)>,
    failing_tags: HashSet<String>,
    now: DateTime<Utc>,
    collection_limit: Option<TimeDelta>,
    latency: Option<Duration>,
    series_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MemoryDataSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            attributes: HashMap::new(),
            failing_attributes: HashSet::new(),
            references: HashMap::new(),
            tags: Vec::new(),
            failing_tags: HashSet::new(),
            now: Utc::now(),
            collection_limit: None,
            latency: None,
            series_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn add_node(&mut self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        self.nodes.push(node.clone());
        node
    }

    /// Every node, in insertion order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.clone()
    }

    fn next_id(&self) -> NodeId {
        NodeId(format!("node-{}", self.nodes.len() + 1))
    }

    /// Add an event. `end == None` leaves the event open.
    pub fn add_event(
        &mut self,
        path: &str,
        template: Option<&str>,
        start: &str,
        end: Option<&str>,
    ) -> crate::error::Result<Arc<Node>> {
        let start = parse_source_time(start).map_err(|e| crate::error::Error::data_source(path, e))?;
        let end = end
            .map(parse_source_time)
            .transpose()
            .map_err(|e| crate::error::Error::data_source(path, e))?;
        let bounds = TimeBounds::new(start.and_utc(), end.map(|e| e.and_utc()));
        let node = Node::event(self.next_id(), path, template, bounds)?;
        Ok(self.add_node(node))
    }

    pub fn add_asset(&mut self, path: &str, template: Option<&str>) -> crate::error::Result<Arc<Node>> {
        let node = Node::asset(self.next_id(), path, template)?;
        Ok(self.add_node(node))
    }

    pub fn set_attribute<V: Into<Value>>(&mut self, path: &str, name: &str, value: V) {
        self.attributes
            .insert((path.to_string(), name.to_string()), value.into());
    }

    /// Make reading `name` on the node at `path` fail.
    pub fn fail_attribute(&mut self, path: &str, name: &str) {
        self.failing_attributes
            .insert((path.to_string(), name.to_string()));
    }

    pub fn add_reference(&mut self, path: &str, element: &str) {
        self.references
            .entry(path.to_string())
            .or_default()
            .push(element.to_string());
    }

    /// Register a tag with its recorded samples.
    pub fn add_tag(&mut self, name: &str, mut samples: Vec<RawPoint>) -> Tag {
        samples.sort_by_key(|p| p.timestamp);
        let tag = Tag::new(name, format!("tag-{}", self.tags.len() + 1));
        self.tags.push((tag.clone(), samples));
        tag
    }

    /// Make every series request involving `name` fail.
    pub fn fail_tag(&mut self, name: &str) {
        self.failing_tags.insert(name.to_string());
    }

    pub fn set_now(&mut self, now: DateTime<Utc>) {
        self.now = now;
    }

    /// Reject series requests spanning more than `limit`.
    pub fn set_collection_limit(&mut self, limit: TimeDelta) {
        self.collection_limit = Some(limit);
    }

    /// Delay every series request, so concurrent callers overlap.
    pub fn set_latency(&mut self, latency: Duration) {
        self.latency = Some(latency);
    }

    /// Number of series and summary requests served so far.
    pub fn series_calls(&self) -> usize {
        self.series_calls.load(Ordering::SeqCst)
    }

    /// Highest number of series requests that were in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn begin_series(&self, tags: &[&str], range: &TimeRange) -> SourceResult<InFlight<'_>> {
        self.series_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight {
            counter: &self.in_flight,
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(limit) = self.collection_limit {
            if range.span() > limit {
                return Err(SourceError::CollectionLimit {
                    span: format_span(range.span()),
                });
            }
        }
        if let Some(bad) = tags.iter().find(|t| self.failing_tags.contains(**t)) {
            return Err(SourceError::Other(format!("read failure for tag {bad}")));
        }
        Ok(guard)
    }

    fn samples(&self, name: &str) -> SourceResult<&[RawPoint]> {
        self.tags
            .iter()
            .find(|(tag, _)| tag.name() == name)
            .map(|(_, samples)| samples.as_slice())
            .ok_or_else(|| SourceError::NotFound(format!("tag {name}")))
    }

    fn inside<'a>(&'a self, name: &str, range: &TimeRange) -> SourceResult<Vec<&'a RawPoint>> {
        let (start, end) = (range.start.naive_utc(), range.end.naive_utc());
        Ok(self
            .samples(name)?
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .collect())
    }

    fn filter_holds(&self, filter: Option<&Filter>, t: NaiveDateTime) -> SourceResult<bool> {
        match filter {
            None => Ok(true),
            Some(f) => Ok(f.holds(&interpolate(self.samples(&f.tag)?, t))),
        }
    }

    fn windows(range: &TimeRange, interval: &str) -> SourceResult<Vec<TimeRange>> {
        let step = parse_interval(interval)?;
        let mut out = Vec::new();
        let mut t = range.start;
        while t < range.end {
            let end = (t + step).min(range.end);
            out.push(TimeRange::new(t, end));
            t = end;
        }
        if out.is_empty() {
            out.push(*range);
        }
        Ok(out)
    }

    fn summaries_over(
        &self,
        tag: &str,
        label: &str,
        range: &TimeRange,
        interval: &str,
        filter: Option<&Filter>,
        request: &SummaryRequest,
    ) -> SourceResult<Vec<SummaryValue>> {
        let mut out = Vec::new();
        for window in Self::windows(range, interval)? {
            let last = window.end == range.end;
            let mut points = Vec::new();
            for p in self.inside(tag, &window)? {
                if !last && p.timestamp == window.end.naive_utc() {
                    continue;
                }
                if self.filter_holds(filter, p.timestamp)? {
                    points.push(p);
                }
            }
            out.extend(summarize(label, &points, &window, request));
        }
        Ok(out)
    }
}

fn summarize(
    label: &str,
    points: &[&RawPoint],
    window: &TimeRange,
    request: &SummaryRequest,
) -> Vec<SummaryValue> {
    let numeric: Vec<(NaiveDateTime, f64)> = points
        .iter()
        .filter_map(|p| p.value.as_f64().map(|v| (p.timestamp, v)))
        .collect();
    let n = numeric.len() as f64;
    let sum: f64 = numeric.iter().map(|(_, v)| v).sum();
    let mean = sum / n;
    let min = numeric.iter().copied().min_by(|a, b| a.1.total_cmp(&b.1));
    let max = numeric.iter().copied().max_by(|a, b| a.1.total_cmp(&b.1));
    let sq: f64 = numeric.iter().map(|(_, v)| (v - mean).powi(2)).sum();
    let stamp = match request.time_type {
        TimestampCalculation::MostRecentTime => window.end.naive_utc(),
        TimestampCalculation::Auto | TimestampCalculation::EarliestTime => {
            window.start.naive_utc()
        }
    };
    let some = |v: f64| if numeric.is_empty() { Value::Null } else { Value::Float(v) };

    request
        .types
        .singles()
        .map(|summary| {
            let (value, timestamp) = if summary == SummaryType::MINIMUM {
                (min.map_or(Value::Null, |m| Value::Float(m.1)), auto_time(request, min, stamp))
            } else if summary == SummaryType::MAXIMUM {
                (max.map_or(Value::Null, |m| Value::Float(m.1)), auto_time(request, max, stamp))
            } else if summary == SummaryType::AVERAGE {
                (some(mean), stamp)
            } else if summary == SummaryType::RANGE {
                (
                    some(max.map_or(0.0, |m| m.1) - min.map_or(0.0, |m| m.1)),
                    stamp,
                )
            } else if summary == SummaryType::STD_DEV {
                let v = if n > 1.0 { Value::Float((sq / (n - 1.0)).sqrt()) } else { Value::Null };
                (v, stamp)
            } else if summary == SummaryType::POP_STD_DEV {
                (some((sq / n).sqrt()), stamp)
            } else if summary == SummaryType::COUNT {
                (Value::Float(n), stamp)
            } else if summary == SummaryType::PERCENT_GOOD {
                let good = if points.is_empty() { 0.0 } else { 100.0 * n / points.len() as f64 };
                (Value::Float(good), stamp)
            } else {
                (some(sum), stamp)
            };
            SummaryValue {
                tag: label.to_string(),
                summary,
                value,
                timestamp,
            }
        })
        .collect()
}

fn auto_time(
    request: &SummaryRequest,
    at: Option<(NaiveDateTime, f64)>,
    fallback: NaiveDateTime,
) -> NaiveDateTime {
    match (request.time_type, at) {
        (TimestampCalculation::Auto, Some((t, _))) => t,
        _ => fallback,
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn find_nodes(&self, query: &NodeQuery) -> SourceResult<Vec<Node>> {
        let after = query
            .start
            .as_deref()
            .map(parse_source_time)
            .transpose()?
            .map(|t| t.and_utc());
        let before = query
            .end
            .as_deref()
            .map(parse_source_time)
            .transpose()?
            .map(|t| t.and_utc());
        let max = query.max_count.unwrap_or(usize::MAX);
        Ok(self
            .nodes
            .iter()
            .filter(|n| name_matches(&query.name, n.name()))
            .filter(|n| query.kind.is_none_or(|k| n.kind() == k))
            .filter(|n| {
                query
                    .template
                    .as_deref()
                    .is_none_or(|t| n.template() == Some(t))
            })
            .filter(|n| match (after, n.bounds()) {
                (Some(after), Some(b)) => b.end.is_none_or(|end| end >= after),
                _ => true,
            })
            .filter(|n| match (before, n.start()) {
                (Some(before), Some(start)) => start <= before,
                _ => true,
            })
            .take(max)
            .map(|n| n.as_ref().clone())
            .collect())
    }

    async fn load_descendants(&self, roots: &[Arc<Node>], depth: usize) -> SourceResult<Vec<Node>> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| {
                roots.iter().any(|root| {
                    (n.path() == root.path() || n.path().is_descendant_of(root.path()))
                        && n.level() - root.level() <= depth
                })
            })
            .map(|n| n.as_ref().clone())
            .collect())
    }

    async fn attribute_value(&self, node: &Node, name: &str) -> SourceResult<Value> {
        let key = (node.path().to_string(), name.to_string());
        if self.failing_attributes.contains(&key) {
            return Err(SourceError::Other(format!("cannot read {name} on {}", node.path())));
        }
        self.attributes
            .get(&key)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("attribute {name} on {}", node.path())))
    }

    async fn referenced_elements(&self, node: &Node) -> SourceResult<Vec<String>> {
        Ok(self
            .references
            .get(node.path().as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn find_tags(&self, query: &str) -> SourceResult<Vec<Tag>> {
        Ok(self
            .tags
            .iter()
            .filter(|(tag, _)| name_matches(query, tag.name()))
            .map(|(tag, _)| tag.clone())
            .collect())
    }

    async fn interpolated_values(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        interval: &str,
        filter_expression: Option<&str>,
        _paging: &PagingConfig,
    ) -> SourceResult<Vec<TagSeries>> {
        let _call = self.begin_series(&tags.names(), range).await?;
        let filter = filter_expression.map(Filter::parse).transpose()?;
        let step = parse_interval(interval)?;
        let mut stamps = Vec::new();
        let mut t = range.start;
        while t <= range.end {
            stamps.push(t.naive_utc());
            t += step;
        }
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let samples = self.samples(tag.name())?;
            let mut points = Vec::with_capacity(stamps.len());
            for &ts in &stamps {
                if self.filter_holds(filter.as_ref(), ts)? {
                    points.push(RawPoint::new(ts, interpolate(samples, ts)));
                }
            }
            out.push(TagSeries {
                tag: tag.name().to_string(),
                points,
            });
        }
        Ok(out)
    }

    async fn recorded_values(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        boundary: BoundaryType,
        filter_expression: Option<&str>,
        _paging: &PagingConfig,
    ) -> SourceResult<Vec<TagSeries>> {
        let _call = self.begin_series(&tags.names(), range).await?;
        let filter = filter_expression.map(Filter::parse).transpose()?;
        let (start, end) = (range.start.naive_utc(), range.end.naive_utc());
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let samples = self.samples(tag.name())?;
            let mut points: Vec<RawPoint> = Vec::new();
            match boundary {
                BoundaryType::Inside => {}
                BoundaryType::Outside => {
                    if let Some(p) = samples.iter().rev().find(|p| p.timestamp < start) {
                        points.push(p.clone());
                    }
                }
                BoundaryType::Interpolated => {
                    if !samples.iter().any(|p| p.timestamp == start) {
                        points.push(RawPoint::new(start, interpolate(samples, start)));
                    }
                }
            }
            points.extend(
                samples
                    .iter()
                    .filter(|p| p.timestamp >= start && p.timestamp <= end)
                    .cloned(),
            );
            match boundary {
                BoundaryType::Inside => {}
                BoundaryType::Outside => {
                    if let Some(p) = samples.iter().find(|p| p.timestamp > end) {
                        points.push(p.clone());
                    }
                }
                BoundaryType::Interpolated => {
                    if !samples.iter().any(|p| p.timestamp == end) {
                        points.push(RawPoint::new(end, interpolate(samples, end)));
                    }
                }
            }
            let mut kept = Vec::with_capacity(points.len());
            for p in points {
                if self.filter_holds(filter.as_ref(), p.timestamp)? {
                    kept.push(p);
                }
            }
            out.push(TagSeries {
                tag: tag.name().to_string(),
                points: kept,
            });
        }
        Ok(out)
    }

    async fn plot_values(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        intervals: usize,
        _paging: &PagingConfig,
    ) -> SourceResult<Vec<TagSeries>> {
        let _call = self.begin_series(&tags.names(), range).await?;
        let intervals = i32::try_from(intervals.max(1))
            .map_err(|_| SourceError::Unsupported(format!("{intervals} plot intervals")))?;
        let width = range.span() / intervals;
        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            let inside = self.inside(tag.name(), range)?;
            let mut points: Vec<RawPoint> = Vec::new();
            for i in 0..intervals {
                let lo = range.start + width * i;
                let hi = if i + 1 == intervals { range.end } else { lo + width };
                let bucket: Vec<(usize, &RawPoint)> = inside
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        let t = p.timestamp.and_utc();
                        t >= lo && (t < hi || (i + 1 == intervals && t <= hi))
                    })
                    .map(|(j, p)| (j, *p))
                    .collect();
                let Some(&(first, _)) = bucket.first() else {
                    continue;
                };
                let last = bucket.last().map_or(first, |(j, _)| *j);
                let numeric = bucket
                    .iter()
                    .filter_map(|(j, p)| p.value.as_f64().map(|v| (*j, v)));
                let min = numeric.clone().min_by(|a, b| a.1.total_cmp(&b.1)).map(|m| m.0);
                let max = numeric.max_by(|a, b| a.1.total_cmp(&b.1)).map(|m| m.0);
                let mut picked: Vec<usize> = [Some(first), min, max, Some(last)]
                    .into_iter()
                    .flatten()
                    .collect();
                picked.sort_unstable();
                picked.dedup();
                points.extend(picked.into_iter().map(|j| inside[j].clone()));
            }
            out.push(TagSeries {
                tag: tag.name().to_string(),
                points,
            });
        }
        Ok(out)
    }

    async fn summary(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        request: &SummaryRequest,
        _paging: &PagingConfig,
    ) -> SourceResult<Vec<SummaryValue>> {
        let _call = self.begin_series(&tags.names(), range).await?;
        let mut out = Vec::new();
        for tag in tags {
            let points = self.inside(tag.name(), range)?;
            out.extend(summarize(tag.name(), &points, range, request));
        }
        Ok(out)
    }

    async fn summaries(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        interval: &str,
        request: &SummaryRequest,
        _paging: &PagingConfig,
    ) -> SourceResult<Vec<SummaryValue>> {
        let _call = self.begin_series(&tags.names(), range).await?;
        let mut out = Vec::new();
        for tag in tags {
            out.extend(self.summaries_over(tag.name(), tag.name(), range, interval, None, request)?);
        }
        Ok(out)
    }

    async fn filtered_summaries(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        interval: &str,
        filter_expression: &str,
        _filter_interval: Option<&str>,
        request: &SummaryRequest,
        _paging: &PagingConfig,
    ) -> SourceResult<Vec<SummaryValue>> {
        let _call = self.begin_series(&tags.names(), range).await?;
        let filter = Filter::parse(filter_expression)?;
        let mut out = Vec::new();
        for tag in tags {
            out.extend(self.summaries_over(
                tag.name(),
                tag.name(),
                range,
                interval,
                Some(&filter),
                request,
            )?);
        }
        Ok(out)
    }

    async fn calc_summaries(
        &self,
        expression: &str,
        range: &TimeRange,
        interval: &str,
        request: &SummaryRequest,
        _sample_type: ExpressionSampleType,
        _filter_interval: Option<&str>,
    ) -> SourceResult<Vec<SummaryValue>> {
        let tag = expression
            .trim()
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .filter(|s| !s.contains('\''))
            .ok_or_else(|| SourceError::Unsupported(format!("expression {expression}")))?;
        let _call = self.begin_series(&[tag], range).await?;
        self.summaries_over(tag, expression, range, interval, None, request)
    }

    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
