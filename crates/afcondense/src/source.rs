//! The asset-framework data source the engine talks to
//!
//! Everything the engine knows about the outside world goes through
//! [`DataSource`]. Connection setup, credentials and the wire protocol live in
//! the implementation; the engine only forwards ranges, tags and paging hints
//! and shapes what comes back.

use crate::node::Node;
use crate::tags::{Tag, TagSet};
use crate::time::TimeRange;
use crate::value::Value;
use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Failures reported by a data source implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duration exceeds maximum allowed collection limit ({span})")]
    CollectionLimit { span: String },

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

bitflags! {
    /// Summary statistics the data source can compute over a range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SummaryType: u32 {
        const TOTAL = 1;
        const AVERAGE = 2;
        const MINIMUM = 4;
        const MAXIMUM = 8;
        const RANGE = 16;
        const STD_DEV = 32;
        const POP_STD_DEV = 64;
        const COUNT = 128;
        const PERCENT_GOOD = 8192;
        const TOTAL_WITH_UOM = 16384;
        const ALL = 24831;
        const ALL_FOR_NON_NUMERIC = 8320;
    }
}

static SINGLE_SUMMARIES: [(SummaryType, &str); 10] = [
    (SummaryType::TOTAL, "TOTAL"),
    (SummaryType::AVERAGE, "AVERAGE"),
    (SummaryType::MINIMUM, "MINIMUM"),
    (SummaryType::MAXIMUM, "MAXIMUM"),
    (SummaryType::RANGE, "RANGE"),
    (SummaryType::STD_DEV, "STD_DEV"),
    (SummaryType::POP_STD_DEV, "POP_STD_DEV"),
    (SummaryType::COUNT, "COUNT"),
    (SummaryType::PERCENT_GOOD, "PERCENT_GOOD"),
    (SummaryType::TOTAL_WITH_UOM, "TOTAL_WITH_UOM"),
];

impl SummaryType {
    /// Individual summaries contained in this set, in flag order.
    pub fn singles(self) -> impl Iterator<Item = SummaryType> {
        SINGLE_SUMMARIES
            .iter()
            .filter(move |(flag, _)| self.contains(*flag))
            .map(|(flag, _)| *flag)
    }

    /// Upper-case label used in the `Summary` output column.
    #[must_use]
    pub fn label(self) -> String {
        let names: Vec<&str> = SINGLE_SUMMARIES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            "NONE".to_string()
        } else {
            names.join("|")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationBasis {
    #[default]
    TimeWeighted,
    EventWeighted,
    TimeWeightedContinuous,
    TimeWeightedDiscrete,
    EventWeightedExcludeMostRecentEvent,
    EventWeightedExcludeEarliestEvent,
    EventWeightedIncludeBothEnds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampCalculation {
    #[default]
    Auto,
    EarliestTime,
    MostRecentTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryType {
    #[default]
    Inside,
    Outside,
    Interpolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionSampleType {
    #[default]
    ExpressionRecordedValues,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    TagCount,
    #[default]
    EventCount,
}

/// Batch-size hint forwarded with every series request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    pub page_type: PageType,
    pub page_size: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_type: PageType::EventCount,
            page_size: 1000,
        }
    }
}

/// Parameters shared by every summary request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryRequest {
    pub types: SummaryType,
    pub basis: CalculationBasis,
    pub time_type: TimestampCalculation,
}

impl Default for SummaryRequest {
    fn default() -> Self {
        Self {
            types: SummaryType::AVERAGE,
            basis: CalculationBasis::default(),
            time_type: TimestampCalculation::default(),
        }
    }
}

/// Node search. Start and end are passed through untouched, the data source
/// owns their syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeQuery {
    pub name: String,
    pub kind: Option<crate::node::NodeKind>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub template: Option<String>,
    pub max_count: Option<usize>,
}

impl NodeQuery {
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// One sample as the data source reports it: naive UTC timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    pub timestamp: NaiveDateTime,
    pub value: Value,
}

impl RawPoint {
    pub fn new(timestamp: NaiveDateTime, value: Value) -> Self {
        Self { timestamp, value }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagSeries {
    pub tag: String,
    pub points: Vec<RawPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryValue {
    pub tag: String,
    pub summary: SummaryType,
    pub value: Value,
    pub timestamp: NaiveDateTime,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Search nodes by name pattern and optional filters.
    async fn find_nodes(&self, query: &NodeQuery) -> SourceResult<Vec<Node>>;

    /// All descendants of `roots` down to `depth` levels below them. May
    /// include the roots themselves.
    async fn load_descendants(&self, roots: &[Arc<Node>], depth: usize) -> SourceResult<Vec<Node>>;

    async fn attribute_value(&self, node: &Node, name: &str) -> SourceResult<Value>;

    /// Names of elements referenced by `node`, possibly none.
    async fn referenced_elements(&self, node: &Node) -> SourceResult<Vec<String>>;

    /// Tags matching one identifier or pattern. Empty when nothing matches.
    async fn find_tags(&self, query: &str) -> SourceResult<Vec<Tag>>;

    async fn interpolated_values(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        interval: &str,
        filter_expression: Option<&str>,
        paging: &PagingConfig,
    ) -> SourceResult<Vec<TagSeries>>;

    async fn recorded_values(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        boundary: BoundaryType,
        filter_expression: Option<&str>,
        paging: &PagingConfig,
    ) -> SourceResult<Vec<TagSeries>>;

    async fn plot_values(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        intervals: usize,
        paging: &PagingConfig,
    ) -> SourceResult<Vec<TagSeries>>;

    /// One value per tag and summary type over the whole range.
    async fn summary(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        request: &SummaryRequest,
        paging: &PagingConfig,
    ) -> SourceResult<Vec<SummaryValue>>;

    /// Summaries per `interval` across the range.
    async fn summaries(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        interval: &str,
        request: &SummaryRequest,
        paging: &PagingConfig,
    ) -> SourceResult<Vec<SummaryValue>>;

    /// Summaries over only the samples where `filter_expression` holds.
    #[allow(clippy::too_many_arguments)]
    async fn filtered_summaries(
        &self,
        tags: &TagSet,
        range: &TimeRange,
        interval: &str,
        filter_expression: &str,
        filter_interval: Option<&str>,
        request: &SummaryRequest,
        paging: &PagingConfig,
    ) -> SourceResult<Vec<SummaryValue>>;

    /// Summaries of a calculated expression. The `tag` of each returned value
    /// is the expression text.
    #[allow(clippy::too_many_arguments)]
    async fn calc_summaries(
        &self,
        expression: &str,
        range: &TimeRange,
        interval: &str,
        request: &SummaryRequest,
        sample_type: ExpressionSampleType,
        filter_interval: Option<&str>,
    ) -> SourceResult<Vec<SummaryValue>>;

    /// Current time according to the data source.
    fn now(&self) -> DateTime<Utc>;
}
