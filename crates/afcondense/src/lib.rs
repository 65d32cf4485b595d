#![allow(missing_docs)]

//! afcondense - flatten event and asset hierarchies into wide tables and
//! extract time-series data for each row
//!
//! Set AFCONDENSE_LOG environment variable to control logging:
//! - AFCONDENSE_LOG=off (default) - silent
//! - AFCONDENSE_LOG=info - extraction plans and chunk counts
//! - AFCONDENSE_LOG=debug - per-level condensing detail

// Error types
pub mod error;

/// Source time conventions and ranges
pub mod time;

/// Hierarchy nodes and their paths
pub mod node;

/// Cell values
pub mod value;

/// Column-oriented table and its Arrow conversions
pub mod table;

/// Engine settings
pub mod config;

/// Data source contract and request types
pub mod source;

/// In-memory data source for tests and offline use
pub mod memory;

// Tag lists, tag columns and resolution
pub mod tags;

/// Hierarchy table construction and enrichment
pub mod hierarchy;

/// Per-level full outer join into one row per leaf lineage
pub mod condense;

// Time-series extraction
pub mod extract;

// Bounded concurrent chunking of extractions
pub mod chunked;

pub use chunked::{ChunkSource, ChunkedRunner, Operation, TargetTable};
pub use condense::{CondensedTable, Condenser, LevelLabel};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use extract::{
    CalcSummaryArgs, ExpressionSpec, ExtractTarget, Extractor, GroupedSeries, InterpolatedArgs,
    PlotArgs, RecordedArgs, SummaryArgs,
};
pub use hierarchy::{HierarchyTable, Scope};
pub use memory::MemoryDataSource;
pub use node::{Node, NodeId, NodeKind, NodePath};
pub use source::{DataSource, NodeQuery, SourceError, SummaryType};
pub use table::{Table, Tabular};
pub use tags::{Tag, TagCache, TagSet, TagSpec};
pub use time::{TimeBounds, TimeRange};
pub use value::Value;
