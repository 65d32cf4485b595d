//! Split long extractions into bounded chunks run concurrently.
//!
//! A chunk is a slice of table rows, or a slice of an explicit tag list.
//! Chunks run on a `JoinSet` with at most `max_concurrency` in flight, and
//! their results are concatenated in chunk order so the output matches an
//! unchunked run. The first failing chunk cancels the rest.

use crate::condense::CondensedTable;
use crate::error::{Error, Result};
use crate::extract::{
    CalcSummaryArgs, ExtractTarget, ExtractionFrame, Extractor, InterpolatedArgs, PlotArgs,
    RecordedArgs, SummaryArgs,
};
use crate::hierarchy::HierarchyTable;
use crate::table::{Table, Tabular};
use crate::tags::{TagSet, TagSpec};
use chrono_tz::Tz;
use diagnostics::*;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Either table an extraction can target.
#[derive(Debug, Clone)]
pub enum TargetTable {
    Hierarchy(HierarchyTable),
    Condensed(CondensedTable),
}

impl Tabular for TargetTable {
    fn table(&self) -> &Table {
        match self {
            TargetTable::Hierarchy(h) => h.table(),
            TargetTable::Condensed(c) => c.table(),
        }
    }
}

impl ExtractTarget for TargetTable {
    fn display_tz(&self) -> Tz {
        match self {
            TargetTable::Hierarchy(h) => h.display_tz(),
            TargetTable::Condensed(c) => c.display_tz(),
        }
    }

    fn extraction_frame(&self) -> Result<ExtractionFrame> {
        match self {
            TargetTable::Hierarchy(h) => h.extraction_frame(),
            TargetTable::Condensed(c) => c.extraction_frame(),
        }
    }
}

impl From<HierarchyTable> for TargetTable {
    fn from(table: HierarchyTable) -> Self {
        TargetTable::Hierarchy(table)
    }
}

impl From<CondensedTable> for TargetTable {
    fn from(table: CondensedTable) -> Self {
        TargetTable::Condensed(table)
    }
}

/// What gets split into chunks.
#[derive(Debug, Clone)]
pub enum ChunkSource {
    /// Chunk the rows of a hierarchy table.
    Hierarchy(HierarchyTable),
    /// Chunk the rows of a condensed table.
    Condensed(CondensedTable),
    /// Chunk an explicit tag list; every chunk runs over all of `target`.
    Tags { target: TargetTable, tags: TagSet },
}

impl ChunkSource {
    fn len(&self) -> usize {
        match self {
            ChunkSource::Hierarchy(h) => h.num_rows(),
            ChunkSource::Condensed(c) => c.num_rows(),
            ChunkSource::Tags { tags, .. } => tags.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Operation {
    Interpolated { tags: TagSpec, args: InterpolatedArgs },
    Summary { tags: TagSpec, args: SummaryArgs },
    CalcSummary(CalcSummaryArgs),
    ContinuousInterpolated { tags: TagSpec, args: InterpolatedArgs },
    Recorded { tags: TagSpec, args: RecordedArgs },
    Plot { tags: TagSpec, args: PlotArgs },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Interpolated { .. } => "interpolated",
            Operation::Summary { .. } => "summary",
            Operation::CalcSummary(_) => "calc_summary",
            Operation::ContinuousInterpolated { .. } => "continuous_interpolated",
            Operation::Recorded { .. } => "recorded",
            Operation::Plot { .. } => "plot",
        }
    }

    /// Operations whose output for a row depends only on that row.
    pub fn is_chunkable(&self) -> bool {
        matches!(
            self,
            Operation::Interpolated { .. } | Operation::Summary { .. } | Operation::CalcSummary(_)
        )
    }

    fn with_tags(&self, tags: TagSet) -> Result<Self> {
        let spec = TagSpec::Resolved(tags);
        match self {
            Operation::Interpolated { args, .. } => Ok(Operation::Interpolated {
                tags: spec,
                args: args.clone(),
            }),
            Operation::Summary { args, .. } => Ok(Operation::Summary {
                tags: spec,
                args: args.clone(),
            }),
            other => Err(Error::InvalidArgument(format!(
                "{} cannot be chunked over tags",
                other.name()
            ))),
        }
    }

    async fn run(&self, extractor: &Extractor, target: &TargetTable) -> Result<Table> {
        match self {
            Operation::Interpolated { tags, args } => {
                extractor.interpolated_extract(target, tags, args).await
            }
            Operation::Summary { tags, args } => extractor.summary_extract(target, tags, args).await,
            Operation::CalcSummary(args) => extractor.calc_summary_extract(target, args).await,
            other => Err(Error::UnsupportedOperation(other.name().to_string())),
        }
    }
}

struct Chunk {
    index: usize,
    target: TargetTable,
    operation: Operation,
}

fn plan(source: ChunkSource, operation: &Operation, chunk_size: usize) -> Result<Vec<Chunk>> {
    let len = source.len();
    let starts: Vec<usize> = if len == 0 {
        vec![0]
    } else {
        (0..len).step_by(chunk_size).collect()
    };
    let chunks = match source {
        ChunkSource::Hierarchy(h) => starts
            .into_iter()
            .enumerate()
            .map(|(index, offset)| Chunk {
                index,
                target: TargetTable::Hierarchy(h.slice(offset, chunk_size)),
                operation: operation.clone(),
            })
            .collect(),
        ChunkSource::Condensed(c) => starts
            .into_iter()
            .enumerate()
            .map(|(index, offset)| Chunk {
                index,
                target: TargetTable::Condensed(c.slice(offset, chunk_size)),
                operation: operation.clone(),
            })
            .collect(),
        ChunkSource::Tags { target, tags } => {
            let parts = if tags.is_empty() {
                vec![tags]
            } else {
                tags.chunks(chunk_size)
            };
            parts
                .into_iter()
                .enumerate()
                .map(|(index, part)| {
                    Ok(Chunk {
                        index,
                        target: target.clone(),
                        operation: operation.with_tags(part)?,
                    })
                })
                .collect::<Result<_>>()?
        }
    };
    Ok(chunks)
}

pub struct ChunkedRunner {
    extractor: Extractor,
    cancel: CancellationToken,
}

impl ChunkedRunner {
    pub fn new(extractor: Extractor) -> Self {
        Self {
            extractor,
            cancel: CancellationToken::new(),
        }
    }

    /// Run under an externally owned token; cancelling it stops every chunk.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, source: ChunkSource, operation: Operation, chunk_size: usize) -> Result<Table> {
        if !operation.is_chunkable() {
            return Err(Error::UnsupportedOperation(format!(
                "{} cannot be chunked",
                operation.name()
            )));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be at least 1".to_string()));
        }
        // a zero permit count would park every chunk forever
        self.extractor.config().validate()?;

        let chunks = plan(source, &operation, chunk_size)?;
        let count = chunks.len();
        let limit = self.extractor.config().max_concurrency;
        let op = operation.name();
        info!(
            "Running {op} in {count} chunks of up to {chunk_size}, {limit} at a time",
            op: op,
            count: count,
            chunk_size: chunk_size,
            limit: limit
        );

        let run_token = self.cancel.child_token();
        let permits = Arc::new(Semaphore::new(limit));
        let mut tasks: JoinSet<(usize, Result<Table>)> = JoinSet::new();
        for chunk in chunks {
            let extractor = self.extractor.clone();
            let token = run_token.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let index = chunk.index;
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::Cancelled),
                    result = async {
                        let _permit = permits.acquire_owned().await.map_err(|_| Error::Cancelled)?;
                        chunk.operation.run(&extractor, &chunk.target).await
                    } => result,
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Table>> = vec![None; count];
        let mut failure: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(table))) => slots[index] = Some(table),
                Ok((_, Err(Error::Cancelled))) => {}
                Ok((index, Err(error))) => {
                    if failure.is_none() {
                        let error_str = error.to_string();
                        warn!("Chunk {index} failed, cancelling the rest: {error_str}", index: index, error_str: error_str);
                        failure = Some(Error::Chunk {
                            index,
                            source: Box::new(error),
                        });
                        run_token.cancel();
                    }
                }
                Err(join_error) => {
                    if failure.is_none() {
                        let error_str = join_error.to_string();
                        error!("Chunk worker failed: {error_str}", error_str: error_str);
                        failure = Some(Error::Worker(error_str));
                        run_token.cancel();
                    }
                }
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }
        let tables: Vec<Table> = slots.into_iter().collect::<Option<_>>().ok_or(Error::Cancelled)?;
        debug!("Concatenating {count} chunk results", count: count);
        Ok(Table::concat(&tables))
    }
}
