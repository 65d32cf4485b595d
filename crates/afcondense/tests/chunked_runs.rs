use afcondense::memory::parse_source_time;
use afcondense::source::RawPoint;
use afcondense::{
    CalcSummaryArgs, ChunkSource, ChunkedRunner, CondensedTable, EngineConfig, Error,
    ExpressionSpec, Extractor, HierarchyTable, MemoryDataSource, Operation, RecordedArgs,
    SummaryArgs, SummaryType, TagSpec, Table, Tabular, Value,
};
use chrono::TimeZone;
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;

/// `procedures` procedures, each a unit with two phases, one tag sampled hourly.
fn plant(procedures: u32) -> anyhow::Result<MemoryDataSource> {
    let mut source = MemoryDataSource::new();
    source.set_now(parse_source_time("2022-02-01 00:00:00")?.and_utc());
    for p in 1..=procedures {
        let day = format!("2022-01-{p:02}");
        let root = format!(r"\\srv\db\Batch{p}");
        source.add_event(&root, None, &format!("{day} 00:00:00"), Some(&format!("{day} 12:00:00")))?;
        let unit = format!(r"{root}\Reactor");
        source.add_event(&unit, None, &format!("{day} 00:00:00"), Some(&format!("{day} 12:00:00")))?;
        source.add_event(
            &format!(r"{unit}\Charge"),
            None,
            &format!("{day} 00:00:00"),
            Some(&format!("{day} 04:00:00")),
        )?;
        source.add_event(
            &format!(r"{unit}\React"),
            None,
            &format!("{day} 04:00:00"),
            Some(&format!("{day} 12:00:00")),
        )?;
    }
    let mut points = Vec::new();
    for p in 1..=procedures {
        for h in 0..=12 {
            points.push(RawPoint::new(
                parse_source_time(&format!("2022-01-{p:02} {h:02}:00:00"))?,
                Value::Float(f64::from(p * 100 + h)),
            ));
        }
    }
    source.add_tag("TI-1", points);
    Ok(source)
}

async fn condensed(source: &MemoryDataSource) -> anyhow::Result<CondensedTable> {
    let now = Tz::UTC.with_ymd_and_hms(2022, 2, 1, 0, 0, 0).unwrap();
    Ok(HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?
        .condense_at(now)
        .await?)
}

fn summary() -> Operation {
    Operation::Summary {
        tags: TagSpec::names(["TI-1"]),
        args: SummaryArgs {
            summary_types: SummaryType::MINIMUM | SummaryType::MAXIMUM,
            ..SummaryArgs::default()
        },
    }
}

fn row_set(table: &Table) -> Vec<String> {
    let mut rows: Vec<String> = (0..table.num_rows())
        .map(|r| {
            table
                .column_names()
                .iter()
                .map(|c| table.value(r, c).map(Value::key).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect();
    rows.sort();
    rows
}

#[tokio::test]
async fn test_chunked_summary_matches_unchunked() -> anyhow::Result<()> {
    let source = plant(3)?;
    let table = condensed(&source).await?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(EngineConfig::default()));
    let Operation::Summary { tags, args } = summary() else {
        unreachable!()
    };
    let expected = extractor.summary_extract(&table, &tags, &args).await?;
    assert_eq!(expected.num_rows(), 12);

    let runner = ChunkedRunner::new(extractor);
    let len = table.num_rows();
    for size in [1, len, len + 1] {
        let chunked = runner
            .run(ChunkSource::Condensed(table.clone()), summary(), size)
            .await?;
        assert_eq!(row_set(&chunked), row_set(&expected), "chunk size {size}");
        assert_eq!(chunked.column_names(), expected.column_names());
    }
    Ok(())
}

#[tokio::test]
async fn test_chunked_calc_summary_over_hierarchy_rows() -> anyhow::Result<()> {
    let source = plant(2)?;
    let table = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    let runner = ChunkedRunner::new(Extractor::new(
        Arc::new(source),
        Arc::new(EngineConfig::default()),
    ));
    let mut args = CalcSummaryArgs::new(ExpressionSpec::Literal("'TI-1'".to_string()));
    args.summary_types = SummaryType::MAXIMUM;
    let out = runner
        .run(ChunkSource::Hierarchy(table.clone()), Operation::CalcSummary(args), 3)
        .await?;
    assert_eq!(out.num_rows(), table.num_rows());
    assert_eq!(out.value(0, "Name"), Some(&Value::from("Batch1")));
    assert_eq!(out.value(0, "Value"), Some(&Value::Float(112.0)));
    Ok(())
}

#[tokio::test]
async fn test_concurrency_is_bounded() -> anyhow::Result<()> {
    let mut source = plant(8)?;
    source.set_latency(Duration::from_millis(20));
    let source = Arc::new(source);
    let table = condensed(&source).await?;
    let config = EngineConfig {
        max_concurrency: 3,
        ..EngineConfig::default()
    };
    let runner = ChunkedRunner::new(Extractor::new(source.clone(), Arc::new(config)));

    let out = runner
        .run(ChunkSource::Condensed(table.clone()), summary(), 1)
        .await?;
    assert_eq!(out.num_rows(), table.num_rows() * 2);
    assert_eq!(source.series_calls(), table.num_rows());
    assert!(source.peak_concurrency() <= 3, "peak {}", source.peak_concurrency());
    assert!(source.peak_concurrency() >= 1);
    Ok(())
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected_not_stalled() -> anyhow::Result<()> {
    let source = plant(1)?;
    let table = condensed(&source).await?;
    let config = EngineConfig {
        max_concurrency: 0,
        ..EngineConfig::default()
    };
    let runner = ChunkedRunner::new(Extractor::new(Arc::new(source), Arc::new(config)));
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        runner.run(ChunkSource::Condensed(table), summary(), 1),
    )
    .await?;
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_grouped_operations_are_not_chunkable() -> anyhow::Result<()> {
    let source = plant(1)?;
    let table = condensed(&source).await?;
    let runner = ChunkedRunner::new(Extractor::new(
        Arc::new(source),
        Arc::new(EngineConfig::default()),
    ));
    let op = Operation::Recorded {
        tags: TagSpec::names(["TI-1"]),
        args: RecordedArgs::default(),
    };
    let err = runner
        .run(ChunkSource::Condensed(table), op, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOperation(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_first_failure_is_reported() -> anyhow::Result<()> {
    let mut source = plant(2)?;
    source.fail_tag("TI-1");
    let table = condensed(&source).await?;
    let runner = ChunkedRunner::new(Extractor::new(
        Arc::new(source),
        Arc::new(EngineConfig::default()),
    ));
    let err = runner
        .run(ChunkSource::Condensed(table), summary(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Chunk { .. }), "{err}");
    assert!(err.to_string().contains("TI-1"), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_cancelled_run_stops() -> anyhow::Result<()> {
    let source = plant(2)?;
    let table = condensed(&source).await?;
    let runner = ChunkedRunner::new(Extractor::new(
        Arc::new(source),
        Arc::new(EngineConfig::default()),
    ));
    runner.cancellation_token().cancel();
    let err = runner
        .run(ChunkSource::Condensed(table), summary(), 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "{err}");
    Ok(())
}
