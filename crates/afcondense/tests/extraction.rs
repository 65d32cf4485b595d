use afcondense::memory::parse_source_time;
use afcondense::source::{RawPoint, SourceError};
use afcondense::tags::TagResolver;
use afcondense::{
    EngineConfig, Error, Extractor, HierarchyTable, InterpolatedArgs, MemoryDataSource, Scope,
    SummaryArgs, SummaryType, TagCache, TagSpec, Tabular, Value,
};
use chrono::Timelike;
use chrono_tz::Tz;
use std::sync::Arc;

fn ramp(hours: u32, step: f64) -> anyhow::Result<Vec<RawPoint>> {
    (0..=hours)
        .map(|h| {
            Ok(RawPoint::new(
                parse_source_time(&format!("2022-01-01 {h:02}:00:00"))?,
                Value::Float(f64::from(h) * step),
            ))
        })
        .collect()
}

/// Two sibling events with two tags recorded hourly.
fn plant() -> anyhow::Result<MemoryDataSource> {
    let mut source = MemoryDataSource::new();
    source.set_now(parse_source_time("2022-01-01 12:00:00")?.and_utc());
    source.add_event(r"\\srv\db\E1", None, "2022-01-01 00:00:00", Some("2022-01-01 02:00:00"))?;
    source.add_event(r"\\srv\db\E2", None, "2022-01-01 04:00:00", Some("2022-01-01 06:00:00"))?;
    source.add_tag("A", ramp(8, 10.0)?);
    source.add_tag("B", ramp(8, 1.0)?);
    source.set_attribute(r"\\srv\db\E1", "Tags", "A, B");
    source.set_attribute(r"\\srv\db\E2", "Tags", "B");
    Ok(source)
}

async fn hierarchy(source: &MemoryDataSource, config: &EngineConfig) -> anyhow::Result<HierarchyTable> {
    let mut table = HierarchyTable::from_nodes(source.nodes(), config.display_timezone)?;
    table
        .add_attributes(source, &["Tags"], &Scope::Untemplated, config)
        .await?;
    Ok(table)
}

#[tokio::test]
async fn test_tag_cell_lists_in_time_series_mode() -> anyhow::Result<()> {
    let source = plant()?;
    let config = EngineConfig::default();
    let table = hierarchy(&source, &config).await?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(config));

    let out = extractor
        .interpolated_extract(&table, &TagSpec::column("Tags [None]"), &InterpolatedArgs::default())
        .await?;
    let tags_for = |name: &str| -> Vec<String> {
        (0..out.num_rows())
            .filter(|&r| out.value(r, "Name") == Some(&Value::from(name)))
            .filter_map(|r| out.value(r, "Tag").map(Value::to_string))
            .collect()
    };
    let e1 = tags_for("E1");
    assert!(e1.contains(&"A".to_string()) && e1.contains(&"B".to_string()), "{e1:?}");
    assert!(tags_for("E2").iter().all(|t| t == "B"));
    // three hourly samples per tag: E1 has two tags, E2 one
    assert_eq!(out.num_rows(), 9);
    Ok(())
}

#[tokio::test]
async fn test_tag_cell_lists_rejected_for_summaries() -> anyhow::Result<()> {
    let source = plant()?;
    let config = EngineConfig::default();
    let table = hierarchy(&source, &config).await?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(config));

    let err = extractor
        .summary_extract(&table, &TagSpec::column("Tags [None]"), &SummaryArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidShape(_)), "{err}");

    let err = extractor
        .summary_extract(&table, &TagSpec::column("Missing"), &SummaryArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidShape(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_pattern_cell_matching_several_tags_rejected_for_summaries() -> anyhow::Result<()> {
    let mut source = plant()?;
    source.set_attribute(r"\\srv\db\E1", "Pattern", "*");
    source.set_attribute(r"\\srv\db\E2", "Pattern", "B");
    let config = EngineConfig::default();
    let mut table = HierarchyTable::from_nodes(source.nodes(), config.display_timezone)?;
    table
        .add_attributes(&source, &["Pattern"], &Scope::Untemplated, &config)
        .await?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(config));

    let err = extractor
        .summary_extract(&table, &TagSpec::column("Pattern [None]"), &SummaryArgs::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidShape(_)), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_unknown_tag_names_identifier() -> anyhow::Result<()> {
    let source = plant()?;
    let err = TagResolver::new(&source)
        .resolve(&TagSpec::names(["A", "NOPE-9"]))
        .await
        .unwrap_err();
    match err {
        Error::NotFound { kind, name } => {
            assert_eq!(kind, "tag");
            assert_eq!(name, "NOPE-9");
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_display_timezone_applies_to_results() -> anyhow::Result<()> {
    let source = plant()?;
    let config = EngineConfig::default().with_timezone(chrono_tz::Europe::Amsterdam);
    let table = HierarchyTable::from_nodes(source.nodes(), config.display_timezone)?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(config));

    let out = extractor
        .interpolated_extract(&table, &TagSpec::names(["A"]), &InterpolatedArgs::default())
        .await?;
    let first = out.value(0, "Time").and_then(Value::as_time).cloned();
    let first = first.ok_or_else(|| anyhow::anyhow!("no time"))?;
    assert_eq!(first.timezone(), chrono_tz::Europe::Amsterdam);
    assert_eq!(first.hour(), 1);
    assert_eq!(out.value(0, "A"), Some(&Value::Float(0.0)));
    Ok(())
}

#[tokio::test]
async fn test_open_events_run_until_now() -> anyhow::Result<()> {
    let mut source = MemoryDataSource::new();
    source.set_now(parse_source_time("2022-01-01 03:00:00")?.and_utc());
    source.add_event(r"\\srv\db\Live", None, "2022-01-01 00:00:00", None)?;
    source.add_tag("A", ramp(8, 10.0)?);
    let table = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(EngineConfig::default()));

    let out = extractor
        .interpolated_extract(&table, &TagSpec::names(["A"]), &InterpolatedArgs::default())
        .await?;
    assert_eq!(out.num_rows(), 4);
    assert_eq!(out.value(3, "A"), Some(&Value::Float(30.0)));
    Ok(())
}

#[tokio::test]
async fn test_interval_and_filtered_summaries() -> anyhow::Result<()> {
    let source = plant()?;
    let table = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(EngineConfig::default()));

    let windows = SummaryArgs {
        summary_types: SummaryType::MAXIMUM,
        interval: Some("1h".to_string()),
        ..SummaryArgs::default()
    };
    let out = extractor
        .summary_extract(&table, &TagSpec::names(["A"]), &windows)
        .await?;
    // two one-hour windows per event
    assert_eq!(out.num_rows(), 4);
    assert_eq!(out.value(0, "Value"), Some(&Value::Float(0.0)));
    assert_eq!(out.value(1, "Value"), Some(&Value::Float(20.0)));

    let filtered = SummaryArgs {
        filter_expression: Some("'A' > 15".to_string()),
        ..SummaryArgs::default()
    };
    let out = extractor
        .summary_extract(&table, &TagSpec::names(["A"]), &filtered)
        .await?;
    assert_eq!(out.num_rows(), 2);
    assert_eq!(out.value(0, "Value"), Some(&Value::Float(20.0)));
    assert_eq!(out.value(0, "Summary"), Some(&Value::from("AVERAGE")));
    Ok(())
}

#[tokio::test]
async fn test_source_failures_carry_context() -> anyhow::Result<()> {
    let mut source = plant()?;
    source.fail_tag("B");
    let table = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    let extractor = Extractor::new(Arc::new(source), Arc::new(EngineConfig::default()));

    let err = extractor
        .summary_extract(&table, &TagSpec::names(["A", "B"]), &SummaryArgs::default())
        .await
        .unwrap_err();
    match err {
        Error::DataSource { context, source } => {
            assert!(context.contains(r"\\srv\db\E1"), "{context}");
            assert!(matches!(source, SourceError::Other(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_tag_cache_is_shared_across_calls() -> anyhow::Result<()> {
    let source = plant()?;
    let table = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    let cache = Arc::new(TagCache::new());
    let extractor = Extractor::new(Arc::new(source), Arc::new(EngineConfig::default()))
        .with_cache(cache.clone());

    extractor
        .summary_extract(&table, &TagSpec::names(["A"]), &SummaryArgs::default())
        .await?;
    assert!(cache.get("A").is_some());
    cache.invalidate();
    assert!(cache.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_attribute_and_reference_columns() -> anyhow::Result<()> {
    let mut source = plant()?;
    source.set_attribute(r"\\srv\db\E1", "Volume", "12.5");
    source.set_attribute(r"\\srv\db\E2", "Volume", "7");
    source.fail_attribute(r"\\srv\db\E2", "Operator");
    source.set_attribute(r"\\srv\db\E1", "Operator", "kim");
    let config = EngineConfig::default();
    let mut table = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;

    let err = table
        .add_referenced_elements(&source, &Scope::Untemplated, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Empty(_)), "{err}");

    table
        .add_attributes(&source, &["Volume", "Operator"], &Scope::Untemplated, &config)
        .await?;
    assert_eq!(table.table().value(0, "Volume [None]"), Some(&Value::Float(12.5)));
    assert_eq!(table.table().value(1, "Volume [None]"), Some(&Value::Float(7.0)));
    assert_eq!(table.table().value(0, "Operator [None]"), Some(&Value::from("kim")));
    assert!(table.table().value(1, "Operator [None]").is_some_and(Value::is_null));

    source.add_reference(r"\\srv\db\E2", "Mixer 2");
    source.add_reference(r"\\srv\db\E2", "Pump 7");
    let width = table
        .add_referenced_elements(&source, &Scope::Untemplated, &config)
        .await?;
    assert_eq!(width, 2);
    assert_eq!(table.table().value(1, "Referenced_el [None](1)"), Some(&Value::from("Pump 7")));

    let err = table
        .add_attributes(&source, &["Volume"], &Scope::template("Reactor"), &config)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}
