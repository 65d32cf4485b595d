use afcondense::memory::parse_source_time;
use afcondense::{
    EngineConfig, HierarchyTable, MemoryDataSource, NodeKind, NodeQuery, Scope, Tabular, Value,
};
use arrow_schema::{DataType, TimeUnit};
use chrono::TimeZone;
use chrono_tz::Tz;

/// Two procedures, each with one unit holding two phases.
fn batches() -> anyhow::Result<MemoryDataSource> {
    let mut source = MemoryDataSource::new();
    source.set_now(parse_source_time("2022-03-01 00:00:00")?.and_utc());
    for (b, day) in [("R1", "01"), ("R2", "02")] {
        let root = format!(r"\\srv\db\{b}");
        source.add_event(
            &root,
            Some("Procedure"),
            &format!("2022-01-{day} 00:00:00"),
            Some(&format!("2022-01-{day} 12:00:00")),
        )?;
        let unit = format!(r"{root}\U1");
        source.add_event(
            &unit,
            Some("Unit"),
            &format!("2022-01-{day} 00:00:00"),
            Some(&format!("2022-01-{day} 12:00:00")),
        )?;
        for (phase, start, end) in [("P1", "00", "06"), ("P2", "06", "12")] {
            source.add_event(
                &format!(r"{unit}\{phase}"),
                Some("Phase"),
                &format!("2022-01-{day} {start}:00:00"),
                Some(&format!("2022-01-{day} {end}:00:00")),
            )?;
        }
    }
    Ok(source)
}

fn now() -> chrono::DateTime<Tz> {
    Tz::UTC.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap()
}

/// One procedure with two units holding two phases each: seven nodes.
fn one_procedure() -> anyhow::Result<MemoryDataSource> {
    let mut source = MemoryDataSource::new();
    source.set_now(parse_source_time("2022-03-01 00:00:00")?.and_utc());
    let root = r"\\srv\db\R1";
    source.add_event(root, Some("Procedure"), "2022-01-01 00:00:00", Some("2022-01-01 12:00:00"))?;
    for unit in ["U1", "U2"] {
        let unit = format!(r"{root}\{unit}");
        source.add_event(&unit, Some("Unit"), "2022-01-01 00:00:00", Some("2022-01-01 12:00:00"))?;
        for (phase, start, end) in [("P1", "00", "06"), ("P2", "06", "12")] {
            source.add_event(
                &format!(r"{unit}\{phase}"),
                Some("Phase"),
                &format!("2022-01-01 {start}:00:00"),
                Some(&format!("2022-01-01 {end}:00:00")),
            )?;
        }
    }
    Ok(source)
}

fn leaf_names(condensed: &afcondense::CondensedTable) -> anyhow::Result<Vec<String>> {
    Ok(condensed
        .table()
        .require("Name [2]")?
        .values
        .iter()
        .map(Value::to_string)
        .collect())
}

#[tokio::test]
async fn test_seven_nodes_condense_to_four_rows() -> anyhow::Result<()> {
    let source = one_procedure()?;
    let config = EngineConfig::default();
    let query = NodeQuery {
        kind: Some(NodeKind::Event),
        ..NodeQuery::named("R*")
    };
    let hierarchy = HierarchyTable::find(&source, &query, 2, &config).await?;
    assert_eq!(hierarchy.num_rows(), 7);
    assert_eq!(hierarchy.levels(), Some((0, 2)));

    let condensed = hierarchy.condense_at(now()).await?;
    assert_eq!(condensed.num_rows(), 4);
    assert_eq!(condensed.family("Name"), vec!["Name [0]", "Name [1]", "Name [2]"]);
    assert_eq!(leaf_names(&condensed)?, vec!["P1", "P2", "P1", "P2"]);
    assert_eq!(condensed.table().value(2, "Name [1]"), Some(&Value::from("U2")));
    Ok(())
}

#[tokio::test]
async fn test_two_procedures_condense_to_one_row_per_phase() -> anyhow::Result<()> {
    let source = batches()?;
    let config = EngineConfig::default();
    let query = NodeQuery {
        kind: Some(NodeKind::Event),
        ..NodeQuery::named("R*")
    };
    let hierarchy = HierarchyTable::find(&source, &query, 2, &config).await?;
    // 2 procedures, 2 units, 4 phases
    assert_eq!(hierarchy.num_rows(), 8);
    assert_eq!(hierarchy.levels(), Some((0, 2)));

    let condensed = hierarchy.condense_at(now()).await?;
    assert_eq!(condensed.num_rows(), 4);
    assert_eq!(condensed.family("Name"), vec!["Name [0]", "Name [1]", "Name [2]"]);
    assert_eq!(condensed.bottom_node_column(), Some("Node [2]"));
    assert_eq!(leaf_names(&condensed)?, vec!["P1", "P2", "P1", "P2"]);
    assert_eq!(condensed.table().value(2, "Name [0]"), Some(&Value::from("R2")));
    Ok(())
}

#[tokio::test]
async fn test_attribute_on_two_levels_keeps_both_values() -> anyhow::Result<()> {
    let mut source = MemoryDataSource::new();
    source.add_event(r"\\srv\db\B1", None, "2022-01-01 00:00:00", None)?;
    source.add_event(r"\\srv\db\B1\U1", None, "2022-01-01 01:00:00", None)?;
    source.add_event(r"\\srv\db\B1\U2", None, "2022-01-01 02:00:00", None)?;
    source.set_attribute(r"\\srv\db\B1", "Operator", "Alice");
    source.set_attribute(r"\\srv\db\B1\U1", "Operator", "Bob");
    let config = EngineConfig::default();
    let mut hierarchy = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    hierarchy
        .add_attributes(&source, &["Operator"], &Scope::Untemplated, &config)
        .await?;

    let condensed = hierarchy.condense_at(now()).await?;
    assert_eq!(condensed.num_rows(), 2);
    let t = condensed.table();
    for row in 0..2 {
        assert_eq!(t.value(row, "Operator [None]"), Some(&Value::from("Alice")));
    }
    assert_eq!(t.value(0, "Operator [None] [1]"), Some(&Value::from("Bob")));
    assert!(t.value(1, "Operator [None] [1]").is_some_and(Value::is_null));
    Ok(())
}

#[test]
fn test_levels_follow_path_depth() -> anyhow::Result<()> {
    let source = batches()?;
    let hierarchy = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    for node in hierarchy.nodes() {
        let separators = node.path().as_str().matches('\\').count();
        assert_eq!(node.level(), separators - 4, "{node}");
    }
    Ok(())
}

#[tokio::test]
async fn test_open_levels_inherit_root_end() -> anyhow::Result<()> {
    let mut source = MemoryDataSource::new();
    source.add_event(r"\\srv\db\B7", None, "2022-01-01 00:00:00", Some("2022-01-03 00:00:00"))?;
    source.add_event(r"\\srv\db\B7\U1", None, "2022-01-01 01:00:00", None)?;
    source.add_event(r"\\srv\db\B7\U1\Heat", None, "2022-01-01 02:00:00", None)?;
    source.add_event(r"\\srv\db\B7\U1\Cool", None, "2022-01-02 02:00:00", None)?;

    let condensed = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?
        .condense_at(now())
        .await?;
    assert_eq!(condensed.num_rows(), 2);
    let expected = Value::Time(Tz::UTC.with_ymd_and_hms(2022, 1, 3, 0, 0, 0).unwrap());
    for row in 0..condensed.num_rows() {
        for column in ["Endtime [0]", "Endtime [1]", "Endtime [2]"] {
            assert_eq!(condensed.table().value(row, column), Some(&expected), "{column} row {row}");
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_duplicate_paths_do_not_add_rows() -> anyhow::Result<()> {
    let mut source = batches()?;
    source.add_event(
        r"\\srv\db\R1\U1\P1",
        Some("Phase"),
        "2022-01-01 00:00:00",
        Some("2022-01-01 06:00:00"),
    )?;
    let hierarchy = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    assert_eq!(hierarchy.num_rows(), 8);
    assert_eq!(hierarchy.condense_at(now()).await?.num_rows(), 4);
    Ok(())
}

#[tokio::test]
async fn test_condensed_exports_to_arrow() -> anyhow::Result<()> {
    let source = batches()?;
    let tz = chrono_tz::America::Chicago;
    let condensed = HierarchyTable::from_nodes(source.nodes(), tz)?
        .condense_at(now().with_timezone(&tz))
        .await?;
    let batch = condensed.to_record_batch()?;
    assert_eq!(batch.num_rows(), 4);
    assert_eq!(batch.num_columns(), condensed.table().num_columns());

    let schema = batch.schema();
    assert_eq!(
        schema.field_with_name("Starttime [2]")?.data_type(),
        &DataType::Timestamp(TimeUnit::Microsecond, Some("America/Chicago".into()))
    );
    assert_eq!(schema.field_with_name("Name [1]")?.data_type(), &DataType::Utf8);
    assert_eq!(schema.field_with_name("Node [0]")?.data_type(), &DataType::Utf8);
    Ok(())
}

#[tokio::test]
async fn test_template_labels() -> anyhow::Result<()> {
    let source = batches()?;
    let condensed = HierarchyTable::from_nodes(source.nodes(), Tz::UTC)?;
    let condensed = afcondense::Condenser::new(afcondense::LevelLabel::Template)
        .condense_at(&condensed, now())
        .await?;
    assert_eq!(
        condensed.family("Name"),
        vec!["Name [Procedure]", "Name [Unit]", "Name [Phase]"]
    );
    Ok(())
}
