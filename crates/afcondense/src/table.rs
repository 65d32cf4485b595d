//! Column-oriented table shared by every stage of the engine
//!
//! A [`Table`] is a list of equally long named columns of [`Value`]s, which
//! lets node handles travel with the rows. Relational work happens on Arrow
//! batches: [`Table::to_record_batch`] and [`Table::from_record_batch`] cross
//! between the two.

use crate::error::{Error, Result};
use crate::value::Value;
use arrow_array::builder::{
    BooleanBuilder, Float64Builder, Int64Builder, StringBuilder, TimestampMicrosecondBuilder,
};
use arrow::compute::cast;
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{Array, ArrayRef, RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    #[must_use]
    pub fn is_all_null(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }

    fn take(&self, rows: &[usize]) -> Column {
        Column {
            name: self.name.clone(),
            values: rows.iter().map(|&i| self.values[i].clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    /// A table with `rows` rows and no columns yet.
    #[must_use]
    pub fn with_rows(rows: usize) -> Self {
        Self {
            columns: Vec::new(),
            rows,
        }
    }

    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        let rows = columns.first().map_or(0, |c| c.values.len());
        let mut table = Self::with_rows(rows);
        for column in columns {
            table.push_column(column)?;
        }
        Ok(table)
    }

    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    #[must_use]
    pub fn into_columns(self) -> Vec<Column> {
        self.columns
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Like [`Table::column`] but a missing column is an error.
    pub fn require(&self, name: &str) -> Result<&Column> {
        self.column(name).ok_or_else(|| Error::column_not_found(name))
    }

    #[must_use]
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        self.column(name).and_then(|c| c.values.get(row))
    }

    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if self.position(&column.name).is_some() {
            return Err(Error::invalid_shape(format!("duplicate column '{}'", column.name)));
        }
        if self.columns.is_empty() && self.rows == 0 {
            self.rows = column.values.len();
        }
        if column.values.len() != self.rows {
            return Err(Error::invalid_shape(format!(
                "column '{}' has {} rows, table has {}",
                column.name,
                column.values.len(),
                self.rows
            )));
        }
        self.columns.push(column);
        Ok(())
    }

    /// Replace a column of the same name in place, or append it.
    pub fn set_column(&mut self, column: Column) -> Result<()> {
        match self.position(&column.name) {
            Some(i) if column.values.len() == self.rows => {
                self.columns[i] = column;
                Ok(())
            }
            Some(_) => Err(Error::invalid_shape(format!(
                "column '{}' has {} rows, table has {}",
                column.name,
                column.values.len(),
                self.rows
            ))),
            None => self.push_column(column),
        }
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn drop_column(&mut self, name: &str) -> Option<Column> {
        let i = self.position(name)?;
        Some(self.columns.remove(i))
    }

    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        if from != to && self.position(to).is_some() {
            return Err(Error::invalid_shape(format!("duplicate column '{to}'")));
        }
        let column = self
            .column_mut(from)
            .ok_or_else(|| Error::column_not_found(from))?;
        column.name = to.to_string();
        Ok(())
    }

    /// New table holding `rows` in the given order.
    #[must_use]
    pub fn take_rows(&self, rows: &[usize]) -> Table {
        Table {
            columns: self.columns.iter().map(|c| c.take(rows)).collect(),
            rows: rows.len(),
        }
    }

    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> Table {
        let end = (offset + len).min(self.rows);
        let rows: Vec<usize> = (offset.min(end)..end).collect();
        self.take_rows(&rows)
    }

    /// Drop columns whose every value is missing, except those `keep` accepts.
    /// Returns the dropped names.
    pub fn drop_all_null_columns<F: Fn(&str) -> bool>(&mut self, keep: F) -> Vec<String> {
        let mut dropped = Vec::new();
        self.columns.retain(|c| {
            if c.is_all_null() && !keep(&c.name) {
                dropped.push(c.name.clone());
                false
            } else {
                true
            }
        });
        dropped
    }

    /// Stack tables vertically. Columns are the union in first-seen order;
    /// cells a table lacks are missing.
    #[must_use]
    pub fn concat(tables: &[Table]) -> Table {
        let mut names: Vec<String> = Vec::new();
        for table in tables {
            for c in &table.columns {
                if !names.contains(&c.name) {
                    names.push(c.name.clone());
                }
            }
        }
        let rows: usize = tables.iter().map(Table::num_rows).sum();
        let columns = names
            .into_iter()
            .map(|name| {
                let mut values = Vec::with_capacity(rows);
                for table in tables {
                    match table.column(&name) {
                        Some(c) => values.extend(c.values.iter().cloned()),
                        None => values.extend(std::iter::repeat_n(Value::Null, table.rows)),
                    }
                }
                Column { name, values }
            })
            .collect();
        Table { columns, rows }
    }

    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let array = column_to_array(&column.values);
            fields.push(Field::new(&column.name, array.data_type().clone(), true));
            arrays.push(array);
        }
        let options = RecordBatchOptions::new().with_row_count(Some(self.rows));
        let batch = RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)?;
        Ok(batch)
    }

    /// Read a batch back into cells. Timestamps without a parsable zone use `tz`.
    pub fn from_record_batch(batch: &RecordBatch, tz: Tz) -> Result<Table> {
        let mut table = Table::with_rows(batch.num_rows());
        for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
            table.push_column(Column::new(field.name(), array_values(array, tz)?))?;
        }
        Ok(table)
    }
}

/// Cells of one Arrow column. Types the engine never writes are read as text.
pub fn array_values(array: &ArrayRef, tz: Tz) -> Result<Vec<Value>> {
    let cell = |i: usize| !array.is_null(i);
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => {
            let a = array.as_boolean();
            (0..a.len()).map(|i| Value::from(cell(i).then(|| a.value(i)))).collect()
        }
        DataType::Int64 => {
            let a = array.as_primitive::<Int64Type>();
            (0..a.len()).map(|i| Value::from(cell(i).then(|| a.value(i)))).collect()
        }
        DataType::Float64 => {
            let a = array.as_primitive::<Float64Type>();
            (0..a.len()).map(|i| Value::from(cell(i).then(|| a.value(i)))).collect()
        }
        DataType::Utf8 => {
            let a = array.as_string::<i32>();
            (0..a.len()).map(|i| Value::from(cell(i).then(|| a.value(i)))).collect()
        }
        DataType::Timestamp(TimeUnit::Microsecond, zone) => {
            let zone = zone
                .as_deref()
                .and_then(|z| z.parse::<Tz>().ok())
                .unwrap_or(tz);
            let a = array.as_primitive::<TimestampMicrosecondType>();
            (0..a.len())
                .map(|i| {
                    let t = cell(i)
                        .then(|| DateTime::<Utc>::from_timestamp_micros(a.value(i)))
                        .flatten();
                    Value::from(t.map(|t| t.with_timezone(&zone)))
                })
                .collect()
        }
        _ => {
            let text = cast(array, &DataType::Utf8)?;
            return array_values(&text, tz);
        }
    };
    Ok(values)
}

fn column_to_array(values: &[Value]) -> ArrayRef {
    let present = || values.iter().filter(|v| !v.is_null());
    let any_present = present().next().is_some();

    if any_present && present().all(|v| matches!(v, Value::Int(_))) {
        let mut b = Int64Builder::with_capacity(values.len());
        for v in values {
            match v {
                Value::Int(i) => b.append_value(*i),
                _ => b.append_null(),
            }
        }
        return Arc::new(b.finish());
    }
    if any_present && present().all(|v| matches!(v, Value::Int(_) | Value::Float(_))) {
        let mut b = Float64Builder::with_capacity(values.len());
        for v in values {
            b.append_option(if v.is_null() { None } else { v.as_f64() });
        }
        return Arc::new(b.finish());
    }
    if any_present && present().all(|v| matches!(v, Value::Bool(_))) {
        let mut b = BooleanBuilder::with_capacity(values.len());
        for v in values {
            match v {
                Value::Bool(x) => b.append_value(*x),
                _ => b.append_null(),
            }
        }
        return Arc::new(b.finish());
    }
    if any_present && present().all(|v| matches!(v, Value::Time(_))) {
        let tz = present()
            .find_map(Value::as_time)
            .map(|t| t.timezone().name().to_string())
            .unwrap_or_else(|| "UTC".to_string());
        let mut b = TimestampMicrosecondBuilder::with_capacity(values.len());
        for v in values {
            match v {
                Value::Time(t) => b.append_value(t.timestamp_micros()),
                _ => b.append_null(),
            }
        }
        return Arc::new(b.finish().with_timezone(tz));
    }

    let mut b = StringBuilder::new();
    for v in values {
        if v.is_null() {
            b.append_null();
        } else {
            b.append_value(v.to_string());
        }
    }
    Arc::new(b.finish())
}

/// Shared read access for every table-shaped value the engine returns.
pub trait Tabular {
    fn table(&self) -> &Table;

    fn num_rows(&self) -> usize {
        self.table().num_rows()
    }

    fn column_names(&self) -> Vec<&str> {
        self.table().column_names()
    }

    fn to_record_batch(&self) -> Result<RecordBatch> {
        self.table().to_record_batch()
    }
}

impl Tabular for Table {
    fn table(&self) -> &Table {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn text(values: &[Option<&str>]) -> Vec<Value> {
        values.iter().map(|v| Value::from(*v)).collect()
    }

    fn table(cols: Vec<(&str, Vec<Value>)>) -> Table {
        Table::from_columns(cols.into_iter().map(|(n, v)| Column::new(n, v)).collect()).unwrap()
    }

    #[test]
    fn test_push_column_checks_shape() {
        let mut t = table(vec![("a", text(&[Some("x"), Some("y")]))]);
        assert!(matches!(
            t.push_column(Column::new("b", text(&[Some("x")]))),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(
            t.push_column(Column::new("a", text(&[Some("x"), None]))),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(t.require("zz"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_concat_unions_columns() {
        let a = table(vec![("x", text(&[Some("1")]))]);
        let b = table(vec![("y", text(&[Some("2"), Some("3")])), ("x", text(&[None, Some("4")]))]);
        let c = Table::concat(&[a, b]);
        assert_eq!(c.column_names(), vec!["x", "y"]);
        assert_eq!(c.num_rows(), 3);
        assert!(c.column("y").unwrap().values[0].is_null());
        assert_eq!(c.column("x").unwrap().values[2], Value::from("4"));
    }

    #[test]
    fn test_record_batch_types() {
        let tz: Tz = "Europe/Brussels".parse().unwrap();
        let t0 = tz.with_ymd_and_hms(2022, 7, 1, 12, 0, 0).unwrap();
        let t = table(vec![
            ("f", vec![Value::Float(1.5), Value::Int(2), Value::Null]),
            ("i", vec![Value::Int(1), Value::Null, Value::Int(3)]),
            ("t", vec![Value::Time(t0), Value::Null, Value::Time(t0)]),
            ("s", vec![Value::from("x"), Value::Int(1), Value::Null]),
        ]);
        let batch = t.to_record_batch().unwrap();
        let schema = batch.schema();
        assert_eq!(schema.field(0).data_type(), &DataType::Float64);
        assert_eq!(schema.field(1).data_type(), &DataType::Int64);
        assert_eq!(
            schema.field(2).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("Europe/Brussels".into()))
        );
        assert_eq!(schema.field(3).data_type(), &DataType::Utf8);
        assert_eq!(batch.column(3).null_count(), 1);
        assert_eq!(batch.num_rows(), 3);
    }

    #[test]
    fn test_record_batch_reads_back_into_cells() {
        let tz: Tz = "Europe/Brussels".parse().unwrap();
        let t0 = tz.with_ymd_and_hms(2022, 7, 1, 12, 0, 0).unwrap();
        let t = table(vec![
            ("i", vec![Value::Int(1), Value::Null]),
            ("t", vec![Value::Null, Value::Time(t0)]),
            ("s", vec![Value::from("x"), Value::Null]),
        ]);
        let back = Table::from_record_batch(&t.to_record_batch().unwrap(), Tz::UTC).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.value(1, "t").and_then(Value::as_time).map(|t| t.timezone()), Some(tz));
    }

    #[test]
    fn test_record_batch_without_columns() {
        let batch = Table::with_rows(4).to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.num_columns(), 0);
    }
}
