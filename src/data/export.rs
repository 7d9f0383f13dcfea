use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMillisecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use parquet::arrow::ArrowWriter;
use serde_json::Value as JsonValue;

use super::model::{Column, Dataset, DeclaredType, Value, ValueKind};

// ---------------------------------------------------------------------------
// Arrow conversion
// ---------------------------------------------------------------------------

/// Arrow type a column is exported as. Mixed columns fall back to text.
fn arrow_type(col: &Column) -> DataType {
    let kinds = col.kinds();
    if kinds.is_empty() {
        return match col.declared() {
            Some(DeclaredType::NumericInteger) => DataType::Int64,
            Some(DeclaredType::NumericFloat) => DataType::Float64,
            Some(DeclaredType::Datetime) => DataType::Timestamp(TimeUnit::Millisecond, None),
            Some(DeclaredType::String) | None => DataType::Utf8,
        };
    }
    let only = |allowed: &[ValueKind]| kinds.iter().all(|k| allowed.contains(k));
    if only(&[ValueKind::Integer]) {
        DataType::Int64
    } else if only(&[ValueKind::Integer, ValueKind::Float]) {
        DataType::Float64
    } else if only(&[ValueKind::Bool]) {
        DataType::Boolean
    } else if only(&[ValueKind::DateTime]) {
        DataType::Timestamp(TimeUnit::Millisecond, None)
    } else {
        DataType::Utf8
    }
}

fn to_array(col: &Column, data_type: &DataType) -> ArrayRef {
    let values = col.values();
    match data_type {
        DataType::Int64 => Arc::new(Int64Array::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Integer(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values.iter().map(Value::as_f64).collect::<Vec<_>>(),
        )),
        DataType::Boolean => Arc::new(BooleanArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        DataType::Timestamp(_, _) => Arc::new(TimestampMillisecondArray::from(
            values
                .iter()
                .map(|v| match v {
                    Value::DateTime(d) => Some(d.and_utc().timestamp_millis()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(
            values.iter().map(|v| v.to_text(",")).collect::<Vec<_>>(),
        )),
    }
}

/// Convert a dataset into a single Arrow record batch.
pub fn to_record_batch(dataset: &Dataset) -> Result<RecordBatch> {
    if dataset.num_columns() == 0 {
        bail!("dataset has no columns");
    }
    let mut fields = Vec::with_capacity(dataset.num_columns());
    let mut arrays = Vec::with_capacity(dataset.num_columns());
    for col in dataset.columns() {
        let data_type = arrow_type(col);
        arrays.push(to_array(col, &data_type));
        fields.push(Field::new(col.name(), data_type, true));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("building record batch")
}

/// Render a dataset as a text table.
pub fn pretty_format(dataset: &Dataset) -> Result<String> {
    let batch = to_record_batch(dataset)?;
    Ok(pretty_format_batches(&[batch])
        .context("formatting table")?
        .to_string())
}

// ---------------------------------------------------------------------------
// File writers
// ---------------------------------------------------------------------------

/// Write a dataset to `.csv`, `.json` (records) or `.parquet`, by extension.
pub fn write_file(dataset: &Dataset, path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "csv" => write_csv(dataset, path),
        "json" => write_json(dataset, path),
        "parquet" | "pq" => write_parquet(dataset, path),
        other => bail!("Unsupported output extension: .{other}"),
    }
    .with_context(|| format!("writing {}", path.display()))?;

    log::info!("Wrote {} row(s) to {}", dataset.num_rows(), path.display());
    Ok(())
}

fn write_csv(dataset: &Dataset, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).context("creating CSV")?;
    writer.write_record(dataset.column_names())?;
    for row in 0..dataset.num_rows() {
        writer.write_record(
            dataset
                .row(row)
                .into_iter()
                .map(|v| v.to_text(",").unwrap_or_default()),
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Integer(i) => JsonValue::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::DateTime(_) => value.to_text(",").map(JsonValue::String).unwrap_or_default(),
        Value::List(items) => JsonValue::Array(items.iter().map(value_to_json).collect()),
    }
}

/// Records-oriented JSON, the shape `load_file` reads back.
pub fn to_json_records(dataset: &Dataset) -> JsonValue {
    let names = dataset.column_names();
    JsonValue::Array(
        (0..dataset.num_rows())
            .map(|row| {
                let record = names
                    .iter()
                    .zip(dataset.row(row))
                    .map(|(name, v)| (name.to_string(), value_to_json(v)))
                    .collect::<serde_json::Map<_, _>>();
                JsonValue::Object(record)
            })
            .collect(),
    )
}

fn write_json(dataset: &Dataset, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path).context("creating JSON file")?;
    serde_json::to_writer_pretty(file, &to_json_records(dataset)).context("serializing JSON")?;
    Ok(())
}

fn write_parquet(dataset: &Dataset, path: &Path) -> Result<()> {
    let batch = to_record_batch(dataset)?;
    let file = std::fs::File::create(path).context("creating parquet file")?;
    let mut writer =
        ArrowWriter::try_new(file, batch.schema(), None).context("creating parquet writer")?;
    writer.write(&batch).context("writing parquet batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_map_to_arrow_types() {
        let ds = Dataset::from_rows(
            &["i", "f", "mixed", "b"],
            vec![
                vec![1i64.into(), 1i64.into(), 1i64.into(), true.into()],
                vec![Value::Null, 2.5f64.into(), "x".into(), Value::Null],
            ],
        )
        .unwrap();
        let batch = to_record_batch(&ds).unwrap();
        let schema = batch.schema();
        let types: Vec<_> = schema.fields().iter().map(|f| f.data_type().clone()).collect();
        assert_eq!(
            types,
            vec![DataType::Int64, DataType::Float64, DataType::Utf8, DataType::Boolean]
        );
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn pretty_table_contains_headers_and_cells() {
        let ds =
            Dataset::from_rows(&["zip", "CA"], vec![vec!["1234".into(), 1i64.into()]]).unwrap();
        let table = pretty_format(&ds).unwrap();
        assert!(table.contains("zip"));
        assert!(table.contains("1234"));
    }

    #[test]
    fn json_records_keep_nulls() {
        let ds = Dataset::from_rows(&["a"], vec![vec![Value::Null], vec![2.0f64.into()]]).unwrap();
        let json = to_json_records(&ds);
        assert_eq!(json, serde_json::json!([{ "a": null }, { "a": 2.0 }]));
    }
}
