use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    DataType, Date32Type, Date64Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type,
    Int8Type, TimeUnit, TimestampMicrosecondType, TimestampMillisecondType,
    TimestampNanosecondType, TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value as JsonValue;

use super::model::{Column, Dataset, Value};
use crate::config::EngineConfig;
use crate::engine::geo::validate_reference;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a tabular dataset from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.csv`     – header row plus data rows
/// * `.json`    – `[{ "col": value, ... }, ...]`
/// * `.parquet` – any flat schema; list columns become multi-valued cells
pub fn load_file(path: &Path) -> Result<Dataset> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let dataset = match ext.as_str() {
        "csv" => load_csv(path),
        "json" => load_json(path),
        "parquet" | "pq" => load_parquet(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::info!(
        "Loaded {} row(s) with columns {:?} from {}",
        dataset.num_rows(),
        dataset.column_names(),
        path.display()
    );
    Ok(dataset)
}

/// Load the geographic reference table, retrying a bounded number of times.
///
/// Any failure after the last attempt (missing file, parse error, missing
/// `zip` / latitude / longitude columns) is `ReferenceUnavailable`.
pub fn load_reference(
    path: &Path,
    config: &EngineConfig,
) -> std::result::Result<Dataset, EngineError> {
    let attempts = config.reference_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match load_file(path) {
            Ok(dataset) => {
                return validate_reference(&dataset)
                    .map(|()| dataset)
                    .map_err(|e| EngineError::ReferenceUnavailable(e.to_string()));
            }
            Err(e) => {
                log::warn!("Reference load attempt {attempt}/{attempts} failed: {e:#}");
                last_error = format!("{e:#}");
                if attempt < attempts {
                    std::thread::sleep(Duration::from_millis(config.reference_retry_delay_ms));
                }
            }
        }
    }

    Err(EngineError::ReferenceUnavailable(format!(
        "{} after {attempts} attempt(s): {last_error}",
        path.display()
    )))
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

fn load_csv(path: &Path) -> Result<Dataset> {
    let file = std::fs::File::open(path).context("opening CSV")?;
    read_csv(file)
}

/// CSV layout: header row with column names, one record per row.
///
/// Empty cells are missing. A column whose non-empty cells are all numbers
/// becomes an integer column (or float, if any cell has a fraction); any
/// other column keeps a per-cell guess, so text mixed with numbers stays
/// visible as a mixed-type column.
pub fn read_csv<R: Read>(input: R) -> Result<Dataset> {
    let mut reader = csv::Reader::from_reader(input);
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        bail!("No columns to parse from file");
    }

    let mut cells: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        for (col_idx, slot) in cells.iter_mut().enumerate() {
            slot.push(record.get(col_idx).unwrap_or("").to_string());
        }
    }

    let columns = headers
        .iter()
        .zip(cells)
        .map(|(name, raw)| Column::new(name.as_str(), infer_column(&raw)))
        .collect();
    Ok(Dataset::new(columns)?)
}

fn infer_column(raw: &[String]) -> Vec<Value> {
    let mut values: Vec<Value> = raw.iter().map(|s| guess_value_type(s)).collect();

    let all_numeric = values
        .iter()
        .all(|v| matches!(v, Value::Null | Value::Integer(_) | Value::Float(_)));
    let any_float = values.iter().any(|v| matches!(v, Value::Float(_)));
    if all_numeric && any_float {
        for v in values.iter_mut() {
            if let Value::Integer(i) = v {
                *v = Value::Float(*i as f64);
            }
        }
    }
    values
}

fn guess_value_type(s: &str) -> Value {
    if s.trim().is_empty() {
        return Value::Null;
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::float(f);
    }
    if s == "true" || s == "false" {
        return Value::Bool(s == "true");
    }
    Value::String(s.to_string())
}

// ---------------------------------------------------------------------------
// JSON loader
// ---------------------------------------------------------------------------

/// Expected JSON schema (records-oriented, the default `df.to_json(orient='records')`):
///
/// ```json
/// [
///   { "zip": 1234, "enrolled": "Yes", "tags": ["a", "b"] },
///   ...
/// ]
/// ```
///
/// Keys missing from a record are missing cells.
fn load_json(path: &Path) -> Result<Dataset> {
    let text = std::fs::read_to_string(path).context("reading JSON file")?;
    parse_json_records(&text)
}

pub fn parse_json_records(text: &str) -> Result<Dataset> {
    let root: JsonValue = serde_json::from_str(text).context("parsing JSON")?;
    let records = root.as_array().context("Expected top-level JSON array")?;

    let mut names: Vec<String> = Vec::new();
    let mut objects = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        let obj = rec
            .as_object()
            .with_context(|| format!("Row {i} is not a JSON object"))?;
        for key in obj.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
        objects.push(obj);
    }

    if names.is_empty() {
        bail!("No columns to parse from file");
    }

    let columns = names
        .iter()
        .map(|name| {
            let values = objects
                .iter()
                .map(|obj| obj.get(name).map(json_to_value).unwrap_or(Value::Null))
                .collect();
            Column::new(name.as_str(), values)
        })
        .collect();
    Ok(Dataset::new(columns)?)
}

fn json_to_value(val: &JsonValue) -> Value {
    match val {
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Value::float(f)
            } else {
                Value::String(n.to_string())
            }
        }
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Null => Value::Null,
        JsonValue::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
        other => Value::String(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file into a dataset, one column per schema field.
///
/// Works with files written by both **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<Dataset> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(file).context("reading parquet metadata")?;
    let names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder.build().context("building parquet reader")?;

    let mut cells: Vec<Vec<Value>> = vec![Vec::new(); names.len()];
    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        for (col_idx, slot) in cells.iter_mut().enumerate() {
            let array = batch.column(col_idx);
            slot.extend((0..batch.num_rows()).map(|row| extract_value(array, row)));
        }
    }

    let columns = names
        .iter()
        .zip(cells)
        .map(|(name, values)| Column::new(name.as_str(), values))
        .collect();
    Ok(Dataset::new(columns)?)
}

// -- Arrow helpers --

fn list_values(values: ArrayRef) -> Value {
    Value::List((0..values.len()).map(|i| extract_value(&values, i)).collect())
}

/// Extract a single cell from an Arrow column at a given row.
fn extract_value(col: &ArrayRef, row: usize) -> Value {
    if col.is_null(row) {
        return Value::Null;
    }
    match col.data_type() {
        DataType::Utf8 => Value::String(col.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(col.as_string::<i64>().value(row).to_string()),
        DataType::Int8 => Value::Integer(i64::from(col.as_primitive::<Int8Type>().value(row))),
        DataType::Int16 => Value::Integer(i64::from(col.as_primitive::<Int16Type>().value(row))),
        DataType::Int32 => Value::Integer(i64::from(col.as_primitive::<Int32Type>().value(row))),
        DataType::Int64 => Value::Integer(col.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::Integer(i64::from(col.as_primitive::<UInt8Type>().value(row))),
        DataType::UInt16 => Value::Integer(i64::from(col.as_primitive::<UInt16Type>().value(row))),
        DataType::UInt32 => Value::Integer(i64::from(col.as_primitive::<UInt32Type>().value(row))),
        DataType::UInt64 => {
            let v = col.as_primitive::<UInt64Type>().value(row);
            i64::try_from(v)
                .map(Value::Integer)
                .unwrap_or(Value::Float(v as f64))
        }
        DataType::Float32 => Value::float(f64::from(col.as_primitive::<Float32Type>().value(row))),
        DataType::Float64 => Value::float(col.as_primitive::<Float64Type>().value(row)),
        DataType::Boolean => Value::Bool(col.as_boolean().value(row)),
        DataType::Date32 => Value::from(col.as_primitive::<Date32Type>().value_as_datetime(row)),
        DataType::Date64 => Value::from(col.as_primitive::<Date64Type>().value_as_datetime(row)),
        DataType::Timestamp(unit, _) => Value::from(match unit {
            TimeUnit::Second => col.as_primitive::<TimestampSecondType>().value_as_datetime(row),
            TimeUnit::Millisecond => col
                .as_primitive::<TimestampMillisecondType>()
                .value_as_datetime(row),
            TimeUnit::Microsecond => col
                .as_primitive::<TimestampMicrosecondType>()
                .value_as_datetime(row),
            TimeUnit::Nanosecond => col
                .as_primitive::<TimestampNanosecondType>()
                .value_as_datetime(row),
        }),
        DataType::List(_) => list_values(col.as_list::<i32>().value(row)),
        DataType::LargeList(_) => list_values(col.as_list::<i64>().value(row)),
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::ValueKind;
    use std::collections::BTreeSet;

    #[test]
    fn csv_columns_are_inferred_per_column() {
        let text = "zip,amount,ratio,flag\n01234,10,1,true\nABC,,2.5,false\n75001,7,3,true\n";
        let ds = read_csv(text.as_bytes()).unwrap();

        assert_eq!(ds.column_names(), vec!["zip", "amount", "ratio", "flag"]);
        assert_eq!(
            ds.column("zip").unwrap().kinds(),
            BTreeSet::from([ValueKind::Integer, ValueKind::String])
        );
        assert_eq!(
            ds.column("amount").unwrap().values(),
            &[Value::Integer(10), Value::Null, Value::Integer(7)]
        );
        // One fractional cell widens the whole column.
        assert_eq!(
            ds.column("ratio").unwrap().values(),
            &[Value::Float(1.0), Value::Float(2.5), Value::Float(3.0)]
        );
        assert_eq!(ds.column("flag").unwrap().get(1), &Value::Bool(false));
    }

    #[test]
    fn empty_csv_has_no_columns() {
        let err = read_csv("".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("No columns to parse"));
    }

    #[test]
    fn json_records_fill_missing_keys() {
        let text = r#"[{"zip": 1234, "tags": ["a", "b"]}, {"zip": "01234", "extra": null}]"#;
        let ds = parse_json_records(text).unwrap();
        assert_eq!(ds.num_rows(), 2);
        assert_eq!(
            ds.column("tags").unwrap().values(),
            &[Value::List(vec!["a".into(), "b".into()]), Value::Null]
        );
        assert_eq!(ds.column("extra").unwrap().get(0), &Value::Null);
        assert_eq!(ds.column("zip").unwrap().kinds().len(), 2);
    }

    #[test]
    fn reference_failure_is_classified() {
        let config = EngineConfig {
            reference_attempts: 2,
            reference_retry_delay_ms: 0,
            ..EngineConfig::default()
        };
        let err = load_reference(Path::new("/nonexistent/zips.csv"), &config).unwrap_err();
        assert!(matches!(err, EngineError::ReferenceUnavailable(_)));
    }
}
