//! Pivot / cross-tab aggregation.
//!
//! Rows are grouped by the row keys and, when column keys are given,
//! cross-tabulated against the column-key combinations present in the data.
//! Each cell aggregates the value column; absent cells are filled with zero.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::data::model::{Column, Dataset, Value};
use crate::error::{EngineError, Result};

/// Separator used to flatten multi-level column headers.
const HEADER_SEPARATOR: &str = "_";

// ============================================================================
// SPEC
// ============================================================================

/// Aggregation applied to the value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    /// `Sum` for numeric value columns, `Count` otherwise.
    #[default]
    Auto,
    Sum,
    Count,
    Mean,
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggFunc::Auto => "auto",
            AggFunc::Sum => "sum",
            AggFunc::Count => "count",
            AggFunc::Mean => "mean",
        };
        f.write_str(name)
    }
}

impl FromStr for AggFunc {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AggFunc::Auto),
            "sum" => Ok(AggFunc::Sum),
            "count" => Ok(AggFunc::Count),
            "mean" | "average" => Ok(AggFunc::Mean),
            other => Err(EngineError::InvalidSpec(format!(
                "unknown aggregation function '{other}' (expected auto, sum, count or mean)"
            ))),
        }
    }
}

/// What to pivot: grouping keys, the aggregated column and the function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotSpec {
    pub row_keys: Vec<String>,
    #[serde(default)]
    pub col_keys: Vec<String>,
    pub value_column: String,
    #[serde(default)]
    pub agg_func: AggFunc,
}

impl PivotSpec {
    pub fn new<S: Into<String>>(
        row_keys: impl IntoIterator<Item = S>,
        value_column: impl Into<String>,
    ) -> Self {
        PivotSpec {
            row_keys: row_keys.into_iter().map(Into::into).collect(),
            col_keys: Vec::new(),
            value_column: value_column.into(),
            agg_func: AggFunc::Auto,
        }
    }

    pub fn with_col_keys<S: Into<String>>(
        mut self,
        col_keys: impl IntoIterator<Item = S>,
    ) -> Self {
        self.col_keys = col_keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agg(mut self, agg_func: AggFunc) -> Self {
        self.agg_func = agg_func;
        self
    }

    /// Reject malformed specs before any computation.
    pub fn validate(&self, dataset: &Dataset) -> Result<()> {
        if self.row_keys.is_empty() {
            return Err(EngineError::InvalidSpec(
                "rowKeys must name at least one column".to_string(),
            ));
        }
        if self.value_column.trim().is_empty() {
            return Err(EngineError::InvalidSpec(
                "valueColumn must name a column".to_string(),
            ));
        }
        for keys in [&self.row_keys, &self.col_keys] {
            let mut seen = BTreeSet::new();
            for key in keys {
                if !seen.insert(key.as_str()) {
                    return Err(EngineError::InvalidSpec(format!(
                        "column '{key}' is listed twice as a grouping key"
                    )));
                }
            }
        }
        for name in self
            .row_keys
            .iter()
            .chain(&self.col_keys)
            .chain(std::iter::once(&self.value_column))
        {
            dataset.require(name)?;
        }
        Ok(())
    }

    /// Concrete function for this dataset (`Auto` resolved).
    pub fn resolve_agg(&self, dataset: &Dataset) -> Result<AggFunc> {
        match self.agg_func {
            AggFunc::Auto => {
                let value = dataset.require(&self.value_column)?;
                Ok(if value.is_numeric() {
                    AggFunc::Sum
                } else {
                    AggFunc::Count
                })
            }
            explicit => Ok(explicit),
        }
    }
}

// ============================================================================
// CALCULATION
// ============================================================================

/// Running aggregate of one grid cell.
#[derive(Debug, Default, Clone)]
struct CellAcc {
    observed: usize,
    int_total: i128,
    float_total: f64,
}

/// A grouping column and how its cells become key parts.
struct KeyColumn<'a> {
    column: &'a Column,
    /// Mixed-type columns group by canonical text, so `1234` and `"1234"`
    /// share one group.
    as_text: bool,
}

impl<'a> KeyColumn<'a> {
    fn new(column: &'a Column) -> Self {
        KeyColumn {
            column,
            as_text: column.kinds().len() > 1,
        }
    }

    /// Missing values have no group; multi-valued cells are flattened to
    /// text so they compare as scalars.
    fn key_part(&self, row: usize, separator: &str) -> Option<Value> {
        match self.column.get(row) {
            Value::Null => None,
            list @ Value::List(_) => list.to_text(separator).map(Value::String),
            other if self.as_text => other.to_text(separator).map(Value::String),
            other => Some(other.clone()),
        }
    }
}

fn row_key(columns: &[KeyColumn<'_>], row: usize, separator: &str) -> Option<Vec<Value>> {
    columns.iter().map(|c| c.key_part(row, separator)).collect()
}

/// Build the cross-tab for `spec`. Fails without a partial result.
///
/// List cells in key columns are joined with `config.list_separator`.
pub fn pivot(dataset: &Dataset, spec: &PivotSpec, config: &EngineConfig) -> Result<Dataset> {
    spec.validate(dataset)?;
    let func = spec.resolve_agg(dataset)?;
    let separator = config.list_separator.as_str();

    let row_cols: Vec<KeyColumn<'_>> = spec
        .row_keys
        .iter()
        .map(|k| dataset.require(k).map(KeyColumn::new))
        .collect::<Result<_>>()?;
    let col_cols: Vec<KeyColumn<'_>> = spec
        .col_keys
        .iter()
        .map(|k| dataset.require(k).map(KeyColumn::new))
        .collect::<Result<_>>()?;
    let value = dataset.require(&spec.value_column)?;

    // Integer sums stay integers unless a float contributes.
    let integral = value.values().iter().all(|v| !matches!(v, Value::Float(_)));

    let mut grid: BTreeMap<Vec<Value>, BTreeMap<Vec<Value>, CellAcc>> = BTreeMap::new();
    let mut col_combos: BTreeSet<Vec<Value>> = BTreeSet::new();
    let mut dropped = 0usize;

    for row in 0..dataset.num_rows() {
        let (Some(rk), Some(ck)) = (
            row_key(&row_cols, row, separator),
            row_key(&col_cols, row, separator),
        ) else {
            dropped += 1;
            continue;
        };
        col_combos.insert(ck.clone());
        let cell = grid.entry(rk).or_default().entry(ck).or_default();

        let v = value.get(row);
        if v.is_null() {
            continue;
        }
        cell.observed += 1;
        if func == AggFunc::Count {
            continue;
        }
        match v {
            Value::Integer(i) => {
                cell.int_total += i128::from(*i);
                cell.float_total += *i as f64;
            }
            Value::Float(f) => cell.float_total += f,
            other => {
                return Err(EngineError::computation(
                    &[spec.value_column.as_str()],
                    format!("cannot {func} non-numeric value '{other}'"),
                ));
            }
        }
    }

    if dropped > 0 {
        log::debug!("Pivot ignored {dropped} row(s) with a missing grouping key");
    }

    let finalize = |acc: Option<&CellAcc>| -> Result<Value> {
        let Some(acc) = acc else {
            return Ok(zero(func, integral));
        };
        match func {
            AggFunc::Count => Ok(Value::Integer(acc.observed as i64)),
            AggFunc::Sum if integral => i64::try_from(acc.int_total)
                .map(Value::Integer)
                .map_err(|_| {
                    EngineError::computation(&[spec.value_column.as_str()], "integer sum overflows")
                }),
            AggFunc::Sum => Ok(Value::Float(acc.float_total)),
            AggFunc::Mean if acc.observed == 0 => Ok(Value::Float(0.0)),
            AggFunc::Mean => Ok(Value::Float(acc.float_total / acc.observed as f64)),
            AggFunc::Auto => unreachable!("auto resolved before aggregation"),
        }
    };

    // Output: one column per row key, then one per column-key combination.
    let mut columns: Vec<Column> = spec
        .row_keys
        .iter()
        .enumerate()
        .map(|(i, name)| Column::new(name.as_str(), grid.keys().map(|k| k[i].clone()).collect()))
        .collect();

    let headers: Vec<(String, Vec<Value>)> = if spec.col_keys.is_empty() {
        // A value column that is also a row key gets a suffixed header.
        let header = if spec.row_keys.contains(&spec.value_column) {
            format!("{}{HEADER_SEPARATOR}{func}", spec.value_column)
        } else {
            spec.value_column.clone()
        };
        vec![(header, Vec::new())]
    } else {
        col_combos
            .into_iter()
            .map(|combo| (flatten_header(&combo), combo))
            .collect()
    };

    for (header, combo) in &headers {
        let values = grid
            .values()
            .map(|cells| finalize(cells.get(combo)))
            .collect::<Result<Vec<_>>>()?;
        columns.push(Column::new(header.as_str(), values));
    }

    let result = Dataset::new(columns).map_err(|e| {
        let mut involved: Vec<&str> = spec.row_keys.iter().map(String::as_str).collect();
        involved.extend(spec.col_keys.iter().map(String::as_str));
        EngineError::computation(&involved, e.to_string())
    })?;

    log::info!(
        "Pivot on {:?} x {:?} ({func} of '{}'): {} row(s), {} column(s)",
        spec.row_keys,
        spec.col_keys,
        spec.value_column,
        result.num_rows(),
        result.num_columns()
    );
    Ok(result)
}

fn zero(func: AggFunc, integral: bool) -> Value {
    match func {
        AggFunc::Count => Value::Integer(0),
        AggFunc::Sum if integral => Value::Integer(0),
        AggFunc::Sum | AggFunc::Mean | AggFunc::Auto => Value::Float(0.0),
    }
}

/// Join the level values of a column-key combination into one header.
pub fn flatten_header(levels: &[Value]) -> String {
    levels
        .iter()
        .map(|v| v.to_text(",").unwrap_or_default())
        .collect::<Vec<_>>()
        .join(HEADER_SEPARATOR)
}
