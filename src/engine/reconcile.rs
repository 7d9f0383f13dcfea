//! Mixed-type detection and per-column type coercion.

use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::config::EngineConfig;
use crate::data::model::{Column, ColumnTypeSpec, Dataset, DeclaredType, Value, ValueKind};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// A column whose non-missing cells carry more than one runtime type.
#[derive(Debug, Clone, PartialEq)]
pub struct MixedColumn {
    pub name: String,
    pub kinds: BTreeSet<ValueKind>,
}

/// Mixed-type columns of one dataset snapshot, in column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MixedTypeReport {
    columns: Vec<MixedColumn>,
}

impl MixedTypeReport {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MixedColumn> {
        self.columns.iter()
    }
}

/// Flag every column whose non-missing cells do not share one runtime type.
/// Missing cells never count as a type of their own.
pub fn detect_mixed_type_columns(dataset: &Dataset) -> MixedTypeReport {
    let columns = dataset
        .columns()
        .iter()
        .filter_map(|col| {
            let kinds = col.kinds();
            (kinds.len() > 1).then(|| MixedColumn {
                name: col.name().to_string(),
                kinds,
            })
        })
        .collect::<Vec<_>>();

    if !columns.is_empty() {
        log::info!(
            "Detected {} mixed-type column(s): {:?}",
            columns.len(),
            columns.iter().map(|c| &c.name).collect::<Vec<_>>()
        );
    }
    MixedTypeReport { columns }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Outcome of one reconciliation pass: the new snapshot plus every column
/// that could not be coerced (those columns are left as they were).
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub dataset: Dataset,
    pub failures: Vec<EngineError>,
}

/// Cast each column named in `spec` to its declared type.
///
/// Individual cells that do not parse become `Null`. A column where no
/// non-missing cell parses is reported as a `TypeCoercionFailure` and kept
/// unmodified.
pub fn reconcile_types(
    dataset: &Dataset,
    spec: &ColumnTypeSpec,
    config: &EngineConfig,
) -> Reconciliation {
    let mut current = dataset.clone();
    let mut failures = Vec::new();

    for (name, ty) in spec.iter() {
        let Some(column) = dataset.column(name) else {
            log::warn!("Type declaration for unknown column '{name}' ignored");
            failures.push(EngineError::InvalidSpec(format!(
                "cannot declare type for unknown column '{name}'"
            )));
            continue;
        };

        let cast = cast_column(column, ty, config).and_then(|col| current.with_column(col));
        match cast {
            Ok(next) => current = next,
            Err(e) => {
                log::warn!("{e}");
                failures.push(e);
            }
        }
    }

    log::info!(
        "Reconciled {} column(s), {} failure(s)",
        spec.len() - failures.len(),
        failures.len()
    );
    Reconciliation {
        dataset: current,
        failures,
    }
}

fn cast_column(column: &Column, ty: DeclaredType, config: &EngineConfig) -> Result<Column> {
    let mut converted = 0usize;
    let mut degraded = 0usize;

    let values: Vec<Value> = column
        .values()
        .iter()
        .map(|v| {
            if v.is_null() {
                return Value::Null;
            }
            match cast_value(v, ty, config) {
                Some(cast) => {
                    converted += 1;
                    cast
                }
                None => {
                    degraded += 1;
                    Value::Null
                }
            }
        })
        .collect();

    if converted == 0 && degraded > 0 {
        return Err(EngineError::TypeCoercionFailure {
            column: column.name().to_string(),
            target: ty.to_string(),
            reason: format!("none of the {degraded} non-missing cell(s) could be parsed"),
        });
    }
    if degraded > 0 {
        log::warn!(
            "Column '{}': {degraded} cell(s) could not be parsed as {ty} and are now missing",
            column.name()
        );
    }

    Ok(Column::new(column.name(), values).with_declared(ty))
}

/// Cast one non-missing cell; `None` when it cannot be represented.
pub(crate) fn cast_value(value: &Value, ty: DeclaredType, config: &EngineConfig) -> Option<Value> {
    match ty {
        DeclaredType::String => value.to_text(&config.list_separator).map(Value::String),
        DeclaredType::NumericInteger => to_integer(value).map(Value::Integer),
        DeclaredType::NumericFloat => to_float(value).map(Value::Float),
        DeclaredType::Datetime => to_datetime(value, &config.date_formats).map(Value::DateTime),
    }
}

fn integral(f: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, hence the strict upper bound.
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Float(f) => integral(*f),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => {
            let t = s.trim();
            t.parse::<i64>()
                .ok()
                .or_else(|| t.parse::<f64>().ok().and_then(integral))
        }
        Value::Null | Value::DateTime(_) | Value::List(_) => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    let f = match value {
        Value::Integer(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Null | Value::DateTime(_) | Value::List(_) => return None,
    };
    f.is_finite().then_some(f)
}

fn to_datetime(value: &Value, formats: &[String]) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(d) => Some(*d),
        Value::String(s) => {
            let t = s.trim();
            formats.iter().find_map(|fmt| {
                NaiveDateTime::parse_from_str(t, fmt).ok().or_else(|| {
                    NaiveDate::parse_from_str(t, fmt)
                        .ok()
                        .map(|d| d.and_time(NaiveTime::MIN))
                })
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_rows(
            &["zip", "amount", "note", "when"],
            vec![
                vec![1234i64.into(), "10".into(), "free".into(), "2024-03-01".into()],
                vec!["ABC12".into(), 2.5f64.into(), "text".into(), "03/02/2024".into()],
                vec![Value::Null, "n/a".into(), Value::Null, "someday".into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn detects_only_heterogeneous_columns() {
        let ds = Dataset::from_rows(
            &["mixed", "ints_with_gaps", "all_missing"],
            vec![
                vec![1i64.into(), 1i64.into(), Value::Null],
                vec!["a".into(), Value::Null, Value::Null],
                vec![Value::Null, 3i64.into(), Value::Null],
            ],
        )
        .unwrap();

        let report = detect_mixed_type_columns(&ds);
        assert_eq!(report.names(), vec!["mixed"]);
        let mixed = report.iter().next().unwrap();
        assert_eq!(
            mixed.kinds,
            BTreeSet::from([ValueKind::Integer, ValueKind::String])
        );
    }

    #[test]
    fn string_declaration_stringifies_every_cell() {
        let ds = Dataset::from_rows(
            &["tags"],
            vec![
                vec![Value::List(vec!["a".into(), "b".into()])],
                vec![7i64.into()],
                vec![Value::Null],
            ],
        )
        .unwrap();
        let spec = ColumnTypeSpec::new().with("tags", DeclaredType::String);
        let out = reconcile_types(&ds, &spec, &EngineConfig::default());

        assert!(out.failures.is_empty());
        let col = out.dataset.column("tags").unwrap();
        assert_eq!(col.values(), &[Value::from("a,b"), Value::from("7"), Value::Null]);
        assert_eq!(col.declared(), Some(DeclaredType::String));
        assert!(detect_mixed_type_columns(&out.dataset).is_empty());
    }

    #[test]
    fn unparseable_numeric_cells_become_missing() {
        let spec = ColumnTypeSpec::new().with("amount", DeclaredType::NumericFloat);
        let out = reconcile_types(&dataset(), &spec, &EngineConfig::default());

        assert!(out.failures.is_empty());
        let col = out.dataset.column("amount").unwrap();
        assert_eq!(col.values(), &[Value::Float(10.0), Value::Float(2.5), Value::Null]);
    }

    #[test]
    fn integer_cast_accepts_integral_text_only() {
        let ds = Dataset::from_rows(
            &["n"],
            vec![vec!["12".into()], vec!["3.0".into()], vec!["3.5".into()], vec![true.into()]],
        )
        .unwrap();
        let spec = ColumnTypeSpec::new().with("n", DeclaredType::NumericInteger);
        let out = reconcile_types(&ds, &spec, &EngineConfig::default());
        assert_eq!(
            out.dataset.column("n").unwrap().values(),
            &[Value::Integer(12), Value::Integer(3), Value::Null, Value::Integer(1)]
        );
    }

    #[test]
    fn free_text_column_fails_and_stays_unmodified() {
        let ds = dataset();
        let spec = ColumnTypeSpec::new()
            .with("note", DeclaredType::NumericInteger)
            .with("amount", DeclaredType::NumericFloat);
        let out = reconcile_types(&ds, &spec, &EngineConfig::default());

        assert_eq!(out.failures.len(), 1);
        match &out.failures[0] {
            EngineError::TypeCoercionFailure { column, target, .. } => {
                assert_eq!(column, "note");
                assert_eq!(target, "numeric-integer");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(out.dataset.column("note"), ds.column("note"));
        // The other declaration still applied.
        assert_eq!(
            out.dataset.column("amount").unwrap().declared(),
            Some(DeclaredType::NumericFloat)
        );
    }

    #[test]
    fn datetime_uses_configured_formats() {
        let spec = ColumnTypeSpec::new().with("when", DeclaredType::Datetime);
        let out = reconcile_types(&dataset(), &spec, &EngineConfig::default());
        let col = out.dataset.column("when").unwrap();

        let march_1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_time(NaiveTime::MIN);
        let march_2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap().and_time(NaiveTime::MIN);
        assert_eq!(
            col.values(),
            &[Value::DateTime(march_1), Value::DateTime(march_2), Value::Null]
        );

        let strict = EngineConfig {
            date_formats: vec!["%Y-%m-%d".to_string()],
            ..EngineConfig::default()
        };
        let out = reconcile_types(&dataset(), &spec, &strict);
        assert_eq!(out.dataset.column("when").unwrap().get(1), &Value::Null);
    }

    #[test]
    fn unknown_column_is_reported() {
        let spec = ColumnTypeSpec::new().with("missing", DeclaredType::String);
        let ds = dataset();
        let out = reconcile_types(&ds, &spec, &EngineConfig::default());
        assert!(matches!(out.failures.as_slice(), [EngineError::InvalidSpec(_)]));
        assert_eq!(out.dataset, ds);
    }
}
