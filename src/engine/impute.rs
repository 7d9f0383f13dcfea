//! Missing-value imputation driven by declared column types.

use std::fmt;

use crate::config::EngineConfig;
use crate::data::model::{Column, ColumnTypeSpec, Dataset, DeclaredType, Value};

/// Why a declared column was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The column does not exist in the dataset.
    UnknownColumn,
    /// The column has not been reconciled to the declared type yet.
    NotReconciled { found: Option<DeclaredType> },
    /// Numeric column without a single observed value: the mean is undefined.
    NoObservedValues,
    /// No default rule exists for `datetime` columns.
    NoDatetimeRule,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnknownColumn => write!(f, "unknown column"),
            SkipReason::NotReconciled { found: Some(ty) } => {
                write!(f, "column is declared {ty}; reconcile types before imputing")
            }
            SkipReason::NotReconciled { found: None } => {
                write!(f, "column has no declared type; reconcile types before imputing")
            }
            SkipReason::NoObservedValues => write!(f, "no non-missing values to average"),
            SkipReason::NoDatetimeRule => write!(f, "no imputation rule for datetime"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedColumn {
    pub column: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub struct Imputation {
    pub dataset: Dataset,
    /// Number of cells that were filled in.
    pub filled: usize,
    pub skipped: Vec<SkippedColumn>,
}

/// Fill missing cells of every declared column:
///
/// * `string` – the configured blank sentinel
/// * numeric – the mean of the values observed before filling
///   (rounded for `numeric-integer`)
/// * `datetime` – left alone and reported
///
/// Columns must already carry the declared type from reconciliation.
pub fn impute(dataset: &Dataset, spec: &ColumnTypeSpec, config: &EngineConfig) -> Imputation {
    let mut current = dataset.clone();
    let mut filled = 0;
    let mut skipped = Vec::new();

    for (name, ty) in spec.iter() {
        let outcome = match dataset.column(name) {
            None => Err(SkipReason::UnknownColumn),
            Some(col) if col.declared() != Some(ty) => Err(SkipReason::NotReconciled {
                found: col.declared(),
            }),
            Some(col) => fill_column(col, ty, config),
        };

        match outcome {
            Ok((col, n)) if n > 0 => match current.with_column(col) {
                Ok(next) => {
                    log::debug!("Imputed {n} cell(s) in '{name}'");
                    current = next;
                    filled += n;
                }
                Err(e) => log::warn!("Imputation of '{name}' dropped: {e}"),
            },
            Ok(_) => {}
            Err(reason) => {
                log::warn!("Imputation skipped for '{name}': {reason}");
                skipped.push(SkippedColumn {
                    column: name.to_string(),
                    reason,
                });
            }
        }
    }

    log::info!("Imputed {filled} cell(s), skipped {} column(s)", skipped.len());
    Imputation {
        dataset: current,
        filled,
        skipped,
    }
}

fn fill_column(
    col: &Column,
    ty: DeclaredType,
    config: &EngineConfig,
) -> Result<(Column, usize), SkipReason> {
    let missing = col.missing_count();
    if missing == 0 {
        return Ok((col.clone(), 0));
    }

    let fill = match ty {
        DeclaredType::String => Value::String(config.blank_sentinel.clone()),
        DeclaredType::NumericInteger | DeclaredType::NumericFloat => {
            let observed: Vec<f64> = col.values().iter().filter_map(Value::as_f64).collect();
            if observed.is_empty() {
                return Err(SkipReason::NoObservedValues);
            }
            let mean = observed.iter().sum::<f64>() / observed.len() as f64;
            if ty == DeclaredType::NumericInteger {
                Value::Integer(mean.round() as i64)
            } else {
                Value::Float(mean)
            }
        }
        DeclaredType::Datetime => return Err(SkipReason::NoDatetimeRule),
    };

    let values = col
        .values()
        .iter()
        .map(|v| if v.is_null() { fill.clone() } else { v.clone() })
        .collect();
    Ok((Column::new(col.name(), values).with_declared(ty), missing))
}
