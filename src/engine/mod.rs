//! Engine layer: pure transformations from one `Dataset` snapshot to another.
//!
//! ```text
//!  raw Dataset ──► reconcile ──► impute ──┬──► pivot ──► AggregationResult
//!                                         └──► geo   ──► AggregationResult
//! ```
//!
//! No operation keeps state between calls or mutates its input.

pub mod geo;
pub mod impute;
pub mod pivot;
pub mod reconcile;

use crate::config::EngineConfig;
use crate::data::model::{ColumnTypeSpec, Dataset};
use crate::error::EngineError;

use self::impute::{impute, SkippedColumn};
use self::reconcile::reconcile_types;

/// Dataset after reconcile-then-impute, plus everything worth reporting.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub dataset: Dataset,
    pub coercion_failures: Vec<EngineError>,
    pub imputed_cells: usize,
    pub skipped: Vec<SkippedColumn>,
}

/// Apply declared types, then fill the gaps they leave, in that order.
///
/// Columns that failed coercion keep their raw content and are dropped from
/// the imputation pass.
pub fn prepare(dataset: &Dataset, spec: &ColumnTypeSpec, config: &EngineConfig) -> Prepared {
    let reconciled = reconcile_types(dataset, spec, config);

    let mut impute_spec = ColumnTypeSpec::new();
    for (name, ty) in spec.iter() {
        let applied = reconciled
            .dataset
            .column(name)
            .is_some_and(|c| c.declared() == Some(ty));
        if applied {
            impute_spec.insert(name, ty);
        }
    }

    let imputed = impute(&reconciled.dataset, &impute_spec, config);
    Prepared {
        dataset: imputed.dataset,
        coercion_failures: reconciled.failures,
        imputed_cells: imputed.filled,
        skipped: imputed.skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{DeclaredType, Value};
    use crate::engine::reconcile::detect_mixed_type_columns;

    #[test]
    fn prepare_reconciles_before_imputing() {
        let ds = Dataset::from_rows(
            &["zip", "amount", "note"],
            vec![
                vec![1234i64.into(), "4".into(), "x".into()],
                vec!["ABC".into(), "oops".into(), "y".into()],
                vec![Value::Null, 8i64.into(), Value::Null],
            ],
        )
        .unwrap();
        assert_eq!(detect_mixed_type_columns(&ds).names(), vec!["zip", "amount"]);

        let spec = ColumnTypeSpec::new()
            .with("zip", DeclaredType::String)
            .with("amount", DeclaredType::NumericFloat)
            .with("note", DeclaredType::Datetime);
        let out = prepare(&ds, &spec, &EngineConfig::default());

        // "oops" failed to parse, so the mean of 4 and 8 fills it.
        assert_eq!(
            out.dataset.column("amount").unwrap().values(),
            &[Value::Float(4.0), Value::Float(6.0), Value::Float(8.0)]
        );
        assert_eq!(
            out.dataset.column("zip").unwrap().values(),
            &[Value::from("1234"), Value::from("ABC"), Value::from("blank")]
        );
        // Free text cannot become datetime: reported and left raw, not imputed.
        assert_eq!(out.coercion_failures.len(), 1);
        assert_eq!(out.dataset.column("note"), ds.column("note"));
        assert!(out.skipped.is_empty());
        assert_eq!(out.imputed_cells, 2);
        assert!(detect_mixed_type_columns(&out.dataset).is_empty());
    }
}
