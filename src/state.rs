use std::collections::BTreeSet;

use crate::config::EngineConfig;
use crate::data::filter::{apply_filter, init_filter_state, FilterState};
use crate::data::model::{ColumnTypeSpec, Dataset, Value};
use crate::engine::geo::{aggregate_by_zip, GeoJoinSpec, ZipAggregate};
use crate::engine::pivot::{pivot, PivotSpec};
use crate::engine::prepare;
use crate::engine::reconcile::{detect_mixed_type_columns, MixedTypeReport};
use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// What the presentation layer holds between engine calls.
///
/// Each field is a snapshot that is replaced wholesale; the engine itself
/// keeps nothing. A failed operation only sets `status_message` and leaves
/// the previous successful result in place.
#[derive(Debug, Default)]
pub struct Session {
    pub config: EngineConfig,

    /// Current dataset (None until something is loaded).
    pub dataset: Option<Dataset>,

    /// Mixed-type columns of the current dataset.
    pub mixed: MixedTypeReport,

    /// Per-column row selections applied before aggregating.
    pub filters: FilterState,

    /// Last successful pivot.
    pub pivot_result: Option<Dataset>,

    /// Per-zip aggregate kept for join retries.
    pub zip_aggregate: Option<ZipAggregate>,

    /// Last successful geo-join.
    pub geo_result: Option<Dataset>,

    /// Status / error message for the user.
    pub status_message: Option<String>,
}

impl Session {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Ingest a newly loaded dataset: fresh mixed-type report, no filters,
    /// no stale results.
    pub fn set_dataset(&mut self, dataset: Dataset) {
        self.mixed = detect_mixed_type_columns(&dataset);
        self.filters = FilterState::new();
        self.pivot_result = None;
        self.zip_aggregate = None;
        self.geo_result = None;
        self.status_message = None;
        self.dataset = Some(dataset);
    }

    fn current(&self) -> Result<&Dataset> {
        self.dataset
            .as_ref()
            .ok_or_else(|| EngineError::InvalidSpec("no dataset loaded".to_string()))
    }

    /// Reconcile and impute the declared columns, replacing the dataset.
    /// Returns every coercion failure; those columns keep their content.
    pub fn apply_types(&mut self, spec: &ColumnTypeSpec) -> Result<Vec<EngineError>> {
        let prepared = prepare(self.current()?, spec, &self.config);

        let mut notes: Vec<String> = prepared
            .coercion_failures
            .iter()
            .map(ToString::to_string)
            .collect();
        notes.extend(
            prepared
                .skipped
                .iter()
                .map(|s| format!("imputation skipped for '{}': {}", s.column, s.reason)),
        );

        self.mixed = detect_mixed_type_columns(&prepared.dataset);
        self.dataset = Some(prepared.dataset);
        self.status_message = (!notes.is_empty()).then(|| notes.join("; "));
        Ok(prepared.coercion_failures)
    }

    /// Keep only rows whose `column` text matches one of `texts`.
    pub fn select_by_text(&mut self, column: &str, texts: &[String]) -> Result<()> {
        let col = self.current()?.require(column)?;
        let selected: BTreeSet<Value> = col
            .unique_values()
            .into_iter()
            .filter(|v| {
                v.to_text(&self.config.list_separator)
                    .is_some_and(|t| texts.contains(&t))
            })
            .collect();
        self.filters.insert(column.to_string(), selected);
        Ok(())
    }

    /// Select every value of every column (no effective filtering).
    pub fn select_all(&mut self) {
        if let Some(ds) = &self.dataset {
            self.filters = init_filter_state(ds);
        }
    }

    /// Current dataset with filters applied.
    pub fn filtered(&self) -> Result<Dataset> {
        Ok(apply_filter(self.current()?, &self.filters))
    }

    fn report<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            log::error!("{e}");
            self.status_message = Some(format!("Error: {e}"));
        }
        result
    }

    /// Pivot the filtered dataset; on failure the previous pivot stays.
    pub fn run_pivot(&mut self, spec: &PivotSpec) -> Result<&Dataset> {
        let result = self
            .filtered()
            .and_then(|ds| pivot(&ds, spec, &self.config));
        let table = self.report(result)?;
        self.status_message = None;
        Ok(&*self.pivot_result.insert(table))
    }

    /// Aggregate per zip, then join against `reference`.
    ///
    /// The aggregate is kept even when the reference is unavailable, so
    /// [`Session::retry_join`] can finish the job later.
    pub fn run_geo(
        &mut self,
        spec: &GeoJoinSpec,
        reference: std::result::Result<&Dataset, EngineError>,
    ) -> Result<&Dataset> {
        let aggregate = self.filtered().and_then(|ds| aggregate_by_zip(&ds, spec, &self.config));
        let aggregate = self.report(aggregate)?;
        self.zip_aggregate = Some(aggregate);

        let reference = self.report(reference)?;
        self.retry_join(reference)
    }

    /// Join the retained per-zip aggregate against a (re)loaded reference.
    pub fn retry_join(&mut self, reference: &Dataset) -> Result<&Dataset> {
        let joined = match &self.zip_aggregate {
            Some(aggregate) => aggregate.join(reference, &self.config),
            None => Err(EngineError::InvalidSpec(
                "no zip aggregate to join; run the geo aggregation first".to_string(),
            )),
        };
        let joined = self.report(joined)?;
        self.status_message = None;
        Ok(&*self.geo_result.insert(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::DeclaredType;
    use crate::engine::geo::GeoAggregation;

    fn session() -> Session {
        let mut session = Session::new(EngineConfig::default());
        session.set_dataset(
            Dataset::from_rows(
                &["zip", "state", "enrolled"],
                vec![
                    vec![1234i64.into(), "CA".into(), "Yes".into()],
                    vec!["01235".into(), "CA".into(), "No".into()],
                    vec![1234i64.into(), "TX".into(), "Yes".into()],
                ],
            )
            .unwrap(),
        );
        session
    }

    fn reference() -> Dataset {
        Dataset::from_rows(
            &["zip", "latitude", "longitude"],
            vec![vec!["01234".into(), 1.0f64.into(), 2.0f64.into()]],
        )
        .unwrap()
    }

    #[test]
    fn declaring_types_replaces_the_snapshot() {
        let mut s = session();
        assert_eq!(s.mixed.names(), vec!["zip"]);

        let before = s.dataset.clone().unwrap();
        let failures = s
            .apply_types(&ColumnTypeSpec::new().with("zip", DeclaredType::String))
            .unwrap();
        assert!(failures.is_empty());
        assert!(s.mixed.is_empty());
        assert_ne!(s.dataset.as_ref().unwrap(), &before);
    }

    #[test]
    fn failed_pivot_keeps_previous_result() {
        let mut s = session();
        let good = PivotSpec::new(["state"], "enrolled");
        let first = s.run_pivot(&good).unwrap().clone();

        let bad = PivotSpec::new(Vec::<String>::new(), "enrolled");
        assert!(s.run_pivot(&bad).is_err());
        assert_eq!(s.pivot_result.as_ref(), Some(&first));
        assert!(s.status_message.as_deref().unwrap().contains("rowKeys"));
    }

    #[test]
    fn filters_apply_before_pivoting() {
        let mut s = session();
        s.select_by_text("state", &["TX".to_string()]).unwrap();
        let out = s.run_pivot(&PivotSpec::new(["state"], "enrolled")).unwrap();
        assert_eq!(out.num_rows(), 1);

        s.select_all();
        let out = s.run_pivot(&PivotSpec::new(["state"], "enrolled")).unwrap();
        assert_eq!(out.num_rows(), 2);
    }

    #[test]
    fn unavailable_reference_keeps_the_aggregate_for_retry() {
        let mut s = session();
        let spec = GeoJoinSpec::new("zip", "enrolled").with_aggregation(GeoAggregation::Count);
        let err = s
            .run_geo(&spec, Err(EngineError::ReferenceUnavailable("offline".to_string())))
            .unwrap_err();
        assert!(matches!(err, EngineError::ReferenceUnavailable(_)));
        assert!(s.geo_result.is_none());
        assert_eq!(s.zip_aggregate.as_ref().map(ZipAggregate::len), Some(2));

        let joined = s.retry_join(&reference()).unwrap();
        assert_eq!(joined.num_rows(), 2);
        assert_eq!(joined.column("metric").unwrap().get(0), &Value::Integer(2));
        assert!(s.status_message.is_none());
    }
}
