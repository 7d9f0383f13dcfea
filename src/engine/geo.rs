//! Zip-code normalisation, per-zip metric aggregation and the left join
//! against a geographic reference table.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::data::filter::drop_missing;
use crate::data::model::{Column, Dataset, Value};
use crate::error::{EngineError, Result};

pub const ZIP: &str = "zip";
pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";
pub const METRIC: &str = "metric";

const LATITUDE_ALIASES: [&str; 2] = ["latitude", "lat"];
const LONGITUDE_ALIASES: [&str; 3] = ["longitude", "lon", "lng"];

// ---------------------------------------------------------------------------
// Zip normalisation
// ---------------------------------------------------------------------------

/// Left-pad `zip` with `'0'` up to `width` characters. Longer values are
/// returned unchanged, so padding twice equals padding once.
pub fn pad_zip(zip: &str, width: usize) -> String {
    let zip = zip.trim();
    let len = zip.chars().count();
    if len >= width {
        zip.to_string()
    } else {
        format!("{}{zip}", "0".repeat(width - len))
    }
}

/// Join key for a zip cell; missing and blank cells have none. Integral
/// floats (a zip column read with gaps) lose their fractional part first,
/// as does their text form (`"1234.0"`) once the column is declared `string`.
pub fn normalize_zip(value: &Value, width: usize) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Float(f) => integral_text(*f).or_else(|| value.to_text(","))?,
        other => other.to_text(",")?,
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let integral = text
        .contains('.')
        .then(|| text.parse::<f64>().ok().and_then(integral_text))
        .flatten();
    Some(pad_zip(integral.as_deref().unwrap_or(text), width))
}

fn integral_text(f: f64) -> Option<String> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15).then(|| format!("{}", f as i64))
}

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

/// How the metric column is reduced per zip.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum GeoAggregation {
    /// `Sum` for numeric metrics, otherwise `ConditionalCount` with the
    /// configured affirmative marker.
    #[default]
    Auto,
    Sum,
    /// Rows per zip.
    Count,
    /// Rows per zip whose metric text equals `marker`.
    ConditionalCount { marker: String },
}

impl fmt::Display for GeoAggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeoAggregation::Auto => f.write_str("auto"),
            GeoAggregation::Sum => f.write_str("sum"),
            GeoAggregation::Count => f.write_str("count"),
            GeoAggregation::ConditionalCount { marker } => {
                write!(f, "conditional-count(=\"{marker}\")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJoinSpec {
    pub zip_column: String,
    pub metric_column: String,
    #[serde(default)]
    pub aggregation: GeoAggregation,
}

impl GeoJoinSpec {
    pub fn new(zip_column: impl Into<String>, metric_column: impl Into<String>) -> Self {
        GeoJoinSpec {
            zip_column: zip_column.into(),
            metric_column: metric_column.into(),
            aggregation: GeoAggregation::Auto,
        }
    }

    pub fn with_aggregation(mut self, aggregation: GeoAggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    fn validate(&self, dataset: &Dataset) -> Result<()> {
        if self.zip_column.trim().is_empty() || self.metric_column.trim().is_empty() {
            return Err(EngineError::InvalidSpec(
                "zipColumn and metricColumn must both name a column".to_string(),
            ));
        }
        if let GeoAggregation::ConditionalCount { marker } = &self.aggregation {
            if marker.is_empty() {
                return Err(EngineError::InvalidSpec(
                    "conditional-count needs a non-empty marker".to_string(),
                ));
            }
        }
        dataset.require(&self.zip_column)?;
        dataset.require(&self.metric_column)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Aggregation (before the join)
// ---------------------------------------------------------------------------

/// Metric per normalised zip, computed before the join so a failed join can
/// be retried against a freshly loaded reference without recomputing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ZipAggregate {
    /// Resolved aggregation (never `Auto`).
    pub aggregation: GeoAggregation,
    rows: BTreeMap<String, Value>,
}

impl ZipAggregate {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, zip: &str) -> Option<&Value> {
        self.rows.get(zip)
    }

    /// Two-column `zip`, `metric` view (no coordinates).
    pub fn to_dataset(&self) -> Result<Dataset> {
        let zips = self.rows.keys().map(|z| Value::String(z.clone())).collect();
        let metrics = self.rows.values().cloned().collect();
        Dataset::new(vec![Column::new(ZIP, zips), Column::new(METRIC, metrics)])
    }

    /// Left join against the reference table: every aggregated zip is kept,
    /// unmatched ones carry missing coordinates.
    pub fn join(&self, reference: &Dataset, config: &EngineConfig) -> Result<Dataset> {
        let coords = index_reference(reference, config)?;

        let mut zips = Vec::with_capacity(self.rows.len());
        let mut lats = Vec::with_capacity(self.rows.len());
        let mut lons = Vec::with_capacity(self.rows.len());
        let mut metrics = Vec::with_capacity(self.rows.len());
        let mut unmatched = 0usize;

        for (zip, metric) in &self.rows {
            let (lat, lon) = match coords.get(zip) {
                Some((lat, lon)) => (lat.clone(), lon.clone()),
                None => {
                    unmatched += 1;
                    (Value::Null, Value::Null)
                }
            };
            zips.push(Value::String(zip.clone()));
            lats.push(lat);
            lons.push(lon);
            metrics.push(metric.clone());
        }

        if unmatched > 0 {
            log::warn!("{unmatched} zip(s) have no match in the reference table");
        }
        log::info!(
            "Geo join: {} zip(s), {} located",
            self.rows.len(),
            self.rows.len() - unmatched
        );

        Dataset::new(vec![
            Column::new(ZIP, zips),
            Column::new(LATITUDE, lats),
            Column::new(LONGITUDE, lons),
            Column::new(METRIC, metrics),
        ])
    }
}

#[derive(Default)]
struct ZipAcc {
    count: i64,
    int_total: i128,
    float_total: f64,
}

/// Aggregate the metric per normalised zip. Rows without a zip are ignored.
pub fn aggregate_by_zip(
    dataset: &Dataset,
    spec: &GeoJoinSpec,
    config: &EngineConfig,
) -> Result<ZipAggregate> {
    spec.validate(dataset)?;
    let zip_col = dataset.require(&spec.zip_column)?;
    let metric_col = dataset.require(&spec.metric_column)?;

    let aggregation = match &spec.aggregation {
        GeoAggregation::Auto if metric_col.is_numeric() => GeoAggregation::Sum,
        GeoAggregation::Auto => GeoAggregation::ConditionalCount {
            marker: config.affirmative_marker.clone(),
        },
        explicit => explicit.clone(),
    };
    let integral = metric_col
        .values()
        .iter()
        .all(|v| !matches!(v, Value::Float(_)));

    let mut accs: BTreeMap<String, ZipAcc> = BTreeMap::new();
    let mut without_zip = 0usize;

    for (zip, metric) in zip_col.values().iter().zip(metric_col.values()) {
        // The imputed blank sentinel is a filled-in gap, not a zip.
        let Some(zip) = normalize_zip(zip, config.zip_width)
            .filter(|z| z.as_str() != config.blank_sentinel)
        else {
            without_zip += 1;
            continue;
        };
        let acc = accs.entry(zip).or_default();
        match &aggregation {
            GeoAggregation::Count => acc.count += 1,
            GeoAggregation::ConditionalCount { marker } => {
                if metric.to_text(&config.list_separator).as_deref() == Some(marker.as_str()) {
                    acc.count += 1;
                }
            }
            GeoAggregation::Sum => match metric {
                Value::Null => {}
                Value::Integer(i) => {
                    acc.int_total += i128::from(*i);
                    acc.float_total += *i as f64;
                }
                Value::Float(f) => acc.float_total += f,
                other => {
                    return Err(EngineError::computation(
                        &[spec.metric_column.as_str()],
                        format!("cannot sum non-numeric value '{other}'"),
                    ));
                }
            },
            GeoAggregation::Auto => unreachable!("auto resolved above"),
        }
    }

    if without_zip > 0 {
        log::debug!("{without_zip} row(s) without a zip code were ignored");
    }

    let mut rows = BTreeMap::new();
    for (zip, acc) in accs {
        let value = match &aggregation {
            GeoAggregation::Sum if integral => {
                Value::Integer(i64::try_from(acc.int_total).map_err(|_| {
                    EngineError::computation(
                        &[spec.metric_column.as_str()],
                        "integer sum overflows",
                    )
                })?)
            }
            GeoAggregation::Sum => Value::Float(acc.float_total),
            _ => Value::Integer(acc.count),
        };
        rows.insert(zip, value);
    }

    log::info!(
        "Aggregated '{}' per zip ({aggregation}): {} zip(s)",
        spec.metric_column,
        rows.len()
    );
    Ok(ZipAggregate { aggregation, rows })
}

/// Aggregate then join in one go.
pub fn geo_aggregate(
    dataset: &Dataset,
    spec: &GeoJoinSpec,
    reference: &Dataset,
    config: &EngineConfig,
) -> Result<Dataset> {
    aggregate_by_zip(dataset, spec, config)?.join(reference, config)
}

// ---------------------------------------------------------------------------
// Reference table
// ---------------------------------------------------------------------------

fn find_column<'a>(reference: &'a Dataset, aliases: &[&str]) -> Option<&'a Column> {
    aliases.iter().find_map(|name| reference.column(name))
}

/// Check the reference exposes `zip`, latitude and longitude columns.
pub fn validate_reference(reference: &Dataset) -> Result<()> {
    let missing: Vec<&str> = [
        (ZIP, reference.column(ZIP).is_some()),
        (LATITUDE, find_column(reference, &LATITUDE_ALIASES).is_some()),
        (LONGITUDE, find_column(reference, &LONGITUDE_ALIASES).is_some()),
    ]
    .into_iter()
    .filter(|(_, present)| !present)
    .map(|(name, _)| name)
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::InvalidSpec(format!(
            "reference table is missing column(s): {}",
            missing.join(", ")
        )))
    }
}

fn coordinate(value: &Value) -> Value {
    match value {
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::float)
            .unwrap_or(Value::Null),
        other => other.as_f64().map(Value::float).unwrap_or(Value::Null),
    }
}

fn index_reference(
    reference: &Dataset,
    config: &EngineConfig,
) -> Result<BTreeMap<String, (Value, Value)>> {
    validate_reference(reference)?;
    let zip = reference.require(ZIP)?;
    let (Some(lat), Some(lon)) = (
        find_column(reference, &LATITUDE_ALIASES),
        find_column(reference, &LONGITUDE_ALIASES),
    ) else {
        return Err(EngineError::InvalidSpec(
            "reference table has no coordinate columns".to_string(),
        ));
    };

    let mut index = BTreeMap::new();
    let mut duplicates = 0usize;
    for row in 0..reference.num_rows() {
        let Some(key) = normalize_zip(zip.get(row), config.zip_width) else {
            continue;
        };
        if index.contains_key(&key) {
            duplicates += 1;
            continue;
        }
        index.insert(key, (coordinate(lat.get(row)), coordinate(lon.get(row))));
    }
    if duplicates > 0 {
        log::warn!("Reference table has {duplicates} duplicate zip row(s); first match wins");
    }
    Ok(index)
}

// ---------------------------------------------------------------------------
// Consumer helpers
// ---------------------------------------------------------------------------

/// Zips of a joined result that have no coordinates.
pub fn unlocated_zips(joined: &Dataset) -> Vec<String> {
    let (Some(zip), Some(lat), Some(lon)) = (
        joined.column(ZIP),
        joined.column(LATITUDE),
        joined.column(LONGITUDE),
    ) else {
        return Vec::new();
    };
    (0..joined.num_rows())
        .filter(|&i| lat.get(i).is_null() || lon.get(i).is_null())
        .filter_map(|i| zip.get(i).to_text(","))
        .collect()
}

/// Joined result restricted to rows that can be placed on a map.
pub fn located_only(joined: &Dataset) -> Dataset {
    drop_missing(joined, &[LATITUDE, LONGITUDE])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::model::{ColumnTypeSpec, DeclaredType};

    fn reference() -> Dataset {
        Dataset::from_rows(
            &["zip", "lat", "lon"],
            vec![
                vec!["01234".into(), 1.0f64.into(), 2.0f64.into()],
                vec![75001i64.into(), "32.9".into(), "-96.8".into()],
            ],
        )
        .unwrap()
    }

    fn enrollment() -> Dataset {
        Dataset::from_rows(
            &["zip", "enrolled", "amount"],
            vec![
                vec![1234i64.into(), "Yes".into(), 10i64.into()],
                vec![1234i64.into(), "No".into(), 5i64.into()],
                vec!["75001".into(), "Yes".into(), Value::Null],
                vec!["99".into(), "Yes".into(), 1i64.into()],
                vec![Value::Null, "Yes".into(), 100i64.into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn padding_is_idempotent() {
        assert_eq!(pad_zip("1234", 5), "01234");
        for z in ["", "7", "1234", "01234", "12345", "123456", " 42 "] {
            let once = pad_zip(z, 5);
            assert_eq!(pad_zip(&once, 5), once);
        }
        assert_eq!(normalize_zip(&Value::Integer(1234), 5).as_deref(), Some("01234"));
        assert_eq!(normalize_zip(&Value::Float(1234.0), 5).as_deref(), Some("01234"));
        assert_eq!(normalize_zip(&Value::Null, 5), None);
    }

    #[test]
    fn float_text_and_blank_zips_normalise() {
        assert_eq!(normalize_zip(&"1234.0".into(), 5).as_deref(), Some("01234"));
        assert_eq!(normalize_zip(&"01234".into(), 5).as_deref(), Some("01234"));
        assert_eq!(normalize_zip(&"12.5".into(), 5).as_deref(), Some("012.5"));
        assert_eq!(normalize_zip(&"".into(), 5), None);
        assert_eq!(normalize_zip(&"   ".into(), 5), None);
    }

    #[test]
    fn declaring_zip_as_string_keeps_float_zips_together() {
        let ds = Dataset::from_rows(
            &["zip", "enrolled"],
            vec![
                vec![1234i64.into(), "Yes".into()],
                vec![1234.0f64.into(), "Yes".into()],
                vec!["unknown".into(), "No".into()],
                vec![Value::Null, "Yes".into()],
            ],
        )
        .unwrap();
        let config = EngineConfig::default();
        let declared = ColumnTypeSpec::new().with("zip", DeclaredType::String);
        let prepared = crate::engine::prepare(&ds, &declared, &config);
        // The gap was filled with the blank sentinel.
        assert_eq!(prepared.dataset.column("zip").unwrap().get(3), &Value::from("blank"));

        let spec = GeoJoinSpec::new("zip", "enrolled").with_aggregation(GeoAggregation::Count);
        let agg = aggregate_by_zip(&prepared.dataset, &spec, &config).unwrap();
        let raw = aggregate_by_zip(&ds, &spec, &config).unwrap();

        assert_eq!(agg.len(), 2);
        assert_eq!(agg.get("01234"), Some(&Value::Integer(2)));
        assert_eq!(agg.get("unknown"), Some(&Value::Integer(1)));
        assert_eq!(agg, raw);
    }

    #[test]
    fn conditional_count_joins_coordinates() {
        let ds = Dataset::from_rows(
            &["zip", "enrolled"],
            vec![
                vec![1234i64.into(), "Yes".into()],
                vec![1234i64.into(), "No".into()],
            ],
        )
        .unwrap();
        let spec = GeoJoinSpec::new("zip", "enrolled").with_aggregation(
            GeoAggregation::ConditionalCount {
                marker: "Yes".to_string(),
            },
        );
        let out = geo_aggregate(&ds, &spec, &reference(), &EngineConfig::default()).unwrap();

        assert_eq!(out.column_names(), vec![ZIP, LATITUDE, LONGITUDE, METRIC]);
        assert_eq!(out.num_rows(), 1);
        assert_eq!(
            out.row(0),
            vec![
                &Value::from("01234"),
                &Value::Float(1.0),
                &Value::Float(2.0),
                &Value::Integer(1)
            ]
        );
    }

    #[test]
    fn unmatched_zips_are_kept_with_missing_coordinates() {
        let config = EngineConfig::default();
        let spec = GeoJoinSpec::new("zip", "enrolled");
        let out = geo_aggregate(&enrollment(), &spec, &reference(), &config).unwrap();

        assert_eq!(
            out.column(ZIP).unwrap().values(),
            &[Value::from("00099"), Value::from("01234"), Value::from("75001")]
        );
        assert_eq!(out.column(LATITUDE).unwrap().get(0), &Value::Null);
        assert_eq!(out.column(LATITUDE).unwrap().get(2), &Value::Float(32.9));
        assert_eq!(unlocated_zips(&out), vec!["00099".to_string()]);

        let located = located_only(&out);
        assert_eq!(located.num_rows(), 2);
    }

    #[test]
    fn auto_sums_numeric_metrics() {
        let config = EngineConfig::default();
        let spec = GeoJoinSpec::new("zip", "amount");
        let agg = aggregate_by_zip(&enrollment(), &spec, &config).unwrap();

        assert_eq!(agg.aggregation, GeoAggregation::Sum);
        assert_eq!(agg.get("01234"), Some(&Value::Integer(15)));
        assert_eq!(agg.get("75001"), Some(&Value::Integer(0)));
        assert_eq!(agg.len(), 3);
    }

    #[test]
    fn auto_counts_affirmative_markers_for_text_metrics() {
        let config = EngineConfig::default();
        let agg = aggregate_by_zip(&enrollment(), &GeoJoinSpec::new("zip", "enrolled"), &config)
            .unwrap();
        assert_eq!(
            agg.aggregation,
            GeoAggregation::ConditionalCount {
                marker: "Yes".to_string()
            }
        );
        assert_eq!(agg.get("01234"), Some(&Value::Integer(1)));

        let count = aggregate_by_zip(
            &enrollment(),
            &GeoJoinSpec::new("zip", "enrolled").with_aggregation(GeoAggregation::Count),
            &config,
        )
        .unwrap();
        assert_eq!(count.get("01234"), Some(&Value::Integer(2)));
    }

    #[test]
    fn aggregate_survives_a_failed_join() {
        let config = EngineConfig::default();
        let agg = aggregate_by_zip(&enrollment(), &GeoJoinSpec::new("zip", "enrolled"), &config)
            .unwrap();

        let broken = Dataset::from_rows(&["zip"], vec![vec!["01234".into()]]).unwrap();
        match agg.join(&broken, &config) {
            Err(EngineError::InvalidSpec(msg)) => {
                assert!(msg.contains(LATITUDE) && msg.contains(LONGITUDE))
            }
            other => panic!("unexpected {other:?}"),
        }

        let retried = agg.join(&reference(), &config).unwrap();
        assert_eq!(retried.num_rows(), agg.len());
        assert_eq!(agg.to_dataset().unwrap().column_names(), vec![ZIP, METRIC]);
    }

    #[test]
    fn summing_text_metric_fails() {
        let spec = GeoJoinSpec::new("zip", "enrolled").with_aggregation(GeoAggregation::Sum);
        assert!(matches!(
            aggregate_by_zip(&enrollment(), &spec, &EngineConfig::default()),
            Err(EngineError::ComputationFailure { .. })
        ));
        let missing = GeoJoinSpec::new("postcode", "enrolled");
        assert!(matches!(
            aggregate_by_zip(&enrollment(), &missing, &EngineConfig::default()),
            Err(EngineError::InvalidSpec(_))
        ));
    }
}
