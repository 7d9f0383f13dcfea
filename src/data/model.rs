use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ---------------------------------------------------------------------------
// Value – a single cell of a column
// ---------------------------------------------------------------------------

/// A dynamically-typed cell value mirroring what a CSV / JSON / Parquet
/// upload can hold. `Null` is the one and only "missing" marker.
/// Used as a key in `BTreeMap` / `BTreeSet` downstream, so `Value` must be `Ord`.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    DateTime(NaiveDateTime),
    /// Multi-valued cell (JSON array, Parquet list).
    List(Vec<Value>),
}

/// Runtime type of a non-missing cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKind {
    Bool,
    Integer,
    Float,
    String,
    DateTime,
    List,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::DateTime => "datetime",
            ValueKind::List => "list",
        };
        f.write_str(name)
    }
}

// -- Manual Eq/Ord so Value can live in BTreeSet / BTreeMap keys --

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use Value::*;
        fn discriminant(v: &Value) -> u8 {
            match v {
                Null => 0,
                Bool(_) => 1,
                Integer(_) => 2,
                Float(_) => 3,
                String(_) => 4,
                DateTime(_) => 5,
                List(_) => 6,
            }
        }
        let da = discriminant(self);
        let db = discriminant(other);
        if da != db {
            return da.cmp(&db);
        }
        match (self, other) {
            (Bool(a), Bool(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::DateTime(d) => d.hash(state),
            Value::List(items) => items.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text(",") {
            Some(text) => f.write_str(&text),
            None => f.write_str("<null>"),
        }
    }
}

impl Value {
    /// Build a float cell; `NaN` is folded into `Null`.
    pub fn float(v: f64) -> Value {
        if v.is_nan() {
            Value::Null
        } else {
            Value::Float(v)
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Runtime type of the cell, `None` when missing.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Integer(_) => Some(ValueKind::Integer),
            Value::Float(_) => Some(ValueKind::Float),
            Value::String(_) => Some(ValueKind::String),
            Value::DateTime(_) => Some(ValueKind::DateTime),
            Value::List(_) => Some(ValueKind::List),
        }
    }

    /// Numeric view of the cell (integers widen to `f64`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Canonical text form of the cell. Lists are joined with `separator`.
    /// Missing cells have no text.
    pub fn to_text(&self, separator: &str) -> Option<String> {
        let text = match self {
            Value::Null => return None,
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(v) => format_float(*v),
            Value::String(s) => s.clone(),
            Value::DateTime(d) => {
                if d.time() == NaiveTime::MIN {
                    d.format("%Y-%m-%d").to_string()
                } else {
                    d.format("%Y-%m-%d %H:%M:%S").to_string()
                }
            }
            Value::List(items) => items
                .iter()
                .filter_map(|item| item.to_text(separator))
                .collect::<Vec<_>>()
                .join(separator),
        };
        Some(text)
    }
}

/// Integral floats keep one decimal (`2.0`) so they stay distinguishable
/// from integers once stringified.
fn format_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::float(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(d: NaiveDateTime) -> Self {
        Value::DateTime(d)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// DeclaredType / ColumnTypeSpec
// ---------------------------------------------------------------------------

/// Type a caller may assign to a column to settle a mixed-type ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeclaredType {
    String,
    NumericInteger,
    NumericFloat,
    Datetime,
}

impl DeclaredType {
    pub fn is_numeric(self) -> bool {
        match self {
            DeclaredType::NumericInteger | DeclaredType::NumericFloat => true,
            DeclaredType::String | DeclaredType::Datetime => false,
        }
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeclaredType::String => "string",
            DeclaredType::NumericInteger => "numeric-integer",
            DeclaredType::NumericFloat => "numeric-float",
            DeclaredType::Datetime => "datetime",
        };
        f.write_str(name)
    }
}

impl FromStr for DeclaredType {
    type Err = EngineError;

    /// Accepts the canonical names plus the short `str` / `int` / `float` aliases.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(DeclaredType::String),
            "numeric-integer" | "integer" | "int" => Ok(DeclaredType::NumericInteger),
            "numeric-float" | "float" => Ok(DeclaredType::NumericFloat),
            "datetime" | "date" => Ok(DeclaredType::Datetime),
            other => Err(EngineError::InvalidSpec(format!(
                "unknown declared type '{other}' (expected string, numeric-integer, numeric-float or datetime)"
            ))),
        }
    }
}

/// Column name → declared type. Built per reconciliation pass and then dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnTypeSpec(BTreeMap<String, DeclaredType>);

impl ColumnTypeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style declaration.
    pub fn with(mut self, column: impl Into<String>, ty: DeclaredType) -> Self {
        self.0.insert(column.into(), ty);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, ty: DeclaredType) {
        self.0.insert(column.into(), ty);
    }

    pub fn get(&self, column: &str) -> Option<DeclaredType> {
        self.0.get(column).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DeclaredType)> {
        self.0.iter().map(|(name, ty)| (name.as_str(), *ty))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Parse `column=type` assignments, e.g. `zip=str`.
    pub fn parse_assignments<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let mut spec = ColumnTypeSpec::new();
        for item in items {
            let item = item.as_ref();
            let (column, ty) = item.rsplit_once('=').ok_or_else(|| {
                EngineError::InvalidSpec(format!("expected column=type, got '{item}'"))
            })?;
            if column.is_empty() {
                return Err(EngineError::InvalidSpec(format!(
                    "missing column name in '{item}'"
                )));
            }
            spec.insert(column, ty.parse()?);
        }
        Ok(spec)
    }
}

// ---------------------------------------------------------------------------
// Column – a named sequence of cells
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    values: Vec<Value>,
    /// Set once reconciliation has applied a declared type.
    declared: Option<DeclaredType>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Column {
            name: name.into(),
            values,
            declared: None,
        }
    }

    pub fn with_declared(mut self, ty: DeclaredType) -> Self {
        self.declared = Some(ty);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, row: usize) -> &Value {
        &self.values[row]
    }

    pub fn declared(&self) -> Option<DeclaredType> {
        self.declared
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Distinct runtime types among non-missing cells.
    pub fn kinds(&self) -> BTreeSet<ValueKind> {
        self.values.iter().filter_map(Value::kind).collect()
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// Numeric by declaration, or (undeclared) every non-missing cell is a number.
    pub fn is_numeric(&self) -> bool {
        match self.declared {
            Some(ty) => ty.is_numeric(),
            None => {
                let kinds = self.kinds();
                !kinds.is_empty()
                    && kinds
                        .iter()
                        .all(|k| matches!(k, ValueKind::Integer | ValueKind::Float))
            }
        }
    }

    /// Sorted set of distinct values (including `Null` when present).
    pub fn unique_values(&self) -> BTreeSet<Value> {
        self.values.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Dataset – an immutable snapshot of named columns
// ---------------------------------------------------------------------------

/// Ordered, uniquely-named columns of equal length. Every transformation
/// returns a new `Dataset`; snapshots are never mutated in place.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    columns: Vec<Column>,
    num_rows: usize,
}

impl Dataset {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for col in &columns {
            if !seen.insert(col.name()) {
                return Err(EngineError::InvalidDataset(format!(
                    "duplicate column name '{}'",
                    col.name()
                )));
            }
        }
        let num_rows = columns.first().map(Column::len).unwrap_or(0);
        if let Some(ragged) = columns.iter().find(|c| c.len() != num_rows) {
            return Err(EngineError::InvalidDataset(format!(
                "column '{}' has {} rows, expected {num_rows}",
                ragged.name(),
                ragged.len()
            )));
        }
        Ok(Dataset { columns, num_rows })
    }

    /// Build from row-oriented data; every row must have one value per name.
    pub fn from_rows(names: &[&str], rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut values: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != names.len() {
                return Err(EngineError::InvalidDataset(format!(
                    "row {i} has {} values, expected {}",
                    row.len(),
                    names.len()
                )));
            }
            for (slot, value) in values.iter_mut().zip(row) {
                slot.push(value);
            }
        }
        Dataset::new(
            names
                .iter()
                .zip(values)
                .map(|(name, vals)| Column::new(*name, vals))
                .collect(),
        )
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    /// Look up a column or fail with an `InvalidSpec` naming it.
    pub fn require(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| EngineError::InvalidSpec(format!("unknown column '{name}'")))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(Column::name).collect()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// New snapshot with `column` replacing the same-named column (position
    /// kept) or appended at the end.
    pub fn with_column(&self, column: Column) -> Result<Dataset> {
        let mut columns = self.columns.clone();
        match columns.iter().position(|c| c.name() == column.name()) {
            Some(idx) => columns[idx] = column,
            None => columns.push(column),
        }
        Dataset::new(columns)
    }

    /// New snapshot holding only the given rows, in the given order.
    pub fn take_rows(&self, indices: &[usize]) -> Dataset {
        let columns = self
            .columns
            .iter()
            .map(|c| Column {
                name: c.name.clone(),
                values: indices.iter().map(|&i| c.values[i].clone()).collect(),
                declared: c.declared,
            })
            .collect();
        Dataset {
            columns,
            num_rows: indices.len(),
        }
    }

    /// Cells of one row, in column order.
    pub fn row(&self, idx: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| c.get(idx)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_rejects_duplicate_and_ragged_columns() {
        let dup = Dataset::new(vec![
            Column::new("a", vec![Value::Integer(1)]),
            Column::new("a", vec![Value::Integer(2)]),
        ]);
        assert!(matches!(dup, Err(EngineError::InvalidDataset(_))));

        let ragged = Dataset::new(vec![
            Column::new("a", vec![Value::Integer(1)]),
            Column::new("b", vec![]),
        ]);
        assert!(matches!(ragged, Err(EngineError::InvalidDataset(_))));
    }

    #[test]
    fn with_column_returns_new_snapshot() {
        let ds = Dataset::from_rows(&["a", "b"], vec![vec![1i64.into(), "x".into()]]).unwrap();
        let next = ds
            .with_column(Column::new("a", vec![Value::Integer(9)]))
            .unwrap();

        assert_eq!(ds.column("a").unwrap().get(0), &Value::Integer(1));
        assert_eq!(next.column("a").unwrap().get(0), &Value::Integer(9));
        assert_eq!(next.column_names(), vec!["a", "b"]);
    }

    #[test]
    fn canonical_text_forms() {
        assert_eq!(Value::Float(2.0).to_text(","), Some("2.0".to_string()));
        assert_eq!(Value::Float(2.5).to_text(","), Some("2.5".to_string()));
        assert_eq!(
            Value::List(vec![Value::Integer(1), "a".into()]).to_text(","),
            Some("1,a".to_string())
        );
        assert_eq!(Value::Null.to_text(","), None);
        assert!(Value::float(f64::NAN).is_null());
    }

    #[test]
    fn declared_type_aliases_parse() {
        assert_eq!("str".parse::<DeclaredType>().unwrap(), DeclaredType::String);
        assert_eq!("int".parse::<DeclaredType>().unwrap(), DeclaredType::NumericInteger);
        assert_eq!("float".parse::<DeclaredType>().unwrap(), DeclaredType::NumericFloat);
        assert!("Default".parse::<DeclaredType>().is_err());

        let spec = ColumnTypeSpec::parse_assignments(&["zip=str", "amount=numeric-float"]).unwrap();
        assert_eq!(spec.get("zip"), Some(DeclaredType::String));
        assert_eq!(spec.get("amount"), Some(DeclaredType::NumericFloat));
        assert!(ColumnTypeSpec::parse_assignments(&["zip"]).is_err());
    }

    #[test]
    fn numeric_detection_ignores_missing() {
        let col = Column::new("n", vec![Value::Integer(1), Value::Null, Value::Float(2.5)]);
        assert!(col.is_numeric());
        let text = Column::new("t", vec![Value::Integer(1), "x".into()]);
        assert!(!text.is_numeric());
        assert!(!Column::new("empty", vec![Value::Null]).is_numeric());
    }
}
