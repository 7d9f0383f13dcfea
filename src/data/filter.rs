use std::collections::{BTreeMap, BTreeSet};

use super::model::{Dataset, Value};

// ---------------------------------------------------------------------------
// Filter predicate: which unique values are selected per column
// ---------------------------------------------------------------------------

/// Per-column selection state: maps column_name → set of selected values.
/// A column absent from the map imposes no constraint; an empty set hides every row.
pub type FilterState = BTreeMap<String, BTreeSet<Value>>;

/// Initialise a [`FilterState`] with all values selected (i.e., keep everything).
pub fn init_filter_state(dataset: &Dataset) -> FilterState {
    dataset
        .columns()
        .iter()
        .map(|col| (col.name().to_string(), col.unique_values()))
        .collect()
}

/// Return indices of rows that pass all active filters.
///
/// A row passes a column filter when:
/// * The column is not present in `filters` → passes (no constraint)
/// * The filter set for that column is empty → nothing selected → fails
/// * The row's value for that column is in the selected set → passes
///
/// Filters naming a column the dataset does not have are ignored.
pub fn filtered_indices(dataset: &Dataset, filters: &FilterState) -> Vec<usize> {
    let active: Vec<_> = filters
        .iter()
        .filter_map(|(name, selected)| dataset.column(name).map(|col| (col, selected)))
        .collect();

    (0..dataset.num_rows())
        .filter(|&row| {
            active
                .iter()
                .all(|(col, selected)| !selected.is_empty() && selected.contains(col.get(row)))
        })
        .collect()
}

/// New snapshot with only the rows passing `filters`.
pub fn apply_filter(dataset: &Dataset, filters: &FilterState) -> Dataset {
    let kept = filtered_indices(dataset, filters);
    if kept.len() < dataset.num_rows() {
        log::debug!("Filter kept {} of {} row(s)", kept.len(), dataset.num_rows());
    }
    dataset.take_rows(&kept)
}

/// New snapshot without rows that have a missing value in any of `columns`.
pub fn drop_missing(dataset: &Dataset, columns: &[&str]) -> Dataset {
    let checked: Vec<_> = columns.iter().filter_map(|c| dataset.column(c)).collect();
    let kept: Vec<usize> = (0..dataset.num_rows())
        .filter(|&row| checked.iter().all(|col| !col.get(row).is_null()))
        .collect();
    dataset.take_rows(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_rows(
            &["state", "n"],
            vec![
                vec!["CA".into(), 1i64.into()],
                vec!["TX".into(), Value::Null],
                vec!["CA".into(), 3i64.into()],
            ],
        )
        .unwrap()
    }

    #[test]
    fn full_selection_keeps_everything() {
        let ds = dataset();
        let filters = init_filter_state(&ds);
        assert_eq!(filtered_indices(&ds, &filters), vec![0, 1, 2]);
    }

    #[test]
    fn selection_and_empty_selection() {
        let ds = dataset();
        let mut filters = FilterState::new();
        filters.insert("state".to_string(), BTreeSet::from([Value::from("CA")]));
        let out = apply_filter(&ds, &filters);
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.column("n").unwrap().values(), &[Value::Integer(1), Value::Integer(3)]);

        filters.insert("n".to_string(), BTreeSet::new());
        assert!(filtered_indices(&ds, &filters).is_empty());
    }

    #[test]
    fn drop_missing_removes_gaps() {
        let out = drop_missing(&dataset(), &["n"]);
        assert_eq!(out.num_rows(), 2);
        assert_eq!(drop_missing(&dataset(), &["state"]).num_rows(), 3);
    }
}
