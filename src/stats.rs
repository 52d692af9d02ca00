use std::collections::{BTreeMap, BTreeSet};

/// Metric key (e.g. `"Value peak_wset (MB)"`) to value, `None` when nothing
/// was measured.
pub type Fragment = BTreeMap<String, Option<f64>>;

/// All metrics recorded for one dataset size, across benchmarking modes.
pub type ResultRow = Fragment;

/// Results of one experiment run, keyed by dataset row count.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultTable {
  rows: BTreeMap<u64, ResultRow>,
}

impl ResultTable {
  /// Merges `fragment` into the row for `rows`. Keys already in the row that
  /// `fragment` does not mention are kept.
  pub fn merge(&mut self, rows: u64, fragment: Fragment) {
    self.rows.entry(rows).or_default().extend(fragment);
  }

  #[cfg(test)]
  pub fn row(&self, rows: u64) -> Option<&ResultRow> {
    self.rows.get(&rows)
  }

  /// Rows in ascending row-count order.
  pub fn rows(&self) -> impl Iterator<Item = (u64, &ResultRow)> {
    self.rows.iter().map(|(rows, row)| (*rows, row))
  }

  /// The union of metric keys over every row, sorted.
  pub fn columns(&self) -> BTreeSet<&str> {
    self.rows.values().flat_map(|row| row.keys().map(String::as_str)).collect()
  }

  /// Row counts and values of `key`, for rows that have it.
  pub fn series(&self, key: &str) -> Vec<(u64, Option<f64>)> {
    self
      .rows()
      .filter_map(|(rows, row)| row.get(key).map(|value| (rows, *value)))
      .collect()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }
}
