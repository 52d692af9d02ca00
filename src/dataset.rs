use std::{
  fs,
  path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rand::{seq::SliceRandom, Rng};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetError {
  #[error("{0:?} is not named <instance>-<rows>.<ext>")]
  BadName(String),
  #[error("{name:?}: row count {rows:?} is not an integer")]
  BadRowCount { name: String, rows: String },
}

/// A generated workbook and the number of rows it was generated with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
  pub path: PathBuf,
  pub rows: u64,
}

/// Parses the row count out of a `<instance>-<rows>.<ext>` file name. The row
/// count runs from the first `-` to the first `.`, so the extension may itself
/// contain dots (`sum-10.v2.xlsx`).
pub fn parse_rows(file_name: &str) -> Result<u64, DatasetError> {
  let bad_name = || DatasetError::BadName(file_name.to_string());

  let (instance, rest) = file_name.split_once('-').ok_or_else(bad_name)?;
  let (rows, _ext) = rest.split_once('.').ok_or_else(bad_name)?;
  if instance.is_empty() || instance.contains('.') || rows.contains('-') {
    return Err(bad_name());
  }

  rows.parse().map_err(|_| DatasetError::BadRowCount {
    name: file_name.to_string(),
    rows: rows.to_string(),
  })
}

/// Lists the datasets with extension `ext` in `dir`, in random order.
pub fn list<R: Rng + ?Sized>(dir: &Path, ext: &str, rng: &mut R) -> Result<Vec<Dataset>> {
  let mut datasets = Vec::new();

  for entry in fs::read_dir(dir).with_context(|| format!("read dir {dir:?}"))? {
    let path = entry.context("dir entry")?.path();
    if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ext) {
      continue;
    }

    let name = path.file_name().context("file name")?.to_string_lossy().into_owned();
    let rows = parse_rows(&name)?;
    datasets.push(Dataset { path, rows });
  }

  datasets.shuffle(rng);

  Ok(datasets)
}
