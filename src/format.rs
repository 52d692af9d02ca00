use std::{
  fmt::Write as _,
  fs,
  io::Write as _,
  path::Path,
};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

use crate::stats::ResultTable;

const INDEX_COLUMN: &str = "Rows";
const COLUMN_WIDTH: usize = 14;
const COLUMN_PADDING: &str = "  ";

fn format_header<'a, I: IntoIterator<Item = &'a str>>(columns: I) -> String {
  let header = [INDEX_COLUMN]
    .into_iter()
    .chain(columns)
    .map(|col| format!("{col:<COLUMN_WIDTH$}"))
    .collect::<Vec<_>>()
    .join(COLUMN_PADDING);

  format!("{header}\n{}", "=".repeat(header.len()))
}

/// Renders `table` for the terminal: one block per column, rows ascending.
pub fn format(table: &ResultTable) -> Result<String> {
  let mut out = String::new();

  for column in table.columns() {
    writeln!(out, "{column}")?;
    writeln!(out, "{}", format_header(["value"]))?;

    for (rows, value) in table.series(column) {
      let value = value.map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
      writeln!(
        out,
        "{:<COLUMN_WIDTH$}{COLUMN_PADDING}{value:>COLUMN_WIDTH$}",
        rows.to_string()
      )?;
    }

    writeln!(out)?;
  }

  Ok(out)
}

fn quote(cell: &str) -> String {
  if cell.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", cell.replace('"', "\"\""))
  } else {
    cell.to_string()
  }
}

/// Renders `table` as CSV: a `Rows` index column, then every metric key in
/// sorted order. Absent values are written as `missing`.
pub fn csv(table: &ResultTable, missing: &str) -> Result<String> {
  let columns = table.columns();
  let mut out = String::new();

  let header = [INDEX_COLUMN]
    .into_iter()
    .chain(columns.iter().copied())
    .map(quote)
    .collect::<Vec<_>>()
    .join(",");
  writeln!(out, "{header}")?;

  for (rows, row) in table.rows() {
    let cells = columns.iter().map(|column| match row.get(*column).copied().flatten() {
      Some(value) => value.to_string(),
      None => quote(missing),
    });
    let line = [rows.to_string()].into_iter().chain(cells).collect::<Vec<_>>().join(",");
    writeln!(out, "{line}")?;
  }

  Ok(out)
}

/// Writes `table` to `path` as CSV, replacing any existing file.
pub fn export(table: &ResultTable, path: &Path, missing: &str) -> Result<()> {
  let dir = match path.parent() {
    Some(dir) if !dir.as_os_str().is_empty() => dir,
    _ => Path::new("."),
  };
  fs::create_dir_all(dir).with_context(|| format!("create dir {dir:?}"))?;

  let mut file = NamedTempFile::new_in(dir).context("tempfile")?;
  file.write_all(csv(table, missing)?.as_bytes()).context("write")?;
  file.persist(path).with_context(|| format!("persist {path:?}"))?;

  info!(?path, rows = table.len(), "exported results");

  Ok(())
}
