use std::{
  fmt::Write as _,
  fs,
  path::{Path, PathBuf},
  process::Command,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ext::CommandExt;

/// The file the generator reads its settings from, in its working directory.
const CONFIG_FILE: &str = "config";

/// Settings handed to the external dataset generator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
  /// Generator command line.
  pub command: Vec<String>,
  /// Working directory of the generator (where `config` is written).
  pub workdir: PathBuf,
  /// Name of the workbook family to generate.
  pub instance: String,
  /// Seed for the generator's random values, unseeded when absent.
  pub seed: Option<u64>,
  /// `.xlsx` when true, `.ods` otherwise.
  pub xlsx: bool,
  /// Row count increment between consecutive workbooks.
  pub step: u64,
  /// Row count of the first workbook.
  pub rows: u64,
  pub cols: u64,
  /// Number of workbooks to generate.
  pub iterations: u64,
  /// Generator worker threads.
  pub pool: u64,
  /// Upper bound for generated cell values.
  pub upper: Option<u64>,
}

impl Default for GeneratorConfig {
  fn default() -> Self {
    Self {
      command: vec!["java".to_string(), "-jar".to_string(), "main.jar".to_string()],
      workdir: PathBuf::from("."),
      instance: "CompleteBipartiteSum".to_string(),
      seed: Some(42),
      xlsx: true,
      step: 10_000,
      rows: 0,
      cols: 1,
      iterations: 10,
      pool: 1,
      upper: None,
    }
  }
}

impl GeneratorConfig {
  /// Renders the `KEY=value` file the generator reads, pointing it at `path`.
  pub fn render(&self, path: &Path) -> String {
    let mut out = String::new();
    let seed = self.seed.map(|s| s.to_string()).unwrap_or_default();

    let pairs = [
      ("INST", self.instance.clone()),
      ("PATH", path.to_string_lossy().replace('\\', "/")),
      ("RAND", seed),
      ("XLSX", self.xlsx.to_string()),
      ("STEP", self.step.to_string()),
      ("ROWS", self.rows.to_string()),
      ("COLS", self.cols.to_string()),
      ("ITER", self.iterations.to_string()),
      ("POOL", self.pool.to_string()),
    ];
    for (key, value) in pairs {
      let _ = writeln!(out, "{key}={value}");
    }
    if let Some(upper) = self.upper {
      let _ = writeln!(out, "UPPR={upper}");
    }

    out
  }
}

/// Removes the generator's config file when dropped.
struct ConfigFile(PathBuf);

impl Drop for ConfigFile {
  fn drop(&mut self) {
    if let Err(err) = fs::remove_file(&self.0) {
      warn!("removing {:?}: {err}", self.0);
    }
  }
}

/// Generates datasets into `path` by running the external generator.
pub fn generate(config: &GeneratorConfig, path: &Path) -> Result<()> {
  let (program, args) = config.command.split_first().context("empty generator command")?;

  let file = config.workdir.join(CONFIG_FILE);
  fs::write(&file, config.render(path)).with_context(|| format!("write {file:?}"))?;
  let _file = ConfigFile(file);

  info!(instance = %config.instance, ?path, "generating datasets");
  Command::new(program)
    .args(args)
    .current_dir(&config.workdir)
    .check_success()
    .with_context(|| format!("run {program}"))?;

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_every_key() {
    let config = GeneratorConfig {
      seed: None,
      upper: Some(100),
      ..GeneratorConfig::default()
    };

    assert_eq!(
      config.render(Path::new("out/dataset")),
      "INST=CompleteBipartiteSum\nPATH=out/dataset\nRAND=\nXLSX=true\nSTEP=10000\nROWS=0\nCOLS=1\nITER=10\nPOOL=1\n\
       UPPR=100\n"
    );
  }

  #[cfg(unix)]
  #[test]
  fn config_is_handed_over_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let config = GeneratorConfig {
      command: vec!["sh".to_string(), "-c".to_string(), "cp config seen".to_string()],
      workdir: dir.path().to_path_buf(),
      ..GeneratorConfig::default()
    };

    generate(&config, Path::new("data")).unwrap();

    let seen = fs::read_to_string(dir.path().join("seen")).unwrap();
    assert!(seen.contains("PATH=data\n"));
    assert!(!dir.path().join(CONFIG_FILE).exists());
  }

  #[cfg(unix)]
  #[test]
  fn config_is_removed_when_generator_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = GeneratorConfig {
      command: vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()],
      workdir: dir.path().to_path_buf(),
      ..GeneratorConfig::default()
    };

    assert!(generate(&config, Path::new("data")).is_err());
    assert!(!dir.path().join(CONFIG_FILE).exists());
  }
}
