use std::{
  fs,
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{generate::GeneratorConfig, poll::PollSettings};

/// A directory of datasets measured under one set of metric keys.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mode {
  /// Subdirectory of the inputs directory.
  pub dir: String,
  /// Prepended to every metric key reported for this mode.
  pub prefix: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
  pub interval_ms: u64,
  pub confirmations: u32,
  pub max_polls: u32,
  pub max_resolve_attempts: u32,
}

impl Default for PollConfig {
  fn default() -> Self {
    Self {
      interval_ms: 1000,
      confirmations: 5,
      max_polls: 3600,
      max_resolve_attempts: 1000,
    }
  }
}

impl PollConfig {
  pub fn settings(&self) -> PollSettings {
    PollSettings {
      interval: Duration::from_millis(self.interval_ms),
      confirmations: self.confirmations,
      max_polls: self.max_polls,
      max_resolve_attempts: self.max_resolve_attempts,
    }
  }
}

/// The application under measurement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Backend {
  /// A desktop application behind an automation driver, sampled once per
  /// opened document.
  Desktop {
    driver: Vec<String>,
    #[serde(default = "default_process_name")]
    process_name: String,
    #[serde(default = "default_trials")]
    trials: u32,
  },
  /// A headless office daemon, polled until its memory settles.
  Headless {
    #[serde(default = "default_soffice")]
    soffice: PathBuf,
    #[serde(default = "default_launcher_name")]
    launcher_name: String,
    #[serde(default = "default_worker_name")]
    worker_name: String,
    #[serde(default)]
    poll: PollConfig,
  },
}

fn default_process_name() -> String {
  "EXCEL.EXE".to_string()
}

fn default_trials() -> u32 {
  10
}

fn default_soffice() -> PathBuf {
  PathBuf::from("soffice")
}

/// The process name the `soffice` launcher shows up under.
fn default_launcher_name() -> String {
  let name = if cfg!(windows) {
    "soffice.exe"
  } else if cfg!(target_os = "linux") {
    // The `soffice` shell script execs `oosplash`.
    "oosplash"
  } else {
    "soffice"
  };

  name.to_string()
}

fn default_worker_name() -> String {
  "soffice.bin".to_string()
}

impl Default for Backend {
  fn default() -> Self {
    Backend::Desktop {
      driver: vec!["excel-driver".to_string()],
      process_name: default_process_name(),
      trials: default_trials(),
    }
  }
}

impl Backend {
  /// Extension of the dataset files this backend opens.
  pub fn extension(&self) -> &'static str {
    match self {
      Backend::Desktop { .. } => "xlsx",
      Backend::Headless { .. } => "ods",
    }
  }

  /// Names of the processes left behind by an interrupted run.
  pub fn kill_names(&self) -> Vec<String> {
    match self {
      Backend::Desktop { process_name, .. } => vec![process_name.clone()],
      Backend::Headless {
        launcher_name,
        worker_name,
        ..
      } => vec![launcher_name.clone(), worker_name.clone()],
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Directory holding one subdirectory of datasets per mode.
  pub inputs: PathBuf,
  /// Directory receiving the result table and the memory curves.
  pub output: PathBuf,
  /// Trimmed instead of plain means for fixed-trial reports.
  pub smoothing: bool,
  pub suffix: String,
  pub normalizer: f64,
  /// Written for absent values in the exported table.
  pub missing: String,
  /// Seeds the dataset order; random when absent.
  pub seed: Option<u64>,
  /// Pause after each headless file, letting the daemon wind down.
  pub settle_ms: u64,
  pub modes: Vec<Mode>,
  pub backend: Backend,
  pub generator: Option<GeneratorConfig>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      inputs: PathBuf::from("datasets"),
      output: PathBuf::from("results"),
      smoothing: true,
      suffix: " (MB)".to_string(),
      normalizer: 1e6,
      missing: String::new(),
      seed: None,
      settle_ms: 500,
      modes: vec![
        Mode {
          dir: "value-only".to_string(),
          prefix: "Value ".to_string(),
        },
        Mode {
          dir: "formula-value".to_string(),
          prefix: "Formula ".to_string(),
        },
      ],
      backend: Backend::default(),
      generator: None,
    }
  }
}

impl Config {
  pub fn load(path: &Path) -> Result<Self> {
    let text = fs::read_to_string(path).with_context(|| format!("read {path:?}"))?;

    toml::from_str(&text).with_context(|| format!("parse {path:?}"))
  }

  pub fn to_toml(&self) -> Result<String> {
    toml::to_string_pretty(self).context("serialize config")
  }

  /// The result table destination.
  pub fn table_path(&self) -> PathBuf {
    self.output.join("memory.csv")
  }

  /// Where the memory curves of `mode` are written.
  pub fn curve_dir(&self, mode: &Mode) -> PathBuf {
    self.output.join(format!("{}-mem-curve", mode.dir))
  }
}
