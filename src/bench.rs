use std::{
  fs,
  thread,
  time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
  app::{kill_by_name, AppError, Application, Instance},
  collect::{ReportOptions, TrialCollector},
  config::{Backend, Config, Mode},
  dataset::{self, Dataset},
  format,
  generate,
  poll::{PollSettings, PollingCollector, TimeSeries},
  probe::Probe,
  sample::Field,
  stats::{Fragment, ResultTable},
  supervise::Reporter,
};

/// Formats `elapsed` as `HH:MM:SS`.
pub fn format_elapsed(elapsed: Duration) -> String {
  let secs = elapsed.as_secs();

  format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

pub struct Bench<P, A> {
  config: Config,
  probe: P,
  app: A,
  /// Shuffles the dataset order of every directory.
  rng: StdRng,
  reporter: Reporter,
  /// Results merged over every mode, keyed by dataset row count.
  pub results: ResultTable,
}

impl<P: Probe, A: Application> Bench<P, A> {
  pub fn new(config: Config, probe: P, app: A) -> Self {
    let rng = match config.seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };

    Self {
      config,
      probe,
      app,
      rng,
      reporter: Reporter::Log,
      results: ResultTable::default(),
    }
  }

  pub fn with_reporter(mut self, reporter: Reporter) -> Self {
    self.reporter = reporter;
    self
  }

  /// Measures every dataset of every mode, then exports the merged results.
  pub fn bench(&mut self) -> Result<()> {
    let start = Instant::now();

    self.prepare_inputs().context("prepare inputs")?;
    fs::create_dir_all(&self.config.output).with_context(|| format!("create dir {:?}", self.config.output))?;
    kill_by_name(&self.config.backend.kill_names());

    for mode in self.config.modes.clone() {
      self.run_directory(&mode).with_context(|| format!("mode {}", mode.dir))?;
    }

    if self.results.is_empty() {
      warn!(inputs = ?self.config.inputs, "no datasets measured");
    }
    format::export(&self.results, &self.config.table_path(), &self.config.missing).context("export")?;

    let elapsed = format_elapsed(start.elapsed());
    self.reporter.progress(format!("experiment finished in {elapsed}"));

    Ok(())
  }

  fn prepare_inputs(&self) -> Result<()> {
    let inputs = &self.config.inputs;
    if inputs.exists() {
      return Ok(());
    }

    let Some(generator) = &self.config.generator else {
      anyhow::bail!("{inputs:?} does not exist and no generator is configured");
    };

    self.reporter.progress(format!("generating datasets into {inputs:?}"));
    generate::generate(generator, inputs)
  }

  /// Measures every dataset of `mode`, in random order.
  pub fn run_directory(&mut self, mode: &Mode) -> Result<()> {
    let dir = self.config.inputs.join(&mode.dir);
    let datasets = dataset::list(&dir, self.config.backend.extension(), &mut self.rng).context("list datasets")?;
    self.reporter.progress(format!("{}: {} datasets", mode.dir, datasets.len()));

    if let Backend::Headless { .. } = self.config.backend {
      let curves = self.config.curve_dir(mode);
      fs::create_dir_all(&curves).with_context(|| format!("create dir {curves:?}"))?;
    }

    for dataset in &datasets {
      self.run_one_file(dataset, mode).with_context(|| format!("{:?}", dataset.path))?;
    }

    Ok(())
  }

  /// Measures one dataset on a fresh application instance and merges the
  /// report into the row for its row count.
  pub fn run_one_file(&mut self, dataset: &Dataset, mode: &Mode) -> Result<()> {
    self.reporter.progress(format!("{}: opening {:?}", mode.dir, dataset.path));

    let options = ReportOptions {
      smoothing: self.config.smoothing,
      prefix: mode.prefix.clone(),
      suffix: self.config.suffix.clone(),
      normalizer: self.config.normalizer,
    };

    let fragment = match self.config.backend.clone() {
      Backend::Desktop { trials, .. } => self.run_trials(dataset, trials, &options)?,
      Backend::Headless { worker_name, poll, .. } => {
        let fragment = self.run_polling(dataset, mode, &worker_name, poll.settings(), &options)?;
        thread::sleep(Duration::from_millis(self.config.settle_ms));
        fragment
      }
    };

    debug!(rows = dataset.rows, ?fragment, "file done");
    let uss = fragment
      .get(&options.key(Field::Uss))
      .copied()
      .flatten()
      .map_or_else(|| "-".to_string(), |v| format!("{v:.3}"));
    self.reporter.progress(format!("{}: {} rows done, uss {uss}", mode.dir, dataset.rows));

    self.results.merge(dataset.rows, fragment);
    self.reporter.snapshot(&self.results);

    Ok(())
  }

  fn run_trials(&mut self, dataset: &Dataset, trials: u32, options: &ReportOptions) -> Result<Fragment> {
    let mut instance = Instance::start(&mut self.app)?;
    let pid = instance
      .pid()
      .ok_or_else(|| AppError::LaunchFailure("no process id reported".to_string()))?;

    let mut collector = TrialCollector::new(&mut self.probe);
    for trial in 0..trials {
      instance.open(&dataset.path)?;
      collector.measure(pid).with_context(|| format!("trial {trial}"))?;
      instance.close()?;
    }

    info!(rows = dataset.rows, trials, "trials done");
    Ok(collector.report(options))
  }

  fn run_polling(
    &mut self,
    dataset: &Dataset,
    mode: &Mode,
    worker: &str,
    settings: PollSettings,
    options: &ReportOptions,
  ) -> Result<Fragment> {
    let mut instance = Instance::start(&mut self.app)?;
    instance.open(&dataset.path)?;

    let mut series = TimeSeries::default();
    let converged = PollingCollector::new(&mut self.probe, worker, settings).converge(&mut series);

    // The curve is kept even when memory never settled.
    let stem = dataset.path.file_stem().context("file stem")?.to_string_lossy();
    let curve = self.config.curve_dir(mode).join(format!("{stem}.json"));
    let saved = series.save(&curve).context("save memory curve");
    debug!(reads = series.len(), ?curve, "memory curve saved");

    let sample = converged.context("converge")?;
    saved?;
    instance.close()?;

    Ok(options.sample(&sample))
  }
}
