mod app;
mod bench;
mod collect;
mod config;
mod dataset;
mod ext;
mod format;
mod generate;
mod poll;
mod probe;
mod sample;
mod stats;
mod supervise;
#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use self::{
  app::{DriverApp, HeadlessApp},
  bench::Bench,
  config::{Backend, Config},
  probe::SystemProbe,
  sample::Field,
  stats::ResultTable,
  supervise::Message,
};

#[derive(Parser)]
struct Args {
  /// Log debug output (twice for trace output). Overridden by `RUST_LOG`.
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Measure every dataset and export the results.
  Run {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory holding one subdirectory of datasets per mode.
    #[arg(long)]
    inputs: Option<PathBuf>,
    /// Directory receiving `memory.csv` and the memory curves.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Documents opened per dataset by a desktop backend.
    #[arg(long)]
    trials: Option<u32>,
    /// Seed for the dataset order.
    #[arg(long)]
    seed: Option<u64>,
    /// Run on a worker thread and print the series of this field (e.g. `uss`)
    /// after every dataset.
    #[arg(long)]
    watch: Option<Field>,
  },
  /// Generate datasets into the inputs directory.
  Generate {
    #[arg(short, long)]
    config: Option<PathBuf>,
  },
  /// Print the default configuration.
  Config,
}

fn init_tracing(verbose: u8) {
  let level = match verbose {
    0 => "info",
    1 => "debug",
    _ => "trace",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

  tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
  match path {
    Some(path) => Config::load(&path),
    None => Ok(Config::default()),
  }
}

/// Prints the series of `field` for every mode.
fn print_series(config: &Config, table: &ResultTable, field: Field) {
  for mode in &config.modes {
    let key = format!("{}{}{}", mode.prefix, field, config.suffix);
    let points = table
      .series(&key)
      .into_iter()
      .map(|(rows, value)| match value {
        Some(value) => format!("{rows}:{value:.3}"),
        None => format!("{rows}:-"),
      })
      .collect::<Vec<_>>()
      .join(" ");

    println!("{key}: {points}");
  }
}

fn watch(config: Config, field: Field) -> Result<ResultTable> {
  let (handle, rx) = supervise::spawn(config.clone()).context("spawn")?;

  let mut table = ResultTable::default();
  let mut failure = None;
  for message in rx.iter() {
    match message {
      Message::Progress(line) => println!("{line}"),
      Message::Snapshot(snapshot) => {
        print_series(&config, &snapshot, field);
        table = snapshot;
      }
      Message::Error(err) => failure = Some(err),
      Message::Done => break,
    }
  }

  if handle.join().is_err() {
    anyhow::bail!("experiment worker panicked");
  }
  if let Some(err) = failure {
    anyhow::bail!("{err}");
  }

  Ok(table)
}

fn run(config: Config) -> Result<ResultTable> {
  let probe = SystemProbe::new();

  let results = match config.backend.clone() {
    Backend::Desktop { driver, .. } => {
      let mut bench = Bench::new(config, probe, DriverApp::new(driver));
      bench.bench().context("bench")?;
      bench.results
    }
    Backend::Headless {
      soffice, worker_name, ..
    } => {
      let mut bench = Bench::new(config, probe, HeadlessApp::new(soffice, worker_name));
      bench.bench().context("bench")?;
      bench.results
    }
  };

  Ok(results)
}

fn main() -> Result<()> {
  let args = Args::parse();
  init_tracing(args.verbose);

  match args.command {
    Command::Run {
      config,
      inputs,
      output,
      trials,
      seed,
      watch: watched,
    } => {
      let mut config = load_config(config).context("load config")?;
      if let Some(inputs) = inputs {
        config.inputs = inputs;
      }
      if let Some(output) = output {
        config.output = output;
      }
      if let Some(count) = trials {
        match &mut config.backend {
          Backend::Desktop { trials, .. } => *trials = count,
          Backend::Headless { .. } => anyhow::bail!("--trials only applies to a desktop backend"),
        }
      }
      if seed.is_some() {
        config.seed = seed;
      }

      let results = match watched {
        Some(field) => watch(config, field)?,
        None => run(config)?,
      };

      println!("{}", format::format(&results).context("format")?);
    }
    Command::Generate { config } => {
      let config = load_config(config).context("load config")?;
      let generator = config.generator.unwrap_or_default();

      generate::generate(&generator, &config.inputs).context("generate")?;
    }
    Command::Config => {
      let config = Config {
        generator: Some(Default::default()),
        ..Config::default()
      };

      print!("{}", config.to_toml()?);
    }
  }

  Ok(())
}
