use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use flume::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::{
  app::{Application, DriverApp, HeadlessApp},
  bench::Bench,
  config::{Backend, Config},
  probe::{Probe, SystemProbe},
  stats::ResultTable,
};

/// What a supervised experiment reports, in order of use. `Done` is always
/// the last message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
  Progress(String),
  Snapshot(ResultTable),
  Error(String),
  Done,
}

/// Where a running experiment reports progress.
#[derive(Clone, Debug, Default)]
pub enum Reporter {
  #[default]
  Log,
  Channel(Sender<Message>),
}

impl Reporter {
  pub fn progress(&self, message: String) {
    info!("{message}");
    self.send(Message::Progress(message));
  }

  pub fn snapshot(&self, table: &ResultTable) {
    if matches!(self, Reporter::Channel(_)) {
      self.send(Message::Snapshot(table.clone()));
    }
  }

  fn send(&self, message: Message) {
    if let Reporter::Channel(tx) = self {
      if tx.send(message).is_err() {
        debug!("supervisor hung up");
      }
    }
  }
}

/// Runs the experiment with `probe` and `app`, turning any failure into an
/// `Error` message. Always ends with `Done`.
pub fn supervise<P: Probe, A: Application>(config: Config, probe: P, app: A, tx: Sender<Message>) {
  let mut bench = Bench::new(config, probe, app).with_reporter(Reporter::Channel(tx.clone()));

  if let Err(err) = bench.bench() {
    error!("experiment failed: {err:#}");
    let _ = tx.send(Message::Error(format!("{err:#}")));
  }

  let _ = tx.send(Message::Done);
}

/// Starts the experiment described by `config` on a worker thread.
pub fn spawn(config: Config) -> Result<(JoinHandle<()>, Receiver<Message>)> {
  let (tx, rx) = flume::unbounded();

  let handle = thread::Builder::new()
    .name("experiment".to_string())
    .spawn(move || {
      let probe = SystemProbe::new();
      match config.backend.clone() {
        Backend::Desktop { driver, .. } => supervise(config, probe, DriverApp::new(driver), tx),
        Backend::Headless {
          soffice, worker_name, ..
        } => supervise(config, probe, HeadlessApp::new(soffice, worker_name), tx),
      }
    })
    .context("spawn worker")?;

  Ok((handle, rx))
}

#[cfg(test)]
mod tests {
  use std::fs;

  use super::*;
  use crate::{
    config::Mode,
    sample::MemorySample,
    testing::{FakeApp, FakeProbe},
  };

  fn config(inputs: &std::path::Path, output: &std::path::Path) -> Config {
    Config {
      inputs: inputs.to_path_buf(),
      output: output.to_path_buf(),
      modes: vec![Mode {
        dir: "value-only".to_string(),
        prefix: "Value ".to_string(),
      }],
      backend: Backend::Desktop {
        driver: Vec::new(),
        process_name: "sheetmem-no-such-process".to_string(),
        trials: 1,
      },
      seed: Some(1),
      ..Config::default()
    }
  }

  #[test]
  fn failure_is_sent_before_done() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = flume::unbounded();

    supervise(
      config(&dir.path().join("missing"), dir.path()),
      FakeProbe::default(),
      FakeApp::new(Some(1)),
      tx,
    );

    let messages: Vec<Message> = rx.drain().collect();
    assert!(matches!(messages.as_slice(), [.., Message::Error(_), Message::Done]));
    assert!(!messages.iter().any(|m| matches!(m, Message::Snapshot(_))));
  }

  #[test]
  fn progress_and_snapshots_precede_done() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    fs::create_dir_all(inputs.join("value-only")).unwrap();
    fs::write(inputs.join("value-only").join("sum-10.xlsx"), b"").unwrap();
    let (tx, rx) = flume::unbounded();

    supervise(
      config(&inputs, &dir.path().join("out")),
      FakeProbe::new([Ok(MemorySample::uniform(3_000_000))]),
      FakeApp::new(Some(1)),
      tx,
    );

    let messages: Vec<Message> = rx.drain().collect();
    assert_eq!(messages.last(), Some(&Message::Done));
    assert!(messages.iter().any(|m| matches!(m, Message::Progress(_))));
    assert!(!messages.iter().any(|m| matches!(m, Message::Error(_))));

    let Some(Message::Snapshot(table)) = messages.iter().rev().find(|m| matches!(m, Message::Snapshot(_))) else {
      panic!("no snapshot in {messages:?}");
    };
    assert_eq!(table.row(10).unwrap()["Value uss (MB)"], Some(3.0));
  }
}
