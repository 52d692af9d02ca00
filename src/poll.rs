use std::{collections::HashSet, fs, path::Path, thread, time::Duration};

use anyhow::{Context, Result};
use chrono::Local;
use serde::{
  ser::{SerializeMap, Serializer},
  Serialize,
};
use tracing::{debug, info, warn};

use crate::{
  collect::CollectError,
  probe::{Probe, ProbeError},
  sample::{Field, MemorySample},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Bounds and pacing of a [`PollingCollector`].
#[derive(Clone, Debug)]
pub struct PollSettings {
  /// Wait between consecutive reads.
  pub interval: Duration,
  /// Unchanged reads required after the first unchanged one.
  pub confirmations: u32,
  /// Reads after which a still-changing process is a timeout.
  pub max_polls: u32,
  /// Resolve-and-read attempts before giving up on finding the process.
  pub max_resolve_attempts: u32,
}

/// Every sample read during one polling run, in read order, keyed by read
/// time. Reads within the same microsecond get a `#<n>` suffix.
#[derive(Clone, Debug, Default)]
pub struct TimeSeries {
  entries: Vec<(String, MemorySample)>,
  keys: HashSet<String>,
}

impl TimeSeries {
  pub fn push(&mut self, sample: MemorySample) {
    self.push_at(Local::now().format(TIMESTAMP_FORMAT).to_string(), sample);
  }

  fn push_at(&mut self, timestamp: String, sample: MemorySample) {
    let mut key = timestamp.clone();
    let mut n = 0;
    while self.keys.contains(&key) {
      n += 1;
      key = format!("{timestamp}#{n}");
    }

    self.keys.insert(key.clone());
    self.entries.push((key, sample));
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Writes the series as a JSON object of timestamp to sample.
  pub fn save(&self, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(self).context("serialize")?;
    fs::write(path, json).with_context(|| format!("write {path:?}"))?;

    Ok(())
  }
}

impl Serialize for TimeSeries {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.entries.len()))?;
    for (timestamp, sample) in &self.entries {
      map.serialize_entry(timestamp, sample)?;
    }
    map.end()
  }
}

/// Samples a process that is only known by name until its unique set size
/// settles. The id is resolved again before every read, since the process
/// may be restarted under a new one at any time.
pub struct PollingCollector<P> {
  probe: P,
  name: String,
  settings: PollSettings,
}

impl<P: Probe> PollingCollector<P> {
  pub fn new(probe: P, name: impl Into<String>, settings: PollSettings) -> Self {
    Self {
      probe,
      name: name.into(),
      settings,
    }
  }

  /// Reads the named process, resolving its id afresh on every attempt.
  pub fn read_resilient(&mut self) -> Result<MemorySample, CollectError> {
    for attempt in 1..=self.settings.max_resolve_attempts {
      let Some(pid) = self.probe.resolve(&self.name) else {
        debug!(name = %self.name, attempt, "process not running");
        continue;
      };

      match self.probe.read(pid) {
        Ok(sample) => return Ok(sample),
        Err(ProbeError::ProcessNotFound(_)) => {
          debug!(name = %self.name, pid, attempt, "process vanished before read");
        }
        Err(err) => return Err(err.into()),
      }
    }

    Err(CollectError::ProcessResolutionTimeout {
      name: self.name.clone(),
      attempts: self.settings.max_resolve_attempts,
    })
  }

  /// Polls until [`Field::Uss`] is unchanged across `confirmations + 1`
  /// consecutive comparisons and returns the final sample. Every read is
  /// appended to `series`, including those of a run that times out.
  pub fn converge(&mut self, series: &mut TimeSeries) -> Result<MemorySample, CollectError> {
    let required = self.settings.confirmations + 1;
    let mut previous: Option<u64> = None;
    let mut stable = 0;

    for poll in 0..self.settings.max_polls {
      if poll > 0 {
        thread::sleep(self.settings.interval);
      }

      let sample = self.read_resilient()?;
      series.push(sample);
      debug!(name = %self.name, poll, %sample, "polled");

      let uss = sample.get(Field::Uss);
      match previous {
        Some(prev) if prev == uss => stable += 1,
        Some(_) => stable = 0,
        None => {}
      }
      previous = Some(uss);

      if stable >= required {
        info!(name = %self.name, polls = poll + 1, uss, "memory settled");
        return Ok(sample);
      }
    }

    warn!(name = %self.name, polls = self.settings.max_polls, "memory never settled");
    Err(CollectError::ConvergenceTimeout {
      field: Field::Uss,
      polls: self.settings.max_polls,
    })
  }
}
