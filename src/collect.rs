use thiserror::Error;
use tracing::debug;

use crate::{
  probe::{Probe, ProbeError},
  sample::{Field, MemorySample, Pid},
  stats::Fragment,
};

#[derive(Debug, Error)]
pub enum CollectError {
  #[error(transparent)]
  Probe(#[from] ProbeError),
  #[error("running sum of {field} overflowed after {count} samples")]
  AggregationOverflow { field: Field, count: u64 },
  #[error("{field} did not converge within {polls} polls")]
  ConvergenceTimeout { field: Field, polls: u32 },
  #[error("no live process named {name:?} after {attempts} attempts")]
  ProcessResolutionTimeout { name: String, attempts: u32 },
}

/// How a collector turns its samples into a result [`Fragment`].
#[derive(Clone, Debug)]
pub struct ReportOptions {
  /// Drop one minimum and one maximum sample before averaging.
  pub smoothing: bool,
  pub prefix: String,
  pub suffix: String,
  /// Every value is divided by this (`1e6` reports megabytes).
  pub normalizer: f64,
}

impl ReportOptions {
  pub fn key(&self, field: Field) -> String {
    format!("{}{}{}", self.prefix, field.name(), self.suffix)
  }

  /// Reports a single sample as-is.
  pub fn sample(&self, sample: &MemorySample) -> Fragment {
    sample
      .iter()
      .map(|(field, bytes)| (self.key(field), Some(bytes as f64 / self.normalizer)))
      .collect()
  }
}

/// Running per-field sum, minimum and maximum over folded samples.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
  count: u64,
  sum: [u128; Field::COUNT],
  min: [u64; Field::COUNT],
  max: [u64; Field::COUNT],
}

impl Default for Aggregate {
  fn default() -> Self {
    Self {
      count: 0,
      sum: [0; Field::COUNT],
      min: [u64::MAX; Field::COUNT],
      max: [0; Field::COUNT],
    }
  }
}

impl Aggregate {
  #[cfg(test)]
  pub fn count(&self) -> u64 {
    self.count
  }

  /// Folds `sample` in. On overflow the aggregate is left untouched.
  pub fn fold(&mut self, sample: &MemorySample) -> Result<(), CollectError> {
    let mut sum = self.sum;
    for (i, (field, bytes)) in sample.iter().enumerate() {
      sum[i] = sum[i]
        .checked_add(u128::from(bytes))
        .ok_or(CollectError::AggregationOverflow {
          field,
          count: self.count,
        })?;
    }

    self.sum = sum;
    for (i, (_, bytes)) in sample.iter().enumerate() {
      self.min[i] = self.min[i].min(bytes);
      self.max[i] = self.max[i].max(bytes);
    }
    self.count += 1;

    Ok(())
  }

  /// Per-field central value in bytes, or `None` when nothing was folded.
  ///
  /// With `smoothing` and at least three samples this is the mean after
  /// dropping one minimum and one maximum sample; otherwise the plain mean.
  pub fn central(&self, smoothing: bool) -> Option<[f64; Field::COUNT]> {
    if self.count == 0 {
      return None;
    }

    let mut out = [0.0; Field::COUNT];
    for (i, value) in out.iter_mut().enumerate() {
      *value = if smoothing && self.count >= 3 {
        let trimmed = self.sum[i] - u128::from(self.min[i]) - u128::from(self.max[i]);
        trimmed as f64 / (self.count - 2) as f64
      } else {
        self.sum[i] as f64 / self.count as f64
      };
    }

    Some(out)
  }
}

/// Collects a fixed number of samples of one process over a trial, one per
/// opened document.
pub struct TrialCollector<P> {
  probe: P,
  aggregate: Aggregate,
}

impl<P: Probe> TrialCollector<P> {
  pub fn new(probe: P) -> Self {
    Self {
      probe,
      aggregate: Aggregate::default(),
    }
  }

  pub fn measure(&mut self, pid: Pid) -> Result<(), CollectError> {
    let sample = self.probe.read(pid)?;
    debug!(pid, %sample, "measured");

    self.aggregate.fold(&sample)
  }

  #[cfg(test)]
  pub fn aggregate(&self) -> &Aggregate {
    &self.aggregate
  }

  pub fn report(&self, options: &ReportOptions) -> Fragment {
    let central = self.aggregate.central(options.smoothing);

    Field::ALL
      .into_iter()
      .enumerate()
      .map(|(i, field)| (options.key(field), central.map(|c| c[i] / options.normalizer)))
      .collect()
  }
}
