use std::{fmt, str::FromStr};

use serde::{
  ser::{SerializeMap, Serializer},
  Serialize,
};

/// A process id as reported by the operating system.
pub type Pid = u32;

/// One memory-accounting counter of a process. The declaration order is the
/// order in which fields are reported and exported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
  PeakNonpagedPool,
  PeakPagedPool,
  PeakPagefile,
  NonpagedPool,
  PagedPool,
  PeakWset,
  Pagefile,
  Private,
  Wset,
  Rss,
  Uss,
  Vms,
}

impl Field {
  pub const COUNT: usize = 12;

  pub const ALL: [Field; Field::COUNT] = [
    Field::PeakNonpagedPool,
    Field::PeakPagedPool,
    Field::PeakPagefile,
    Field::NonpagedPool,
    Field::PagedPool,
    Field::PeakWset,
    Field::Pagefile,
    Field::Private,
    Field::Wset,
    Field::Rss,
    Field::Uss,
    Field::Vms,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Field::PeakNonpagedPool => "peak_nonpaged_pool",
      Field::PeakPagedPool => "peak_paged_pool",
      Field::PeakPagefile => "peak_pagefile",
      Field::NonpagedPool => "nonpaged_pool",
      Field::PagedPool => "paged_pool",
      Field::PeakWset => "peak_wset",
      Field::Pagefile => "pagefile",
      Field::Private => "private",
      Field::Wset => "wset",
      Field::Rss => "rss",
      Field::Uss => "uss",
      Field::Vms => "vms",
    }
  }

  fn index(self) -> usize {
    self as usize
  }
}

impl fmt::Display for Field {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Field {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Field::ALL
      .into_iter()
      .find(|field| field.name() == s)
      .ok_or_else(|| format!("unknown memory field {s:?}"))
  }
}

/// A snapshot of every [`Field`] of one process, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySample {
  values: [u64; Field::COUNT],
}

impl MemorySample {
  pub fn from_fn<F: FnMut(Field) -> u64>(mut f: F) -> Self {
    let mut values = [0; Field::COUNT];
    for field in Field::ALL {
      values[field.index()] = f(field);
    }

    Self { values }
  }

  /// A sample where every field holds `bytes`.
  #[cfg(test)]
  pub fn uniform(bytes: u64) -> Self {
    Self::from_fn(|_| bytes)
  }

  pub fn get(&self, field: Field) -> u64 {
    self.values[field.index()]
  }

  #[cfg(test)]
  pub fn with(mut self, field: Field, bytes: u64) -> Self {
    self.values[field.index()] = bytes;
    self
  }

  pub fn iter(&self) -> impl Iterator<Item = (Field, u64)> + '_ {
    Field::ALL.into_iter().map(|field| (field, self.get(field)))
  }
}

impl fmt::Display for MemorySample {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for (field, bytes) in self.iter() {
      if !first {
        f.write_str(", ")?;
      }
      first = false;
      write!(f, "{field}={bytes}")?;
    }

    Ok(())
  }
}

impl Serialize for MemorySample {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(Field::COUNT))?;
    for (field, bytes) in self.iter() {
      map.serialize_entry(field.name(), &bytes)?;
    }
    map.end()
  }
}
