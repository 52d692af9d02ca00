use std::ffi::OsStr;

use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tracing::debug;

use crate::sample::{Field, MemorySample, Pid};

#[derive(Debug, Error)]
pub enum ProbeError {
  /// The id does not (or no longer) resolve to a live process.
  #[error("process {0} not found")]
  ProcessNotFound(Pid),
  #[error("reading counters of process {pid}: {message}")]
  Unreadable { pid: Pid, message: String },
}

/// A source of [`MemorySample`]s for live processes.
pub trait Probe {
  fn read(&mut self, pid: Pid) -> Result<MemorySample, ProbeError>;

  /// Returns the first live process whose name contains `name`.
  fn resolve(&mut self, name: &str) -> Option<Pid>;
}

impl<P: Probe + ?Sized> Probe for &mut P {
  fn read(&mut self, pid: Pid) -> Result<MemorySample, ProbeError> {
    (**self).read(pid)
  }

  fn resolve(&mut self, name: &str) -> Option<Pid> {
    (**self).resolve(name)
  }
}

/// Enumerates processes through `sysinfo` and fills in the counters from
/// `/proc` on Linux and `GetProcessMemoryInfo` on Windows.
pub struct SystemProbe {
  system: System,
}

impl SystemProbe {
  pub fn new() -> Self {
    Self { system: System::new() }
  }
}

impl Default for SystemProbe {
  fn default() -> Self {
    Self::new()
  }
}

impl Probe for SystemProbe {
  fn read(&mut self, pid: Pid) -> Result<MemorySample, ProbeError> {
    let sys_pid = sysinfo::Pid::from_u32(pid);
    self.system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

    let process = self.system.process(sys_pid).ok_or(ProbeError::ProcessNotFound(pid))?;
    let resident = process.memory();
    let virtual_memory = process.virtual_memory();

    platform::read(pid, resident, virtual_memory)
  }

  fn resolve(&mut self, name: &str) -> Option<Pid> {
    self.system.refresh_processes(ProcessesToUpdate::All, true);

    let pid = self
      .system
      .processes_by_name(OsStr::new(name))
      .map(|process| process.pid().as_u32())
      .min();

    debug!(name, ?pid, "resolved process by name");
    pid
  }
}

#[cfg(target_os = "linux")]
mod platform {
  use procfs::{process::Process, ProcError};

  use super::*;

  const KIB: u64 = 1024;

  fn convert(pid: Pid, err: ProcError) -> ProbeError {
    match err {
      ProcError::NotFound(_) => ProbeError::ProcessNotFound(pid),
      err => ProbeError::Unreadable {
        pid,
        message: err.to_string(),
      },
    }
  }

  pub fn read(pid: Pid, resident: u64, virtual_memory: u64) -> Result<MemorySample, ProbeError> {
    let process = Process::new(pid as i32).map_err(|e| convert(pid, e))?;
    let status = process.status().map_err(|e| convert(pid, e))?;
    let rollup = process.smaps_rollup().map_err(|e| convert(pid, e))?;

    let private_pages: u64 = rollup
      .memory_map_rollup
      .iter()
      .map(|map| {
        let stats = &map.extension.map;
        stats.get("Private_Clean").copied().unwrap_or(0) + stats.get("Private_Dirty").copied().unwrap_or(0)
      })
      .sum();

    let rss = status.vmrss.map_or(resident, |kb| kb * KIB);
    let swap = status.vmswap.unwrap_or(0) * KIB;
    let anon = status.rssanon.unwrap_or(0) * KIB;

    Ok(MemorySample::from_fn(|field| match field {
      Field::PeakNonpagedPool | Field::PeakPagedPool | Field::NonpagedPool | Field::PagedPool => 0,
      Field::PeakPagefile | Field::Pagefile => swap,
      Field::PeakWset => status.vmhwm.map_or(rss, |kb| kb * KIB),
      Field::Private => anon + swap,
      Field::Wset | Field::Rss => rss,
      Field::Uss => private_pages,
      Field::Vms => virtual_memory,
    }))
  }
}

#[cfg(windows)]
mod platform {
  use std::mem::size_of;

  use windows::Win32::{
    Foundation::CloseHandle,
    System::{
      ProcessStatus::{GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS, PROCESS_MEMORY_COUNTERS_EX},
      Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ},
    },
  };

  use super::*;

  pub fn read(pid: Pid, _resident: u64, _virtual_memory: u64) -> Result<MemorySample, ProbeError> {
    let mut counters = PROCESS_MEMORY_COUNTERS_EX {
      cb: size_of::<PROCESS_MEMORY_COUNTERS_EX>() as u32,
      ..Default::default()
    };

    // SAFETY: the handle is closed before returning and `counters` is sized by `cb`.
    unsafe {
      let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ, false, pid)
        .map_err(|_| ProbeError::ProcessNotFound(pid))?;

      let result = GetProcessMemoryInfo(
        handle,
        &mut counters as *mut PROCESS_MEMORY_COUNTERS_EX as *mut PROCESS_MEMORY_COUNTERS,
        counters.cb,
      );
      let _ = CloseHandle(handle);

      result.map_err(|e| ProbeError::Unreadable {
        pid,
        message: e.to_string(),
      })?;
    }

    let c = counters;
    Ok(MemorySample::from_fn(|field| {
      (match field {
        Field::PeakNonpagedPool => c.QuotaPeakNonPagedPoolUsage,
        Field::PeakPagedPool => c.QuotaPeakPagedPoolUsage,
        Field::PeakPagefile => c.PeakPagefileUsage,
        Field::NonpagedPool => c.QuotaNonPagedPoolUsage,
        Field::PagedPool => c.QuotaPagedPoolUsage,
        Field::PeakWset => c.PeakWorkingSetSize,
        Field::Pagefile | Field::Vms => c.PagefileUsage,
        Field::Private | Field::Uss => c.PrivateUsage,
        Field::Wset | Field::Rss => c.WorkingSetSize,
      }) as u64
    }))
  }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod platform {
  use super::*;

  pub fn read(_pid: Pid, resident: u64, virtual_memory: u64) -> Result<MemorySample, ProbeError> {
    Ok(MemorySample::from_fn(|field| match field {
      Field::PeakWset | Field::Wset | Field::Rss | Field::Uss => resident,
      Field::Vms => virtual_memory,
      _ => 0,
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_own_process() {
    let mut probe = SystemProbe::new();
    let sample = probe.read(std::process::id()).unwrap();

    assert!(sample.get(Field::Rss) > 0);
    assert!(sample.get(Field::Vms) >= sample.get(Field::Rss));
  }

  #[test]
  fn missing_process_is_not_found() {
    let mut probe = SystemProbe::new();

    assert!(matches!(probe.read(u32::MAX - 1), Err(ProbeError::ProcessNotFound(_))));
  }
}
