use std::{
  cell::RefCell,
  collections::VecDeque,
  path::{Path, PathBuf},
  rc::Rc,
};

use anyhow::Result;

use crate::{
  app::{AppError, Application},
  probe::{Probe, ProbeError},
  sample::{MemorySample, Pid},
};

/// Replays a scripted sequence of reads.
#[derive(Default)]
pub struct FakeProbe {
  script: VecDeque<Result<MemorySample, ProbeError>>,
  unresolvable: bool,
  resolutions: usize,
  reads: Vec<Pid>,
}

impl FakeProbe {
  pub fn new(script: impl IntoIterator<Item = Result<MemorySample, ProbeError>>) -> Self {
    Self {
      script: script.into_iter().collect(),
      ..Self::default()
    }
  }

  /// A probe on which no process name ever resolves.
  pub fn unresolvable(mut self) -> Self {
    self.unresolvable = true;
    self
  }

  pub fn resolutions(&self) -> usize {
    self.resolutions
  }

  pub fn reads(&self) -> &[Pid] {
    &self.reads
  }
}

impl Probe for FakeProbe {
  fn read(&mut self, pid: Pid) -> Result<MemorySample, ProbeError> {
    self.reads.push(pid);

    self.script.pop_front().unwrap_or(Err(ProbeError::Unreadable {
      pid,
      message: "script exhausted".to_string(),
    }))
  }

  fn resolve(&mut self, _name: &str) -> Option<Pid> {
    self.resolutions += 1;

    (!self.unresolvable).then_some(1)
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
  Start,
  Open(PathBuf),
  Close,
  Terminate,
}

/// Records every call it receives.
pub struct FakeApp {
  pid: Option<Pid>,
  fail_start: bool,
  fail_open: Option<PathBuf>,
  events: Rc<RefCell<Vec<Event>>>,
}

impl FakeApp {
  pub fn new(pid: Option<Pid>) -> Self {
    Self {
      pid,
      fail_start: false,
      fail_open: None,
      events: Rc::default(),
    }
  }

  pub fn failing_start(mut self) -> Self {
    self.fail_start = true;
    self
  }

  /// Fails to open any document whose file name is `name`.
  pub fn failing_open(mut self, name: &str) -> Self {
    self.fail_open = Some(PathBuf::from(name));
    self
  }

  pub fn events(&self) -> Rc<RefCell<Vec<Event>>> {
    Rc::clone(&self.events)
  }

  fn record(&self, event: Event) {
    self.events.borrow_mut().push(event);
  }
}

impl Application for FakeApp {
  fn start(&mut self) -> Result<Option<Pid>> {
    self.record(Event::Start);
    if self.fail_start {
      return Err(AppError::LaunchFailure("scripted".to_string()).into());
    }

    Ok(self.pid)
  }

  fn open(&mut self, path: &Path) -> Result<()> {
    self.record(Event::Open(path.to_path_buf()));
    if self.fail_open.as_deref().is_some_and(|name| path.file_name() == Some(name.as_os_str())) {
      anyhow::bail!("scripted open failure");
    }

    Ok(())
  }

  fn close(&mut self) -> Result<()> {
    self.record(Event::Close);
    Ok(())
  }

  fn terminate(&mut self) -> Result<()> {
    self.record(Event::Terminate);
    Ok(())
  }
}
