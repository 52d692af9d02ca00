use std::{
  ffi::OsStr,
  io::{BufRead, BufReader, Write},
  path::{Path, PathBuf},
  process::{Child, ChildStdin, ChildStdout, Command, Stdio},
  time::Duration,
};

use anyhow::{Context, Result};
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{ext::ChildExt, sample::Pid};

/// How long a driver gets to shut its application down after `quit`.
const QUIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum AppError {
  #[error("application failed to launch: {0}")]
  LaunchFailure(String),
  #[error("automation driver: {0}")]
  Driver(String),
  #[error("application is not running")]
  NotRunning,
}

/// A spreadsheet application that can open and close documents.
pub trait Application {
  /// Launches a fresh instance and returns the id of the process to measure,
  /// when it is known up front.
  fn start(&mut self) -> Result<Option<Pid>>;

  fn open(&mut self, path: &Path) -> Result<()>;

  fn close(&mut self) -> Result<()>;

  /// Stops the instance. Must be safe to call on an instance that was never
  /// started or already stopped.
  fn terminate(&mut self) -> Result<()>;
}

/// A started [`Application`], terminated when dropped.
pub struct Instance<'a, A: Application + ?Sized> {
  app: &'a mut A,
  pid: Option<Pid>,
}

impl<'a, A: Application + ?Sized> Instance<'a, A> {
  pub fn start(app: &'a mut A) -> Result<Self> {
    // Constructed before `start` so a partially launched instance is still torn down.
    let mut instance = Self { app, pid: None };
    instance.pid = instance.app.start().context("start")?;

    Ok(instance)
  }

  pub fn pid(&self) -> Option<Pid> {
    self.pid
  }

  pub fn open(&mut self, path: &Path) -> Result<()> {
    self.app.open(path).with_context(|| format!("open {path:?}"))
  }

  pub fn close(&mut self) -> Result<()> {
    self.app.close().context("close")
  }
}

impl<A: Application + ?Sized> Drop for Instance<'_, A> {
  fn drop(&mut self) {
    if let Err(err) = self.app.terminate() {
      warn!("terminating application: {err:#}");
    }
  }
}

/// Force-terminates every process named exactly like one of `names`.
pub fn kill_by_name<S: AsRef<str>>(names: &[S]) -> usize {
  let mut system = System::new();
  system.refresh_processes(ProcessesToUpdate::All, true);

  let mut killed = 0;
  for name in names {
    let name = name.as_ref();
    for process in system.processes_by_exact_name(OsStr::new(name)) {
      if process.kill() {
        debug!(name, pid = process.pid().as_u32(), "killed");
        killed += 1;
      }
    }
  }

  if killed > 0 {
    info!(killed, "closed lingering application instances");
  }

  killed
}

struct DriverSession {
  child: Child,
  stdin: ChildStdin,
  stdout: BufReader<ChildStdout>,
}

impl DriverSession {
  fn read_line(&mut self) -> Result<String> {
    let mut line = String::new();
    let read = self.stdout.read_line(&mut line).context("read driver")?;
    if read == 0 {
      return Err(AppError::Driver("driver exited".to_string()).into());
    }

    Ok(line.trim().to_string())
  }

  fn send(&mut self, command: &str) -> Result<()> {
    writeln!(self.stdin, "{command}").context("write driver")?;
    self.stdin.flush().context("flush driver")?;

    match self.read_line()?.as_str() {
      "ok" => Ok(()),
      reply => {
        let message = reply.strip_prefix("err").map_or(reply, str::trim);
        Err(AppError::Driver(format!("{command:?} failed: {message}")).into())
      }
    }
  }
}

/// A desktop application reached through an automation driver program.
///
/// The driver owns the application. It prints `pid <n>` once the application
/// is up, then answers each `open <path>`, `close` and `quit` line on stdin
/// with `ok` or `err <message>`.
pub struct DriverApp {
  command: Vec<String>,
  session: Option<DriverSession>,
  quit_timeout: Duration,
}

impl DriverApp {
  pub fn new(command: Vec<String>) -> Self {
    Self {
      command,
      session: None,
      quit_timeout: QUIT_TIMEOUT,
    }
  }

  fn session(&mut self) -> Result<&mut DriverSession> {
    Ok(self.session.as_mut().ok_or(AppError::NotRunning)?)
  }
}

impl Application for DriverApp {
  fn start(&mut self) -> Result<Option<Pid>> {
    self.terminate().context("terminate previous")?;

    let (program, args) = self
      .command
      .split_first()
      .ok_or_else(|| AppError::LaunchFailure("empty driver command".to_string()))?;

    let mut child = Command::new(program)
      .args(args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .spawn()
      .map_err(|e| AppError::LaunchFailure(format!("{program}: {e}")))?;

    let stdin = child.stdin.take().context("stdin")?;
    let stdout = BufReader::new(child.stdout.take().context("stdout")?);
    let session = self.session.insert(DriverSession { child, stdin, stdout });

    let line = session.read_line()?;
    let pid = line
      .strip_prefix("pid ")
      .and_then(|pid| pid.trim().parse::<Pid>().ok())
      .ok_or_else(|| AppError::LaunchFailure(format!("expected `pid <n>` from driver, got {line:?}")))?;

    info!(pid, "application started");
    Ok(Some(pid))
  }

  fn open(&mut self, path: &Path) -> Result<()> {
    self.session()?.send(&format!("open {}", path.display()))
  }

  fn close(&mut self) -> Result<()> {
    self.session()?.send("close")
  }

  fn terminate(&mut self) -> Result<()> {
    let Some(mut session) = self.session.take() else {
      return Ok(());
    };

    // The reply to `quit` is never read. Only the exit is awaited, for at most `quit_timeout`.
    if let Err(err) = writeln!(session.stdin, "quit").and_then(|()| session.stdin.flush()) {
      debug!("driver quit: {err}");
    }
    drop(session.stdin);

    if session.child.check_success_timeout(self.quit_timeout)?.is_none() {
      warn!("driver did not quit in time and was killed");
    }

    Ok(())
  }
}

/// A headless office suite that loads one document per launch.
///
/// The launched process is only a launcher: the process doing the work is a
/// separate worker found by name, so [`Application::start`] cannot report a
/// process id.
pub struct HeadlessApp {
  soffice: PathBuf,
  worker: String,
  launcher: Option<Child>,
}

impl HeadlessApp {
  pub fn new(soffice: PathBuf, worker: String) -> Self {
    Self {
      soffice,
      worker,
      launcher: None,
    }
  }
}

impl Application for HeadlessApp {
  fn start(&mut self) -> Result<Option<Pid>> {
    self.terminate().context("terminate previous")?;

    Ok(None)
  }

  fn open(&mut self, path: &Path) -> Result<()> {
    self.close().context("close previous")?;

    let launcher = Command::new(&self.soffice)
      .args(["--headless", "-o"])
      .arg(path)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn()
      .map_err(|e| AppError::LaunchFailure(format!("{:?}: {e}", self.soffice)))?;

    debug!(pid = launcher.id(), ?path, "launched headless document");
    self.launcher = Some(launcher);

    Ok(())
  }

  fn close(&mut self) -> Result<()> {
    let Some(mut launcher) = self.launcher.take() else {
      return Ok(());
    };

    if let Err(err) = launcher.kill() {
      debug!("launcher already gone: {err}");
    }
    launcher.wait().context("wait launcher")?;

    Ok(())
  }

  fn terminate(&mut self) -> Result<()> {
    self.close()?;
    kill_by_name(&[self.worker.as_str()]);

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::{fs, thread, time::Instant};

  use super::*;
  use crate::testing::{Event, FakeApp};

  #[cfg(unix)]
  fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
  }

  /// A process name unique to this test run, short enough to survive the
  /// kernel's 15 character truncation.
  #[cfg(unix)]
  fn unique_name(tag: &str) -> String {
    format!("sm{tag}{}", std::process::id() % 100_000)
  }

  #[cfg(unix)]
  fn executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
  }

  /// Retries `f` for up to five seconds: a freshly written executable stays busy
  /// (ETXTBSY) while a concurrent test's fork holds its write handle.
  #[cfg(unix)]
  fn retry<T>(mut f: impl FnMut() -> Result<T>) -> T {
    for _ in 0..100 {
      if let Ok(value) = f() {
        return value;
      }
      thread::sleep(Duration::from_millis(50));
    }
    f().unwrap()
  }

  #[cfg(unix)]
  fn spawn_sleep_as(dir: &Path, name: &str) -> Child {
    let path = dir.join(name);
    fs::copy("/bin/sleep", &path).unwrap();

    retry(|| Ok(Command::new(&path).arg("30").spawn()?))
  }

  #[test]
  fn instance_is_terminated_on_drop() {
    let mut app = FakeApp::new(Some(42));
    let events = app.events();

    {
      let mut instance = Instance::start(&mut app).unwrap();
      assert_eq!(instance.pid(), Some(42));
      instance.open(Path::new("a-1.xlsx")).unwrap();
    }

    assert_eq!(
      *events.borrow(),
      [Event::Start, Event::Open("a-1.xlsx".into()), Event::Terminate]
    );
  }

  #[test]
  fn instance_is_terminated_when_start_fails() {
    let mut app = FakeApp::new(None).failing_start();
    let events = app.events();

    assert!(Instance::start(&mut app).is_err());
    assert_eq!(*events.borrow(), [Event::Start, Event::Terminate]);
  }

  #[test]
  fn driver_without_command_fails_to_launch() {
    let mut app = DriverApp::new(Vec::new());
    let err = app.start().unwrap_err();

    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::LaunchFailure(_))));
  }

  #[test]
  fn driver_commands_need_a_running_driver() {
    let mut app = DriverApp::new(vec!["driver".to_string()]);

    assert!(app.open(Path::new("a-1.xlsx")).is_err());
    assert!(app.terminate().is_ok());
  }

  #[cfg(unix)]
  #[test]
  fn driver_protocol_round_trip() {
    let script = r#"echo "pid $$"; while read cmd; do echo ok; [ "$cmd" = quit ] && exit 0; done"#;
    let mut app = DriverApp::new(sh(script));

    let pid = app.start().unwrap();
    assert!(pid.is_some());
    app.open(Path::new("/data/value-only/a-10.xlsx")).unwrap();
    app.close().unwrap();
    app.terminate().unwrap();

    assert!(app.session.is_none());
  }

  #[cfg(unix)]
  #[test]
  fn driver_errors_are_reported() {
    let script = r#"echo "pid $$"; read cmd; echo "err no such workbook"; read cmd; echo ok"#;
    let mut app = DriverApp::new(sh(script));

    app.start().unwrap();
    let err = app.open(Path::new("missing-1.xlsx")).unwrap_err();

    assert!(err.to_string().contains("no such workbook"), "{err}");
    app.terminate().unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn silent_driver_is_killed_after_quit_timeout() {
    let script = r#"echo "pid $$"; read cmd; echo ok; read cmd; exec sleep 45"#;
    let mut app = DriverApp::new(sh(script));
    app.quit_timeout = Duration::from_millis(200);

    app.start().unwrap();
    app.open(Path::new("a-1.xlsx")).unwrap();
    let started = Instant::now();
    app.terminate().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    assert!(app.session.is_none());
  }

  #[cfg(unix)]
  #[test]
  fn lingering_instances_are_killed_by_name() {
    use std::os::unix::process::ExitStatusExt as _;

    let dir = tempfile::tempdir().unwrap();
    let name = unique_name("kill");
    let mut child = spawn_sleep_as(dir.path(), &name);

    assert_eq!(kill_by_name(&[name.as_str()]), 1);
    assert_eq!(child.wait().unwrap().signal(), Some(9));
  }

  #[cfg(unix)]
  #[test]
  fn headless_launcher_and_worker_lifecycle() {
    use std::os::unix::process::ExitStatusExt as _;

    let dir = tempfile::tempdir().unwrap();
    let args = dir.path().join("args");
    let script = format!("#!/bin/sh\necho \"$@\" > '{}'\nexec sleep 30\n", args.display());
    let soffice = executable(dir.path(), "soffice", &script);
    let worker = unique_name("wrk");
    let mut app = HeadlessApp::new(soffice, worker.clone());

    assert_eq!(app.start().unwrap(), None);
    let mut worker_child = spawn_sleep_as(dir.path(), &worker);

    let document = dir.path().join("sum-10.ods");
    retry(|| app.open(&document));
    let launched = retry(|| {
      let line = fs::read_to_string(&args)?;
      anyhow::ensure!(line.ends_with('\n'), "partial write");
      Ok(line)
    });
    assert_eq!(launched, format!("--headless -o {}\n", document.display()));

    let launcher = sysinfo::Pid::from_u32(app.launcher.as_ref().unwrap().id());
    app.close().unwrap();
    assert!(app.launcher.is_none());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[launcher]), true);
    assert!(system.process(launcher).is_none());

    app.terminate().unwrap();
    assert_eq!(worker_child.wait().unwrap().signal(), Some(9));
  }
}
