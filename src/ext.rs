use std::{
  process::{Child, Command, ExitStatus},
  time::Duration,
};

use anyhow::{Context, Result};
use wait_timeout::ChildExt as WaitExt;

#[extend::ext]
pub impl ExitStatus {
  fn check_success(&self) -> Result<()> {
    if !self.success() {
      anyhow::bail!("exited with non-zero status {self}");
    }

    Ok(())
  }
}

#[extend::ext]
pub impl Child {
  /// Returns an error if the exit status was non-zero. On timeout, kills the
  /// child and returns `Ok(None)`.
  fn check_success_timeout(&mut self, timeout: Duration) -> Result<Option<()>> {
    let Some(status) = self.wait_timeout(timeout).context("wait")? else {
      self.kill().context("kill after timeout")?;
      self.wait().context("wait after kill")?;

      return Ok(None);
    };

    status.check_success()?;

    Ok(Some(()))
  }
}

#[extend::ext]
pub impl Command {
  fn check_success(&mut self) -> Result<()> {
    self.status().context("status")?.check_success()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[cfg(unix)]
  #[test]
  fn non_zero_exit_is_an_error() {
    assert!(Command::new("sh").args(["-c", "exit 3"]).check_success().is_err());
    assert!(Command::new("sh").args(["-c", "exit 0"]).check_success().is_ok());
  }

  #[cfg(unix)]
  #[test]
  fn slow_child_is_killed_on_timeout() {
    let mut child = Command::new("sh").args(["-c", "sleep 30"]).spawn().unwrap();

    assert!(child.check_success_timeout(Duration::from_millis(50)).unwrap().is_none());
  }
}
