use anyhow::{Context, Result};

use crate::machine::Machine;
use crate::retry;

impl Machine {
    /// Block until the guest shell is reachable and `true` runs
    /// successfully.
    ///
    /// Distinct from [`Machine::start`]'s own readiness check: this is for
    /// reconnecting after e.g. a reboot, where the old shell connection is
    /// gone and a fresh one needs to come up inside the guest.
    pub fn wait_for_shell(&self) -> Result<()> {
        retry::retry(|_| {
            Ok(self
                .with_shell(|shell| shell.execute_checked("true"))
                .is_ok())
        })
    }

    /// Block until `unit` reaches an active state.
    ///
    /// A `failed` unit aborts the wait immediately. So does a unit that is
    /// merely `inactive` with nothing queued to start it -- it would never
    /// become active on its own, so waiting out the full retry budget for
    /// it would just waste time.
    pub fn wait_for_unit(&self, unit: &str) -> Result<()> {
        retry::retry(|_| {
            let info = self.get_unit_info(unit)?;
            match info.active_state.as_str() {
                "active" => Ok(true),
                "failed" => anyhow::bail!("unit \"{unit}\" reached state \"failed\""),
                "inactive" if self.unit_has_no_pending_jobs(unit)? => {
                    // The jobs check and this state read aren't atomic --
                    // re-read before giving up permanently so a job that
                    // slipped in between isn't mistaken for "never going to
                    // start".
                    let recheck = self.get_unit_info(unit)?;
                    if recheck.active_state == "inactive" {
                        anyhow::bail!(
                            "unit \"{unit}\" is inactive with no jobs queued to start it"
                        )
                    }
                    Ok(false)
                }
                _ => Ok(false),
            }
        })
    }

    /// Block until `path` exists inside the guest.
    pub fn wait_for_file(&self, path: &str) -> Result<()> {
        retry::retry(|_| {
            let (_, status) = self.with_shell(|shell| shell.execute(&format!("test -e {path}")))?;
            Ok(status == 0)
        })
    }

    /// Block until `text` appears somewhere in the guest console output
    /// observed so far.
    pub fn wait_for_console_text(&self, text: &str) -> Result<()> {
        retry::retry(|_| self.wait_for_console(text))
    }

    /// Retry `command` until it succeeds, or the retry budget is exhausted.
    pub fn wait_until_succeeds(&self, command: &str) -> Result<String> {
        let last_output = std::cell::RefCell::new(String::new());
        retry::retry(|_| {
            let (output, status) = self.with_shell(|shell| shell.execute(command))?;
            *last_output.borrow_mut() = output;
            Ok(status == 0)
        })?;
        Ok(last_output.into_inner())
    }

    /// Retry `command` until it fails, or the retry budget is exhausted.
    pub fn wait_until_fails(&self, command: &str) -> Result<String> {
        let last_output = std::cell::RefCell::new(String::new());
        retry::retry(|_| {
            let (output, status) = self.with_shell(|shell| shell.execute(command))?;
            *last_output.borrow_mut() = output;
            Ok(status != 0)
        })?;
        Ok(last_output.into_inner())
    }

    /// Block until a TCP connect to `port` inside the guest succeeds.
    pub fn wait_for_open_port(&self, port: u16) -> Result<()> {
        retry::retry(|_| {
            let (_, status) =
                self.with_shell(|shell| shell.execute(&format!("nc -z localhost {port}")))?;
            Ok(status == 0)
        })
    }

    /// Block until a TCP connect to `port` inside the guest fails, i.e. the
    /// listening service has gone away.
    pub fn wait_for_closed_port(&self, port: u16) -> Result<()> {
        retry::retry(|_| {
            let (_, status) =
                self.with_shell(|shell| shell.execute(&format!("nc -z localhost {port}")))?;
            Ok(status != 0)
        })
    }

    /// Run `command` in the guest shell, returning its combined
    /// stdout/stderr. Fails if the command's exit status is non-zero.
    pub fn succeed(&self, command: &str) -> Result<String> {
        self.with_shell(|shell| shell.execute_checked(command))
            .with_context(|| format!("command `{command}` was expected to succeed"))
    }

    /// Run `command` in the guest shell, returning its combined
    /// stdout/stderr. Fails if the command's exit status is zero.
    pub fn fail(&self, command: &str) -> Result<String> {
        let (output, status) = self.with_shell(|shell| shell.execute(command))?;
        if status == 0 {
            anyhow::bail!("command `{command}` was expected to fail but succeeded: {output}");
        }
        Ok(output)
    }

    /// Run `command`, returning its output and exit status without
    /// asserting on either.
    pub fn execute(&self, command: &str) -> Result<(String, i32)> {
        self.with_shell(|shell| shell.execute(command))
    }
}

#[cfg(test)]
mod tests {
    // wait_* probes are exercised end-to-end in tests/test.rs against a
    // stub shell emulator; unit tests here would just be retry.rs in
    // disguise.
}
