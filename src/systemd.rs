use anyhow::{Context, Result};

use crate::machine::Machine;

/// Parsed `systemctl show` output for a single unit.
///
/// Only the fields this driver actually consults are pulled out; the rest
/// of `systemctl show`'s `KEY=VALUE` lines are discarded.
#[derive(Debug, Clone)]
pub struct UnitInfo {
    /// `systemctl`'s top-level state: `active`, `inactive`, `failed`, etc.
    pub active_state: String,
    /// The finer-grained state within `active_state`, e.g. `running`, `dead`.
    pub sub_state: String,
    /// Whether the unit file itself was found and parsed, e.g. `loaded`.
    pub load_state: String,
}

impl Machine {
    /// Query `systemctl show <unit>` in the system manager and parse the
    /// properties this driver cares about.
    pub fn get_unit_info(&self, unit: &str) -> Result<UnitInfo> {
        let output = self.with_shell(|shell| {
            shell.execute_checked(&systemctl_command(
                None,
                &format!("show {unit} --property=ActiveState,SubState,LoadState"),
            ))
        })?;
        parse_unit_info(&output)
            .with_context(|| format!("parsing systemctl show output for unit {unit}"))
    }

    /// Same as [`Machine::get_unit_info`], but queried against `user`'s
    /// systemd user session rather than the system manager.
    pub fn get_unit_info_as_user(&self, unit: &str, user: &str) -> Result<UnitInfo> {
        let output = self.with_shell(|shell| {
            shell.execute_checked(&systemctl_command(
                Some(user),
                &format!("show {unit} --property=ActiveState,SubState,LoadState"),
            ))
        })?;
        parse_unit_info(&output)
            .with_context(|| format!("parsing systemctl show output for unit {unit}"))
    }

    /// Run `systemctl <action> <unit>` in the system manager.
    pub fn systemctl(&self, action: &str, unit: &str) -> Result<()> {
        self.with_shell(|shell| shell.execute_checked(&systemctl_command(None, &format!("{action} {unit}"))))?;
        Ok(())
    }

    /// Same as [`Machine::systemctl`], but run against `user`'s systemd
    /// user session (`systemctl --user`), the way a login unit or a
    /// desktop session service would be managed.
    pub fn systemctl_as_user(&self, action: &str, unit: &str, user: &str) -> Result<()> {
        self.with_shell(|shell| {
            shell.execute_checked(&systemctl_command(Some(user), &format!("{action} {unit}")))
        })?;
        Ok(())
    }

    /// `true` if the unit's `ActiveState` is `failed`.
    pub fn unit_failed(&self, unit: &str) -> Result<bool> {
        Ok(self.get_unit_info(unit)?.active_state == "failed")
    }

    /// Fetch `unit`'s state once and raise unless `ActiveState` matches
    /// `expected`. Unlike [`Machine::wait_for_unit`], this does not retry --
    /// it's for asserting a state the caller already expects to hold.
    pub fn require_unit_state(&self, unit: &str, expected: &str) -> Result<()> {
        let info = self.get_unit_info(unit)?;
        if info.active_state != expected {
            anyhow::bail!(
                "unit {unit} is in state {}, expected {expected}",
                info.active_state
            );
        }
        Ok(())
    }

    /// Queue `systemctl start <unit>`.
    pub fn start_job(&self, unit: &str) -> Result<()> {
        self.systemctl("start", unit)
    }

    /// Queue `systemctl stop <unit>`.
    pub fn stop_job(&self, unit: &str) -> Result<()> {
        self.systemctl("stop", unit)
    }

    /// Alias for [`Machine::wait_for_unit`].
    pub fn wait_for_job(&self, unit: &str) -> Result<()> {
        self.wait_for_unit(unit)
    }

    /// `true` if the system manager has no jobs queued for `unit`.
    ///
    /// Used to short-circuit a wait when a unit is inactive and nothing is
    /// pending to (re)start it -- it isn't going anywhere, so there's no
    /// point spending the rest of the retry budget on it.
    pub fn unit_has_no_pending_jobs(&self, unit: &str) -> Result<bool> {
        let output =
            self.with_shell(|shell| shell.execute_checked(&systemctl_command(None, "list-jobs --no-legend")))?;
        Ok(!output.lines().any(|line| line.split_whitespace().nth(1) == Some(unit)))
    }
}

/// Build the shell command line for a `systemctl` invocation, rewriting it
/// through `su -l <user>` with an explicit `XDG_RUNTIME_DIR` when querying
/// a user session rather than the system manager.
fn systemctl_command(user: Option<&str>, args: &str) -> String {
    match user {
        Some(user) => format!(
            "su -l {user} -c 'XDG_RUNTIME_DIR=/run/user/$(id -u) systemctl --user {args}'"
        ),
        None => format!("systemctl {args}"),
    }
}

fn parse_unit_info(output: &str) -> Result<UnitInfo> {
    let mut active_state = None;
    let mut sub_state = None;
    let mut load_state = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "ActiveState" => active_state = Some(value.to_string()),
            "SubState" => sub_state = Some(value.to_string()),
            "LoadState" => load_state = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(UnitInfo {
        active_state: active_state.context("missing ActiveState")?,
        sub_state: sub_state.context("missing SubState")?,
        load_state: load_state.context("missing LoadState")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_unit_info_extracts_known_fields() {
        let output = "Type=simple\nActiveState=active\nSubState=running\nLoadState=loaded\n";
        let info = parse_unit_info(output).unwrap();
        assert_eq!(info.active_state, "active");
        assert_eq!(info.sub_state, "running");
        assert_eq!(info.load_state, "loaded");
    }

    #[test]
    fn parse_unit_info_fails_on_missing_field() {
        let output = "SubState=running\nLoadState=loaded\n";
        assert!(parse_unit_info(output).is_err());
    }

    #[test]
    fn systemctl_command_rewrites_for_user_sessions() {
        let cmd = systemctl_command(Some("alice"), "start foo.service");
        assert!(cmd.contains("su -l alice"));
        assert!(cmd.contains("XDG_RUNTIME_DIR=/run/user/$(id -u)"));
        assert!(cmd.contains("systemctl --user start foo.service"));
    }

    #[test]
    fn systemctl_command_is_plain_for_system_scope() {
        assert_eq!(systemctl_command(None, "start foo.service"), "systemctl start foo.service");
    }
}
