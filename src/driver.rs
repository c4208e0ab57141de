use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::config::{Config, MachineConfig};
use crate::machine::Machine;
use crate::vlan::{self, VlanSwitch};

/// Owns every machine and VLAN switch for a single test run.
///
/// Construct with [`Driver::new`], fetch machines with [`Driver::machine`],
/// then hand a closure to [`Driver::run`]. Every emulator process and switch
/// spawned along the way is torn down when `run` returns, regardless of
/// whether the closure succeeded, failed, or panicked.
pub struct Driver {
    machines: HashMap<String, Machine>,
    _switches: Vec<VlanSwitch>,
    keep_vm_state: bool,
}

impl Driver {
    /// Build a driver from a matrix [`Config`].
    ///
    /// `base_dir` roots every machine's state and shared directories; it is
    /// typically `$TMPDIR` or a directory derived from it. VLAN switches are
    /// started first and their control sockets published into the
    /// environment, so every machine spawned after this point can reach
    /// them regardless of whether it declares a VLAN.
    pub fn new(config: Config, base_dir: &Path, keep_vm_state: bool) -> Result<Self> {
        let vlan_ids = vlan::parse_vlans_env();
        let switches = vlan::start_all(&vlan_ids, base_dir)?;

        let shared_dir = base_dir.join("shared-xchg");
        fs::create_dir_all(&shared_dir)
            .with_context(|| format!("creating shared directory {}", shared_dir.display()))?;
        set_permissions_0700(&shared_dir)?;

        let mut machines = HashMap::new();
        for machine_config in config.machines {
            let name = machine_config.resolved_name();

            let statedir = base_dir.join(format!("vm-state-{name}"));
            if !keep_vm_state {
                cleanup_statedir(&statedir)?;
            }
            fs::create_dir_all(&statedir)
                .with_context(|| format!("creating state directory {}", statedir.display()))?;
            set_permissions_0700(&statedir)?;

            if machines
                .insert(
                    name.clone(),
                    Machine::new(machine_config, statedir, shared_dir.clone()),
                )
                .is_some()
            {
                bail!("duplicate machine name: {name}");
            }
        }

        Ok(Self {
            machines,
            _switches: switches,
            keep_vm_state,
        })
    }

    /// Build a driver for ad hoc machines each described by a verbatim
    /// startup command, the CLI's positional-argument mode.
    pub fn from_start_commands(start_commands: Vec<String>, base_dir: &Path, keep_vm_state: bool) -> Result<Self> {
        let config = Config {
            machines: start_commands
                .into_iter()
                .map(|cmd| MachineConfig {
                    start_command: Some(cmd),
                    ..Default::default()
                })
                .collect(),
        };
        Self::new(config, base_dir, keep_vm_state)
    }

    /// Look up a machine by name.
    pub fn machine(&self, name: &str) -> Result<&Machine> {
        self.machines
            .get(name)
            .with_context(|| format!("no such machine: {name}"))
    }

    /// All machines, in no particular order.
    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    /// Run `f` with access to this driver, guaranteeing every machine and
    /// switch is torn down before returning -- whether `f` succeeds, fails,
    /// or panics.
    pub fn run<T>(&self, f: impl FnOnce(&Driver) -> Result<T>) -> Result<T> {
        let guard = scopeguard::guard((), |_| {
            info!("tearing down all machines");
            for machine in self.machines.values() {
                let _ = machine.stop();
            }
        });

        let result = f(self);
        drop(guard);
        result
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if !self.keep_vm_state {
            for machine in self.machines.values() {
                let _ = machine.stop();
            }
        }
    }
}

/// Delete `dir`'s entire tree if it exists, otherwise do nothing.
fn cleanup_statedir(dir: &Path) -> Result<()> {
    if dir.try_exists().context("checking state directory")? {
        fs::remove_dir_all(dir)
            .with_context(|| format!("removing state directory {}", dir.display()))?;
    }
    Ok(())
}

fn set_permissions_0700(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(dir)?.permissions();
    perms.set_mode(0o700);
    fs::set_permissions(dir, perms)
        .with_context(|| format!("setting permissions on {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_statedir_is_a_noop_when_absent() {
        let dir = std::env::temp_dir().join("vmdriver-test-cleanup-absent");
        let _ = fs::remove_dir_all(&dir);
        cleanup_statedir(&dir).unwrap();
    }

    #[test]
    fn cleanup_statedir_removes_existing_tree() {
        let dir = std::env::temp_dir().join("vmdriver-test-cleanup-present");
        fs::create_dir_all(dir.join("nested")).unwrap();
        cleanup_statedir(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn duplicate_machine_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("VLANS");
        let config = Config {
            machines: vec![
                MachineConfig {
                    name: Some("dup".into()),
                    start_command: Some("true".into()),
                    ..Default::default()
                },
                MachineConfig {
                    name: Some("dup".into()),
                    start_command: Some("true".into()),
                    ..Default::default()
                },
            ],
        };
        let err = Driver::new(config, dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("duplicate machine name"));
    }
}
