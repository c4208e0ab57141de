use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};

use anyhow::{bail, Context, Result};
use log::debug;
use nix::pty::openpty;

/// A running `vde_switch` process providing one virtual LAN.
///
/// Machines never attach to this directly; instead the control-socket
/// directory is published into the environment as `QEMU_VDE_SOCKET_<nr>`
/// (see [`start_all`]) for whatever start command wants to pick it up --
/// the driver itself does not wire any machine onto a VLAN.
pub struct VlanSwitch {
    id: u32,
    child: Child,
    ctl_dir: std::path::PathBuf,
}

impl VlanSwitch {
    /// Spawn a `vde_switch` for `vlan_id` rooted at `ctl_dir`.
    ///
    /// A pty delivers a `version` handshake line to the switch's stdin;
    /// readiness is confirmed by reading one line of the switch's stdout and
    /// then checking that it actually created its `ctl` socket.
    pub fn spawn(vlan_id: u32, ctl_dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        let ctl_dir = ctl_dir.into();
        std::fs::create_dir_all(&ctl_dir)
            .with_context(|| format!("failed to create vlan ctl dir {}", ctl_dir.display()))?;

        let pty = openpty(None, None).context("failed to allocate pty for vde_switch")?;

        let mut child = Command::new("vde_switch")
            .arg("-s")
            .arg(&ctl_dir)
            .arg("--dirmode")
            .arg("0700")
            .stdin(Stdio::from(pty.slave))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn vde_switch for vlan {vlan_id}"))?;

        let mut pty_master = std::fs::File::from(pty.master);
        pty_master
            .write_all(b"version\n")
            .context("sending handshake to vde_switch")?;

        let mut stdout = BufReader::new(
            child
                .stdout
                .take()
                .context("vde_switch stdout was not piped")?,
        );
        let mut line = String::new();
        stdout
            .read_line(&mut line)
            .context("reading vde_switch readiness line")?;

        if !ctl_dir.join("ctl").exists() {
            let _ = child.kill();
            bail!("cannot start vde switch");
        }

        debug!("vlan {vlan_id} switch listening in {}", ctl_dir.display());

        Ok(Self {
            id: vlan_id,
            child,
            ctl_dir,
        })
    }

    /// The VLAN id this switch serves.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path to the switch's control-socket directory, as published via
    /// `QEMU_VDE_SOCKET_<nr>`.
    pub fn ctl_dir(&self) -> &std::path::Path {
        &self.ctl_dir
    }
}

impl Drop for VlanSwitch {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Parse the `VLANS` environment variable: a whitespace-separated list of
/// vlan ids, duplicates removed preserving first occurrence.
pub fn parse_vlans_env() -> Vec<u32> {
    let raw = std::env::var("VLANS").unwrap_or_default();
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for token in raw.split_whitespace() {
        if let Ok(id) = token.parse::<u32>() {
            if seen.insert(id) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Spawn one switch per id in `vlan_ids` and publish each one's control
/// socket path into the process environment under `QEMU_VDE_SOCKET_<nr>`,
/// so that child emulators (spawned after this returns) inherit it.
pub fn start_all(vlan_ids: &[u32], base_dir: &std::path::Path) -> Result<Vec<VlanSwitch>> {
    let mut switches = Vec::with_capacity(vlan_ids.len());
    for &id in vlan_ids {
        let switch = VlanSwitch::spawn(id, base_dir.join(format!("vlan{id}")))?;
        std::env::set_var(format!("QEMU_VDE_SOCKET_{id}"), switch.ctl_dir().join("ctl"));
        switches.push(switch);
    }
    Ok(switches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctl_dir_is_exposed() {
        // Exercises only the pure accessor; spawning a real vde_switch
        // belongs in an integration test with the binary available.
        let switch = VlanSwitch {
            id: 7,
            child: Command::new("true").spawn().unwrap(),
            ctl_dir: "/tmp/whatever".into(),
        };
        assert_eq!(switch.id(), 7);
        assert_eq!(switch.ctl_dir(), std::path::Path::new("/tmp/whatever"));
    }

    #[test]
    fn parse_vlans_env_dedupes_preserving_order() {
        std::env::set_var("VLANS", "3 1 3 2 1");
        let ids = parse_vlans_env();
        std::env::remove_var("VLANS");
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn parse_vlans_env_empty_when_unset() {
        std::env::remove_var("VLANS");
        assert_eq!(parse_vlans_env(), Vec::<u32>::new());
    }
}
