use std::path::PathBuf;

use regex::Regex;
use serde_derive::Deserialize;

/// Declarative configuration for a single machine.
///
/// Fields map 1:1 onto the recognized startup-command keys. Unknown keys
/// are rejected at deserialization time rather than silently ignored.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    /// Stable name used for logging and for the scripting namespace.
    ///
    /// When absent it is derived from `start_command` by matching the
    /// pattern `run-<name>-vm$`, falling back to `"machine"`.
    pub name: Option<String>,
    /// A complete, verbatim command line to launch the emulator.
    ///
    /// When present none of the other composition fields below are
    /// consulted; see [`crate::command::compose`].
    pub start_command: Option<String>,
    /// When `false` (the default) the emulator is configured to exit on
    /// guest reboot instead of actually rebooting.
    #[serde(default)]
    pub allow_reboot: bool,
    /// Extra arguments appended to the default user-mode network backend.
    pub net_backend_args: Option<String>,
    /// Extra arguments appended to the default virtio-net frontend.
    pub net_frontend_args: Option<String>,
    /// Path to the primary disk image.
    pub hda: Option<PathBuf>,
    /// Attachment for `hda`. `"scsi"` is handled specially; any other value
    /// (the default is `"virtio"`) is passed through as the `if=` value.
    pub hda_interface: Option<String>,
    /// Path to a CD-ROM image.
    pub cdrom: Option<PathBuf>,
    /// Path to a read-only USB disk image.
    pub usb: Option<PathBuf>,
    /// Path to a BIOS image (e.g. an OVMF firmware blob).
    pub bios: Option<PathBuf>,
    /// Arbitrary extra flags appended verbatim after everything else.
    #[serde(default)]
    pub qemu_flags: String,
}

impl MachineConfig {
    /// Resolve this machine's name: the explicit `name`, or one derived
    /// from `start_command`, or the fallback `"machine"`.
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }

        if let Some(cmd) = &self.start_command {
            // Unwrap is safe: this is a fixed, valid pattern.
            let re = Regex::new(r"run-(.+)-vm$").unwrap();
            if let Some(caps) = re.captures(cmd.trim_end()) {
                return caps[1].to_string();
            }
        }

        "machine".to_string()
    }

    pub fn hda_interface(&self) -> &str {
        self.hda_interface.as_deref().unwrap_or("virtio")
    }
}

/// A matrix of machines to run, as deserialized from a `vmdriver.toml` file.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    /// Every machine in the matrix, in declaration order.
    #[serde(rename = "machine", default)]
    pub machines: Vec<MachineConfig>,
}
