use std::env;
use std::path::Path;

use crate::config::MachineConfig;

/// Build the argv for launching a machine's emulator.
///
/// When `config.start_command` is set it is used verbatim (split on
/// whitespace); monitor/shell/console wiring is still appended
/// programmatically by [`crate::machine::Machine::start`] afterwards, so a
/// custom command never has to embed the socket paths itself. A custom
/// command is expected to consult `QEMU_VDE_SOCKET_<nr>` itself (see
/// [`crate::vlan`]) if it wants to join a VLAN; the composed default below
/// deliberately does not, matching upstream's `create_startcommand`, which
/// only ever wires up a NAT'd user-mode NIC.
///
/// Otherwise a QEMU command line is composed from the individual
/// `MachineConfig` fields: kvm acceleration when `/dev/kvm` is accessible,
/// a virtio-net NIC behind a user-mode (NAT) backend, and any of
/// `hda`/`cdrom`/`usb`/`bios` that were set. `DISPLAY`/`USE_SERIAL` select
/// between a graphical console and a stdio serial console, and `QEMU_OPTS`
/// plus `qemu_flags` are spliced on at the end.
pub fn compose(config: &MachineConfig) -> Vec<String> {
    if let Some(start_command) = &config.start_command {
        return start_command.split_whitespace().map(str::to_string).collect();
    }

    let mut args: Vec<String> = vec!["qemu-kvm".to_string()];

    if Path::new("/dev/kvm").exists() {
        args.push("-enable-kvm".into());
        args.push("-cpu".into());
        args.push("host".into());
    }

    args.push("-m".into());
    args.push("384".into());

    if !config.allow_reboot {
        args.push("-no-reboot".into());
    }

    let mut backend = "-netdev user,id=net0".to_string();
    if let Some(extra) = &config.net_backend_args {
        backend.push(',');
        backend.push_str(extra);
    }
    args.push(backend);

    args.push("-device".into());
    let mut frontend = "virtio-net-pci,netdev=net0".to_string();
    if let Some(extra) = &config.net_frontend_args {
        frontend.push(',');
        frontend.push_str(extra);
    }
    args.push(frontend);

    if let Some(hda) = &config.hda {
        let interface = config.hda_interface();
        if interface == "scsi" {
            args.push("-drive".into());
            args.push(format!("file={},if=none,id=hda", hda.display()));
            args.push("-device".into());
            args.push("virtio-scsi-pci".into());
            args.push("-device".into());
            args.push("scsi-hd,drive=hda".into());
        } else {
            args.push("-drive".into());
            args.push(format!("file={},if={}", hda.display(), interface));
        }
    }

    if let Some(cdrom) = &config.cdrom {
        args.push("-cdrom".into());
        args.push(cdrom.display().to_string());
    }

    if let Some(usb) = &config.usb {
        args.push("-usb".into());
        args.push("-drive".into());
        args.push(format!("file={},if=none,id=usbdisk,readonly=on", usb.display()));
        args.push("-device".into());
        args.push("usb-storage,drive=usbdisk".into());
    }

    if let Some(bios) = &config.bios {
        args.push("-bios".into());
        args.push(bios.display().to_string());
    }

    if use_serial() {
        args.push("-serial".into());
        args.push("stdio".into());
    } else {
        args.push("-nographic".into());
    }

    if let Ok(extra_opts) = env::var("QEMU_OPTS") {
        args.extend(extra_opts.split_whitespace().map(str::to_string));
    }

    if !config.qemu_flags.is_empty() {
        args.extend(config.qemu_flags.split_whitespace().map(str::to_string));
    }

    args
}

/// Whether the composer should emit the serial-stdio console variant
/// instead of a graphical one.
///
/// Matches the `"-serial stdio" if "DISPLAY" in os.environ else
/// "-nographic"` choice upstream makes, generalized with the `USE_SERIAL`
/// escape hatch for headless hosts that still want a serial console.
fn use_serial() -> bool {
    env::var("USE_SERIAL").as_deref() == Ok("1") || env::var("DISPLAY").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> MachineConfig {
        MachineConfig::default()
    }

    #[test]
    fn verbatim_start_command_is_split_on_whitespace() {
        let config = MachineConfig {
            start_command: Some("run-foo-vm -m 1024".into()),
            ..base_config()
        };
        let args = compose(&config);
        assert_eq!(args, vec!["run-foo-vm", "-m", "1024"]);
    }

    #[test]
    fn composed_command_includes_nic_wiring() {
        let config = base_config();
        let args = compose(&config);
        let joined = args.join(" ");
        assert!(joined.contains("-netdev user,id=net0"));
        assert!(joined.contains("virtio-net-pci,netdev=net0"));
    }

    #[test]
    fn hda_interface_selection_scsi() {
        let config = MachineConfig {
            hda: Some("/tmp/disk.img".into()),
            hda_interface: Some("scsi".to_string()),
            ..base_config()
        };
        assert!(compose(&config).join(" ").contains("virtio-scsi-pci"));
    }

    #[test]
    fn hda_interface_selection_virtio() {
        let config = MachineConfig {
            hda: Some("/tmp/disk.img".into()),
            hda_interface: Some("virtio".to_string()),
            ..base_config()
        };
        assert!(compose(&config).join(" ").contains("if=virtio"));
    }

    #[test]
    fn allow_reboot_suppresses_no_reboot_flag() {
        let config = MachineConfig {
            allow_reboot: true,
            ..base_config()
        };
        assert!(!compose(&config).contains(&"-no-reboot".to_string()));
    }

    #[test]
    fn extra_qemu_flags_are_appended_verbatim() {
        let config = MachineConfig {
            qemu_flags: "-smp 4 -vga std".into(),
            ..base_config()
        };
        let args = compose(&config);
        assert!(args.ends_with(&["-smp".to_string(), "4".to_string(), "-vga".to_string(), "std".to_string()]));
    }

    #[test]
    fn cdrom_usb_and_bios_are_all_wired_when_set() {
        let config = MachineConfig {
            cdrom: Some("/tmp/cd.iso".into()),
            usb: Some("/tmp/usb.img".into()),
            bios: Some("/tmp/OVMF_CODE.fd".into()),
            ..base_config()
        };
        let joined = compose(&config).join(" ");
        assert!(joined.contains("-cdrom /tmp/cd.iso"));
        assert!(joined.contains("usb-storage,drive=usbdisk"));
        assert!(joined.contains("-bios /tmp/OVMF_CODE.fd"));
    }
}
