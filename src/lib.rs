#![deny(missing_docs)]
//! Library form of vmdriver: an integration-test driver for virtual machines.

/// The retry primitive every `wait_*` operation composes over.
pub mod retry;
/// Declarative per-machine configuration.
pub mod config;
/// Emulator command-line composition from a [`config::MachineConfig`].
pub mod command;
/// Printable-character to monitor `sendkey` token mapping.
pub mod keys;
/// The virtual LAN fabric: one switch process per VLAN id.
pub mod vlan;
/// The human-monitor control channel.
pub mod monitor;
/// The in-guest root shell RPC channel.
pub mod shell;
/// Per-machine lifecycle and the three I/O channels.
pub mod machine;
/// High-level `wait_*` probes built on [`retry`].
pub mod probes;
/// Service-manager (`systemctl`) bridge.
pub mod systemd;
/// Host/guest file-transfer helpers.
pub mod transfer;
/// Screen dump and OCR helpers.
pub mod screen;
/// Wires machines and VLANs together for a single test run.
pub mod driver;
/// Minimal line-oriented scripting surface over [`driver::Driver`].
pub mod dsl;

pub use crate::config::{Config, MachineConfig};
pub use crate::driver::Driver;
pub use crate::machine::Machine;

/// Bracket a named region of a test script with entry/exit log lines,
/// propagating whatever error `f` returns.
///
/// This is the Rust-caller equivalent of the scripting DSL's `subtest` /
/// `end_subtest` pair (see [`dsl::run_script`]): no value escapes besides
/// `f`'s own return, and a failure inside `f` aborts the region the same way
/// an uncaught error would abort the rest of the script.
pub fn subtest<F, T>(name: &str, f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    log::info!("subtest: {name}");
    let result = f();
    match &result {
        Ok(_) => log::info!("subtest {name} succeeded"),
        Err(e) => log::info!("subtest {name} failed: {e:#}"),
    }
    result
}
