use std::path::PathBuf;

use vmdriver::{Config, Driver, MachineConfig};

/// Path to the python3 stub that stands in for a real emulator in these
/// tests; see `tests/fixtures/stub_emulator.py`.
fn stub_emulator_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/stub_emulator.py")
}

/// A `MachineConfig` whose `startCommand` runs the stub emulator under the
/// given name.
pub fn stub_machine(name: &str) -> MachineConfig {
    MachineConfig {
        name: Some(name.to_string()),
        start_command: Some(format!("python3 {}", stub_emulator_path().display())),
        ..Default::default()
    }
}

/// Build a driver with one stub machine named `name`, rooted at a fresh
/// tempdir. The tempdir must outlive the driver, hence the tuple return.
pub fn single_stub_driver(name: &str) -> (Driver, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let config = Config {
        machines: vec![stub_machine(name)],
    };
    let driver = Driver::new(config, dir.path(), false).expect("failed to construct driver");
    (driver, dir)
}
