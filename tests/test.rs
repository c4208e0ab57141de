use std::time::Duration;

use test_log::test;

mod helpers;
use helpers::single_stub_driver;

#[test]
fn connect_then_succeed_and_fail() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.connect()?;
            assert!(machine.is_up());

            let out = machine.succeed("echo hi")?;
            assert_eq!(out.trim(), "hi");

            let out = machine.fail("false")?;
            assert_eq!(out.trim(), "");

            Ok(())
        })
        .unwrap();
}

#[test]
fn execute_returns_output_and_status() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            let (out, status) = machine.execute("echo hi")?;
            assert_eq!(out.trim(), "hi");
            assert_eq!(status, 0);
            assert!(!out.contains("|!=EOF"));
            Ok(())
        })
        .unwrap();
}

#[test]
fn start_is_idempotent() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.start()?;
            let pid = machine.pid();
            machine.start()?;
            assert_eq!(machine.pid(), pid);
            Ok(())
        })
        .unwrap();
}

#[test]
fn wait_for_console_text_matches_stub_output() {
    std::env::set_var("STUB_CONSOLE_TEXT", "integration-marker-12345");
    let (driver, _dir) = single_stub_driver("m");
    let result = driver.run(|driver| {
        let machine = driver.machine("m")?;
        machine.start()?;
        machine.wait_for_console_text("integration-marker-12345")
    });
    std::env::remove_var("STUB_CONSOLE_TEXT");
    result.unwrap();
}

#[test]
fn crash_terminates_the_emulator_process() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.connect()?;
            assert!(machine.booted());
            machine.crash()?;
            assert!(!machine.booted());
            Ok(())
        })
        .unwrap();
}

#[test]
fn shutdown_terminates_the_emulator_process() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.connect()?;
            machine.shutdown()?;
            assert!(!machine.booted());
            Ok(())
        })
        .unwrap();
}

#[test]
fn block_and_unblock_round_trip() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.connect()?;
            machine.block("net0")?;
            machine.unblock("net0")?;
            Ok(())
        })
        .unwrap();
}

// The stub's "guest" shell is plain host bash with no real 9p transport,
// so only the base64-over-shell transfer path (which needs no shared
// mount) is exercised here; `copy_from_host`/`copy_from_vm` need a real
// virtfs-backed guest and are covered by unit tests in transfer.rs instead.
#[test]
fn copy_to_and_from_vm_via_shell_round_trips_a_file() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.connect()?;

            let host_src = tempfile::NamedTempFile::new()?;
            std::fs::write(host_src.path(), b"round trip me")?;

            machine.copy_from_host_via_shell(host_src.path(), "/tmp/round-trip-test")?;
            machine.succeed("test -e /tmp/round-trip-test")?;

            let host_dst = tempfile::NamedTempFile::new()?;
            machine.copy_from_vm_via_shell("/tmp/round-trip-test", host_dst.path())?;
            let contents = std::fs::read(host_dst.path())?;
            assert_eq!(contents, b"round trip me");

            Ok(())
        })
        .unwrap();
}

#[test]
fn retry_budget_is_respected_by_wait_for_file() {
    let (driver, _dir) = single_stub_driver("m");
    driver
        .run(|driver| {
            let machine = driver.machine("m")?;
            machine.connect()?;
            // Created before the wait starts, so this must resolve on the
            // very first poll rather than waiting out any budget.
            machine.succeed("touch /tmp/already-there")?;
            machine.wait_for_file("/tmp/already-there")
        })
        .unwrap();
}

#[test]
fn teardown_runs_even_when_the_script_fails() {
    let (driver, _dir) = single_stub_driver("m");
    let err = driver
        .run(|driver| -> anyhow::Result<()> {
            let machine = driver.machine("m")?;
            machine.connect()?;
            anyhow::bail!("deliberate script failure")
        })
        .unwrap_err();
    assert!(err.to_string().contains("deliberate script failure"));
    // The driver's cleanup hook should have reaped the stub by now; give
    // the OS a moment to finish the teardown before the process exits.
    std::thread::sleep(Duration::from_millis(200));
}
