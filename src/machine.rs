use std::cell::RefCell;
use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixListener;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::command;
use crate::config::MachineConfig;
use crate::monitor::MonitorChannel;
use crate::shell::ShellChannel;

/// Fixed mount point of the host/guest shared directory inside the guest.
pub(crate) const GUEST_SHARED_DIR: &str = "/tmp/shared";

const SHARED_9P_MOUNT_TAG: &str = "vmdriver-shared";

/// Runtime state for a [`Machine`], held behind a `RefCell` so the machine
/// can be exposed to user closures as a shared reference while still
/// allowing lifecycle transitions (start, connect, crash, stop).
///
/// A single cooperative thread drives all of this -- the console reader is
/// the only background thread, and it only ever pushes into an mpsc queue.
enum MachineState {
    NotStarted,
    Running {
        child: Child,
        monitor: MonitorChannel,
        shell: ShellChannel,
        console: Receiver<String>,
        connected: bool,
    },
    Stopped,
}

/// A single virtual machine under test.
///
/// Constructed by [`crate::driver::Driver`]; obtained inside a test closure
/// via [`crate::driver::Driver::machine`].
pub struct Machine {
    name: String,
    config: MachineConfig,
    statedir: PathBuf,
    shared_dir: PathBuf,
    state: RefCell<MachineState>,
    console_buffer: RefCell<String>,
}

/// Paths to the sockets a started machine is reachable over.
struct Sockets {
    monitor: PathBuf,
    shell: PathBuf,
}

impl Machine {
    pub(crate) fn new(config: MachineConfig, statedir: PathBuf, shared_dir: PathBuf) -> Self {
        let name = config.resolved_name();
        Self {
            name,
            config,
            statedir,
            shared_dir,
            state: RefCell::new(MachineState::NotStarted),
            console_buffer: RefCell::new(String::new()),
        }
    }

    /// This machine's stable name, as bound into the scripting namespace.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory visible to both host and guest, exported over 9p/virtfs.
    ///
    /// Shared across every machine in the same driver; file-transfer
    /// helpers allocate a unique subdirectory per transfer to avoid
    /// collisions between concurrent callers.
    pub(crate) fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    fn sockets(&self) -> Sockets {
        Sockets {
            monitor: self.statedir.join(format!("{}-monitor.sock", self.name)),
            shell: self.statedir.join(format!("{}-shell.sock", self.name)),
        }
    }

    /// Start the emulator and wire up the monitor, shell, and console
    /// channels. Does not wait for the guest shell to be usable -- that is
    /// [`Machine::connect`]'s job.
    ///
    /// Idempotent: calling `start` on an already-running machine is a
    /// no-op.
    pub fn start(&self) -> Result<()> {
        if matches!(*self.state.borrow(), MachineState::Running { .. }) {
            return Ok(());
        }

        info!("{}: starting vm", self.name);

        let sockets = self.sockets();
        let _ = std::fs::remove_file(&sockets.monitor);
        let _ = std::fs::remove_file(&sockets.shell);
        // Bind before spawn so there is no window where the emulator could
        // try to connect before we're listening.
        let monitor_listener = UnixListener::bind(&sockets.monitor)
            .with_context(|| format!("binding monitor socket {}", sockets.monitor.display()))?;
        let shell_listener = UnixListener::bind(&sockets.shell)
            .with_context(|| format!("binding shell socket {}", sockets.shell.display()))?;

        let mut args = command::compose(&self.config);
        wire_machine_flags(&mut args, &sockets, &self.shared_dir);

        debug!("{}: starting: {}", self.name, args.join(" "));

        let program = args.remove(0);
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .current_dir(&self.statedir);
        // Merge stderr into stdout in the child, after fork but before exec,
        // so the console reader sees both on a single stream the same way a
        // terminal would.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::dup2(1, 2)
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning emulator for machine {}", self.name))?;

        let (monitor_stream, _) = monitor_listener
            .accept()
            .context("accepting monitor connection")?;
        let (shell_stream, _) = shell_listener
            .accept()
            .context("accepting shell connection")?;

        let monitor = MonitorChannel::new(monitor_stream).context("monitor handshake")?;
        let shell = ShellChannel::new(shell_stream);

        let stdout = child
            .stdout
            .take()
            .context("emulator stdout was not piped")?;
        let console = spawn_console_reader(stdout, &self.name);

        *self.state.borrow_mut() = MachineState::Running {
            child,
            monitor,
            shell,
            console,
            connected: false,
        };

        info!("{}: vm running (pid {})", self.name, self.pid().unwrap_or(0));

        Ok(())
    }

    /// The emulator's pid, if running.
    pub fn pid(&self) -> Option<u32> {
        match &*self.state.borrow() {
            MachineState::Running { child, .. } => Some(child.id()),
            _ => None,
        }
    }

    /// Start the machine (if needed) and wait for the guest root shell to be
    /// reachable.
    ///
    /// Idempotent: a machine that is already connected is left alone. Every
    /// operation that drives the guest shell calls this first.
    pub fn connect(&self) -> Result<()> {
        if matches!(
            &*self.state.borrow(),
            MachineState::Running { connected: true, .. }
        ) {
            return Ok(());
        }

        self.start()?;

        info!("{}: waiting for the vm to finish booting", self.name);
        let tic = Instant::now();

        let mut state = self.state.borrow_mut();
        if let MachineState::Running { shell, connected, .. } = &mut *state {
            shell.drain_greeting().context("shell did not become ready")?;
            *connected = true;
        }
        drop(state);

        info!(
            "{}: connected to guest root shell (connecting took {:.2}s)",
            self.name,
            tic.elapsed().as_secs_f64()
        );

        self.with_shell(|shell| {
            shell.execute_checked(&format!(
                "mkdir -p {GUEST_SHARED_DIR} && mount -t 9p -o trans=virtio,version=9p2000.L {SHARED_9P_MOUNT_TAG} {GUEST_SHARED_DIR} 2>/dev/null || true"
            ))
        })?;

        Ok(())
    }

    /// `true` once the emulator is up and the guest shell has responded.
    pub fn is_up(&self) -> bool {
        matches!(
            &*self.state.borrow(),
            MachineState::Running { connected: true, .. }
        ) && self.emulator_alive()
    }

    /// `true` while the emulator child process is alive, regardless of
    /// whether the guest shell has connected yet.
    pub fn booted(&self) -> bool {
        matches!(&*self.state.borrow(), MachineState::Running { .. })
    }

    fn emulator_alive(&self) -> bool {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            MachineState::Running { child, .. } => matches!(child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    /// Run `f` with exclusive access to this machine's shell channel,
    /// connecting first if necessary.
    pub(crate) fn with_shell<T>(&self, f: impl FnOnce(&mut ShellChannel) -> Result<T>) -> Result<T> {
        self.connect()?;
        let mut state = self.state.borrow_mut();
        match &mut *state {
            MachineState::Running { shell, .. } => f(shell),
            _ => bail!("machine {} is not running", self.name),
        }
    }

    /// Run `f` with exclusive access to this machine's monitor channel.
    pub(crate) fn with_monitor<T>(&self, f: impl FnOnce(&mut MonitorChannel) -> Result<T>) -> Result<T> {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            MachineState::Running { monitor, .. } => f(monitor),
            _ => bail!("machine {} is not running", self.name),
        }
    }

    /// Drain any console lines available right now into a running buffer,
    /// then regex-search the *whole* accumulated buffer so a match
    /// spanning more than one line (or split across reads) is still found.
    ///
    /// When nothing new showed up this round, sleeps in *guest* time
    /// (`sleep 1` over the shell) rather than host time before the caller's
    /// retry loop tries again -- the same reasoning as [`Machine::sleep`].
    pub(crate) fn wait_for_console(&self, pattern: &str) -> Result<bool> {
        let regex = regex::Regex::new(pattern).context("compiling console regex")?;

        let mut drained_any = false;
        loop {
            let state = self.state.borrow();
            let console = match &*state {
                MachineState::Running { console, .. } => console,
                _ => bail!("machine {} is not running", self.name),
            };
            match console.try_recv() {
                Ok(line) => {
                    drop(state);
                    self.console_buffer.borrow_mut().push_str(&line);
                    self.console_buffer.borrow_mut().push('\n');
                    drained_any = true;
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return Ok(false),
            }
        }

        if !drained_any {
            self.sleep(1)?;
        }

        Ok(regex.is_match(&self.console_buffer.borrow()))
    }

    /// Forcibly terminate the emulator via the monitor's `quit` command and
    /// wait for the process to exit. A no-op if not booted.
    pub fn crash(&self) -> Result<()> {
        if !self.booted() {
            return Ok(());
        }
        info!("{}: forced crash", self.name);
        {
            let mut state = self.state.borrow_mut();
            if let MachineState::Running { monitor, .. } = &mut *state {
                let _ = monitor.quit();
            }
        }
        self.wait_for_shutdown()
    }

    /// Gracefully request shutdown over the shell (`poweroff`) and wait for
    /// the emulator process to exit. A no-op if not booted.
    pub fn shutdown(&self) -> Result<()> {
        if !self.booted() {
            return Ok(());
        }
        {
            let mut state = self.state.borrow_mut();
            if let MachineState::Running { shell, .. } = &mut *state {
                let _ = shell.send_raw("poweroff\n");
            }
        }
        self.wait_for_shutdown()
    }

    /// Block until the emulator process exits, then reset `booted`,
    /// `connected`, and `pid`.
    pub fn wait_for_shutdown(&self) -> Result<()> {
        if !self.booted() {
            return Ok(());
        }
        info!("{}: waiting for the vm to power off", self.name);

        let mut state = self.state.borrow_mut();
        let previous = std::mem::replace(&mut *state, MachineState::Stopped);
        if let MachineState::Running { mut child, .. } = previous {
            let _ = child.wait();
        }
        Ok(())
    }

    /// Terminate the emulator, whatever state it is in, and mark the
    /// machine stopped. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let previous = std::mem::replace(&mut *state, MachineState::Stopped);
        if let MachineState::Running { mut child, .. } = previous {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    /// Sleep `secs` seconds of *guest* time rather than host time, by
    /// running `sleep` inside the guest.
    pub fn sleep(&self, secs: u32) -> Result<()> {
        self.succeed(&format!("sleep {secs}")).map(|_| ())
    }

    /// Bring `device`'s link down via the monitor, making the machine
    /// unreachable over that interface while leaving the emulator itself
    /// running.
    pub fn block(&self, device: &str) -> Result<()> {
        self.with_monitor(|monitor| monitor.set_link(device, false))
    }

    /// The symmetric counterpart of [`Machine::block`].
    pub fn unblock(&self, device: &str) -> Result<()> {
        self.with_monitor(|monitor| monitor.set_link(device, true))
    }

    /// Forward a host TCP port to a guest TCP port, useful during
    /// interactive testing.
    pub fn forward_port(&self, host_port: u16, guest_port: u16) -> Result<()> {
        self.with_monitor(|monitor| monitor.hostfwd_add(host_port, guest_port))
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn wire_machine_flags(args: &mut Vec<String>, sockets: &Sockets, shared_dir: &Path) {
    args.push("-monitor".into());
    args.push(format!("unix:{}", sockets.monitor.display()));
    args.push("-chardev".into());
    args.push(format!("socket,id=shell0,path={}", sockets.shell.display()));
    args.push("-device".into());
    args.push("virtio-serial".into());
    args.push("-device".into());
    args.push("virtserialport,chardev=shell0,name=org.vmdriver.shell0".into());
    args.push("-virtfs".into());
    args.push(format!(
        "local,path={},mount_tag={},security_model=mapped,id=shared0",
        shared_dir.display(),
        SHARED_9P_MOUNT_TAG
    ));
}

/// Spawn the single background thread that drains the emulator's stdout
/// line by line. Lines that fail to decode are replaced rather than
/// dropped, never allowed to block a script-facing operation.
fn spawn_console_reader(stdout: ChildStdout, name: &str) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let name = name.to_string();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else { return };
            let line = String::from_utf8_lossy(&bytes).replace('\r', "");
            info!("{name}: {line}");
            if tx.send(line).is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_machine_flags_references_both_sockets() {
        let sockets = Sockets {
            monitor: PathBuf::from("/tmp/m.sock"),
            shell: PathBuf::from("/tmp/s.sock"),
        };
        let mut args = vec!["qemu-kvm".to_string()];
        wire_machine_flags(&mut args, &sockets, Path::new("/tmp/shared0"));
        let joined = args.join(" ");
        assert!(joined.contains("/tmp/m.sock"));
        assert!(joined.contains("/tmp/s.sock"));
        assert!(!joined.contains("server,nowait"));
    }
}
