use std::io::{BufReader, Write};
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};

/// The human monitor protocol's prompt, printed after every reply.
const PROMPT: &str = "(qemu) ";

/// A connection to QEMU's human monitor socket.
///
/// The monitor speaks a line-oriented, human-readable protocol rather than
/// QMP's JSON-RPC; commands are sent as bare text and replies are read up
/// to the next occurrence of the prompt.
pub struct MonitorChannel {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl MonitorChannel {
    /// Wrap an already-connected monitor socket, consuming the banner and
    /// initial prompt QEMU prints on connect.
    pub fn new(stream: UnixStream) -> Result<Self> {
        let reader = BufReader::new(stream.try_clone().context("clone monitor socket")?);
        let mut channel = Self { stream, reader };
        channel.read_until_prompt().context("reading monitor banner")?;
        Ok(channel)
    }

    /// Send `command` and return everything printed in response, with the
    /// trailing prompt stripped.
    pub fn command(&mut self, command: &str) -> Result<String> {
        self.stream
            .write_all(command.as_bytes())
            .context("writing monitor command")?;
        self.stream.write_all(b"\n").context("writing monitor newline")?;
        self.read_until_prompt()
    }

    fn read_until_prompt(&mut self) -> Result<String> {
        let mut accumulated = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let bytes = {
                use std::io::Read;
                self.reader.read(&mut buf).context("reading monitor reply")?
            };
            if bytes == 0 {
                anyhow::bail!("monitor socket closed unexpectedly");
            }
            accumulated.extend_from_slice(&buf[..bytes]);

            if let Some(pos) = find_subslice(&accumulated, PROMPT.as_bytes()) {
                let reply = String::from_utf8_lossy(&accumulated[..pos]).into_owned();
                return Ok(reply.trim().to_string());
            }
        }
    }

    /// Send a key press using QEMU's `sendkey` monitor command.
    pub fn send_key(&mut self, qemu_key: &str) -> Result<()> {
        self.command(&format!("sendkey {qemu_key}"))?;
        Ok(())
    }

    /// Issue `screendump` to capture the current display to `path` as a PPM
    /// image.
    pub fn screendump(&mut self, path: &std::path::Path) -> Result<()> {
        self.command(&format!("screendump {}", path.display()))?;
        Ok(())
    }

    /// Bring a network link up or down via `set_link`, used by
    /// [`crate::machine::Machine::block`]/`unblock`.
    pub fn set_link(&mut self, device: &str, up: bool) -> Result<()> {
        self.command(&format!("set_link {device} {}", if up { "on" } else { "off" }))?;
        Ok(())
    }

    /// Forward a host TCP port to a guest TCP port via `hostfwd_add`.
    pub fn hostfwd_add(&mut self, host_port: u16, guest_port: u16) -> Result<()> {
        self.command(&format!("hostfwd_add tcp::{host_port}-:{guest_port}"))?;
        Ok(())
    }

    /// Forcibly terminate the emulator via the monitor's `quit` command.
    pub fn quit(&mut self) -> Result<()> {
        self.command("quit")?;
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn command_strips_trailing_prompt() {
        let (client, server) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || {
            use std::io::Read;
            let mut server = server;
            server.write_all(b"QEMU 8.0 monitor\r\n(qemu) ").unwrap();

            let mut buf = [0u8; 128];
            let n = server.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"info status\n");
            server.write_all(b"VM status: running\r\n(qemu) ").unwrap();
        });

        let mut channel = MonitorChannel::new(client).unwrap();
        let reply = channel.command("info status").unwrap();
        assert_eq!(reply, "VM status: running");

        handle.join().unwrap();
    }

    #[test]
    fn find_subslice_locates_prompt_split_across_reads() {
        let haystack = b"hello (qemu) world";
        assert_eq!(find_subslice(haystack, b"(qemu) "), Some(6));
        assert_eq!(find_subslice(haystack, b"nope"), None);
    }
}
