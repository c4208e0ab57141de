use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use regex::Regex;

/// Marker that `execute` appends after every command so replies can be
/// unambiguously delimited from arbitrary command output, including output
/// that itself spans multiple reads or contains partial sentinel-like text.
const SENTINEL: &str = "|!=EOF";

/// A connection to the guest-side shell, reached over a virtio-serial or
/// virtio-console-backed Unix socket.
///
/// Every command is framed as `( cmd ); echo 'SENTINEL' $?` so that a
/// single regex match over the accumulated reply buffer recovers both the
/// command's stdout/stderr and its exit status, regardless of how the
/// underlying reads happen to chunk the bytes.
pub struct ShellChannel {
    stream: UnixStream,
    buffer: String,
    sentinel_re: Regex,
}

impl ShellChannel {
    /// Wrap an already-connected shell socket. Does not read anything off
    /// it yet; see [`ShellChannel::drain_greeting`].
    pub fn new(stream: UnixStream) -> Self {
        let sentinel_re =
            Regex::new(&format!(r"(?s)(.*)\{SENTINEL}\s+(\d+)")).expect("valid sentinel regex");
        Self {
            stream,
            buffer: String::new(),
            sentinel_re,
        }
    }

    /// Drain whatever the guest has already written to the shell (its
    /// freshly-booted root prompt) with a single read, so it doesn't end up
    /// prepended to the first real command's output.
    ///
    /// Mirrors a single blocking `recv` of the initial prompt bytes; by the
    /// time a caller reaches this point the emulator's monitor has already
    /// responded, so the guest init is far enough along that this read
    /// should not block indefinitely in practice.
    pub fn drain_greeting(&mut self) -> Result<()> {
        let mut buf = [0u8; 1024];
        self.stream.read(&mut buf).context("reading shell greeting")?;
        Ok(())
    }

    /// Write `raw` to the shell verbatim, without framing it as a command
    /// or waiting for a reply. For commands like `poweroff` that tear down
    /// the shell itself before it gets a chance to echo the sentinel.
    pub fn send_raw(&mut self, raw: &str) -> Result<()> {
        self.stream
            .write_all(raw.as_bytes())
            .context("writing raw shell input")
    }

    /// Run `command` in the guest shell and return its combined
    /// stdout/stderr and exit status.
    ///
    /// The exit status is not interpreted as success or failure here;
    /// callers that care (e.g. [`crate::probes`]) check it explicitly.
    pub fn execute(&mut self, command: &str) -> Result<(String, i32)> {
        let framed = format!("( {command} ); echo '{SENTINEL}' $?\n");
        self.stream
            .write_all(framed.as_bytes())
            .context("writing shell command")?;

        let mut buf = [0u8; 4096];
        loop {
            if let Some(captures) = self.sentinel_re.captures(&self.buffer) {
                let output = captures[1].to_string();
                let status: i32 = captures[2]
                    .parse()
                    .context("parsing shell command exit status")?;
                self.buffer.clear();
                return Ok((output, status));
            }

            let n = self
                .stream
                .read(&mut buf)
                .context("reading shell output")?;
            if n == 0 {
                anyhow::bail!("shell socket closed before sentinel was seen");
            }
            self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    /// Convenience wrapper returning `Ok(())` only when the command
    /// succeeded (exit status 0), with the combined output in the error
    /// context on failure.
    pub fn execute_checked(&mut self, command: &str) -> Result<String> {
        let (output, status) = self.execute(command)?;
        if status != 0 {
            anyhow::bail!("command `{command}` failed with status {status}: {output}");
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn execute_parses_output_and_status() {
        let (client, mut server) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            let n = server.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"( echo hi ); echo '|!=EOF' $?\n");
            server.write_all(b"hi\n|!=EOF 0\n").unwrap();
        });

        let mut channel = ShellChannel::new(client);
        let (output, status) = channel.execute("echo hi").unwrap();
        assert_eq!(output.trim(), "hi");
        assert_eq!(status, 0);

        handle.join().unwrap();
    }

    #[test]
    fn execute_handles_reply_split_across_multiple_reads() {
        let (client, mut server) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            server.read(&mut buf).unwrap();
            server.write_all(b"part").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(20));
            server.write_all(b"ial output\n|!=EOF 1\n").unwrap();
        });

        let mut channel = ShellChannel::new(client);
        let (output, status) = channel.execute("whatever").unwrap();
        assert_eq!(output.trim(), "partial output");
        assert_eq!(status, 1);

        handle.join().unwrap();
    }

    #[test]
    fn execute_checked_errors_on_nonzero_status() {
        let (client, mut server) = UnixStream::pair().unwrap();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 256];
            server.read(&mut buf).unwrap();
            server.write_all(b"boom\n|!=EOF 7\n").unwrap();
        });

        let mut channel = ShellChannel::new(client);
        let err = channel.execute_checked("false").unwrap_err();
        assert!(err.to_string().contains("status 7"));

        handle.join().unwrap();
    }
}
