use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tempfile::Builder;

use crate::machine::Machine;
use crate::retry;

impl Machine {
    /// Capture the current display to a PNG at `path`.
    ///
    /// QEMU's monitor only knows how to dump a portable pixmap, so the
    /// capture goes through a temporary `.ppm` file that `pnmtopng`
    /// converts in place.
    pub fn screenshot(&self, path: &Path) -> Result<()> {
        let ppm = Builder::new()
            .suffix(".ppm")
            .tempfile()
            .context("creating temporary ppm file")?;

        self.with_monitor(|monitor| monitor.screendump(ppm.path()))?;

        let png = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let status = Command::new("pnmtopng")
            .arg(ppm.path())
            .stdout(png)
            .status()
            .context("spawning pnmtopng")?;
        if !status.success() {
            bail!("pnmtopng exited with {status}");
        }

        Ok(())
    }

    /// Capture the current display and OCR it, returning the recognized
    /// text.
    ///
    /// The raw screendump is pushed through an ImageMagick enhancement
    /// pipeline before OCR, since a raw VGA screendump tends to confuse
    /// `tesseract` on the low-resolution bitmap fonts consoles typically
    /// use.
    pub fn get_screen_text(&self) -> Result<String> {
        let ppm = Builder::new()
            .suffix(".ppm")
            .tempfile()
            .context("creating temporary ppm file")?;
        self.with_monitor(|monitor| monitor.screendump(ppm.path()))?;

        let enhanced = Builder::new()
            .suffix(".png")
            .tempfile()
            .context("creating temporary enhanced image file")?;

        let status = Command::new("convert")
            .arg(ppm.path())
            .args([
                "-filter", "Catrom",
                "-density", "300",
                "-contrast",
                "-despeckle",
                "-colorspace", "Gray",
                "-sharpen", "0x1",
                "-posterize", "3",
                "-negate",
                "-gamma", "100",
                "-blur", "1x65535",
            ])
            .arg(enhanced.path())
            .status()
            .context("spawning convert; is imagemagick installed?")?;
        if !status.success() {
            bail!("convert exited with {status}");
        }

        let output = Command::new("tesseract")
            .arg(enhanced.path())
            .arg("stdout")
            .args(["--psm", "11"])
            .output()
            .context("spawning tesseract; is it installed?")?;
        if !output.status.success() {
            bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        String::from_utf8(output.stdout).context("tesseract output was not valid utf-8")
    }

    /// Block until an OCR pass over the display ([`Machine::get_screen_text`])
    /// matches `pattern`. Each poll re-runs the full screendump/OCR pipeline,
    /// so this is considerably more expensive per attempt than the
    /// console/tty/shell-based waits.
    pub fn wait_for_text(&self, pattern: &str) -> Result<()> {
        let regex = regex::Regex::new(pattern).context("compiling screen-text regex")?;
        retry::retry(|_| Ok(regex.is_match(&self.get_screen_text()?)))
    }

    /// Read the text currently shown on virtual console `tty` (as in
    /// `/dev/vcs<tty>`, not the graphical display), folded to the TTY's
    /// real width so a regex spanning a wrapped line still matches.
    pub fn get_tty_text(&self, tty: u8) -> Result<String> {
        self.with_shell(|shell| {
            shell.execute_checked(&format!(
                "fold -w$(stty -F /dev/tty{tty} size | awk '{{print $2}}') /dev/vcs{tty}"
            ))
        })
    }

    /// Block until [`Machine::get_tty_text`] on `tty` matches `pattern`.
    pub fn wait_until_tty_matches(&self, tty: u8, pattern: &str) -> Result<()> {
        let regex = regex::Regex::new(pattern).context("compiling tty regex")?;
        retry::retry(|_| Ok(regex.is_match(&self.get_tty_text(tty)?)))
    }

    /// Block until an X server is listening on the guest's default display.
    ///
    /// Checking only for the `/tmp/.X11-unix/X0` socket is not enough: it
    /// can exist slightly before the display manager has actually reached
    /// its graphical target, so this also waits for that journal entry.
    pub fn wait_for_x(&self) -> Result<()> {
        retry::retry(|_| {
            let (_, status) = self.with_shell(|shell| {
                shell.execute(
                    "journalctl -b SYSLOG_IDENTIFIER=systemd | grep -q 'Reached target Current graphical'",
                )
            })?;
            if status != 0 {
                return Ok(false);
            }
            let (_, status) =
                self.with_shell(|shell| shell.execute("[ -e /tmp/.X11-unix/X0 ]"))?;
            Ok(status == 0)
        })
    }

    /// List the titles of every top-level window currently mapped on the
    /// guest's X display.
    pub fn get_window_names(&self) -> Result<Vec<String>> {
        let output = self.with_shell(|shell| {
            shell.execute_checked("DISPLAY=:0 xwininfo -root -tree | grep -E '^\\s+0x' || true")
        })?;
        Ok(output
            .lines()
            .filter_map(|line| {
                let start = line.find('"')?;
                let end = line[start + 1..].find('"')? + start + 1;
                Some(line[start + 1..end].to_string())
            })
            .collect())
    }

    /// Block until some window's title matches `pattern`.
    pub fn wait_for_window(&self, pattern: &str) -> Result<()> {
        let regex = regex::Regex::new(pattern).context("compiling window-title regex")?;
        retry::retry(|_| {
            let names = self.get_window_names()?;
            Ok(names.iter().any(|name| regex.is_match(name)))
        })
    }

    /// Send a single raw QEMU `sendkey` token (e.g. `ctrl-alt-f1`) to the
    /// display, unlike [`Machine::send_chars`] which maps printable text.
    pub fn send_key(&self, qemu_key: &str) -> Result<()> {
        self.with_monitor(|monitor| monitor.send_key(qemu_key))
    }

    /// Type `text` into the display one character at a time via the
    /// monitor's `sendkey`, translating each character with
    /// [`crate::keys::char_to_key`].
    pub fn send_chars(&self, text: &str) -> Result<()> {
        for c in text.chars() {
            let key = crate::keys::char_to_key(c);
            self.with_monitor(|monitor| monitor.send_key(&key))?;
            std::thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    }
}
