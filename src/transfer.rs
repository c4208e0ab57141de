use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use tempfile::Builder;

use crate::machine::{Machine, GUEST_SHARED_DIR};

const BASE64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

impl Machine {
    /// Copy `host_path` (file or directory) into the guest at
    /// `guest_path` via the shared directory.
    ///
    /// This is the preferred transfer strategy: it avoids the
    /// base64-over-shell overhead and the shell command-length limits that
    /// come with it. A unique subdirectory under the shared directory is
    /// used for staging so concurrent transfers don't collide.
    pub fn copy_from_host(&self, host_path: &Path, guest_path: &str) -> Result<()> {
        let staging = Builder::new()
            .prefix("xfer-")
            .tempdir_in(self.shared_dir())
            .context("creating staging directory in shared dir")?;

        let file_name = host_path
            .file_name()
            .context("host_path must have a file name")?;
        let staged = staging.path().join(file_name);

        if host_path.is_dir() {
            copy_dir_recursive(host_path, &staged)
                .with_context(|| format!("copying directory {}", host_path.display()))?;
        } else {
            fs::copy(host_path, &staged)
                .with_context(|| format!("copying file {}", host_path.display()))?;
        }

        let guest_staging = self.guest_shared_path(&staging.path().join(file_name))?;
        self.with_shell(|shell| {
            shell.execute_checked(&format!(
                "mkdir -p $(dirname {guest_path}) && cp -r {guest_staging} {guest_path}"
            ))
        })?;

        Ok(())
    }

    /// Copy `guest_path` out of the guest to `host_path` via the shared
    /// directory, the symmetric counterpart of [`Machine::copy_from_host`].
    pub fn copy_from_vm(&self, guest_path: &str, host_path: &Path) -> Result<()> {
        let staging = Builder::new()
            .prefix("xfer-")
            .tempdir_in(self.shared_dir())
            .context("creating staging directory in shared dir")?;

        let guest_staging = self.guest_shared_path(&staging.path().join("out"))?;
        self.with_shell(|shell| {
            shell.execute_checked(&format!("cp -r {guest_path} {guest_staging}"))
        })?;

        let staged = staging.path().join("out");
        if staged.is_dir() {
            copy_dir_recursive(&staged, host_path)
                .with_context(|| format!("copying directory to {}", host_path.display()))?;
        } else {
            fs::copy(&staged, host_path)
                .with_context(|| format!("copying file to {}", host_path.display()))?;
        }

        Ok(())
    }

    /// Copy `host_path` into the guest by base64-encoding its contents and
    /// decoding them with `base64 -d` inside the guest shell.
    ///
    /// Explicit fallback for callers running without a shared directory;
    /// only suitable for single files small enough to fit in one shell
    /// command.
    pub fn copy_from_host_via_shell(&self, host_path: &Path, guest_path: &str) -> Result<()> {
        let contents = fs::read(host_path)
            .with_context(|| format!("reading host file {}", host_path.display()))?;
        let encoded = BASE64.encode(&contents);

        self.with_shell(|shell| {
            shell.execute_checked(&format!(
                "mkdir -p $(dirname {guest_path}) && echo -n '{encoded}' | base64 -d > {guest_path}"
            ))
        })?;

        Ok(())
    }

    /// Copy `guest_path` out of the guest the same way, in reverse.
    pub fn copy_from_vm_via_shell(&self, guest_path: &str, host_path: &Path) -> Result<()> {
        let encoded = self.with_shell(|shell| shell.execute_checked(&format!("base64 -w0 {guest_path}")))?;

        let decoded = BASE64
            .decode(encoded.trim())
            .context("decoding base64 output from guest")?;

        fs::write(host_path, decoded)
            .with_context(|| format!("writing host file {}", host_path.display()))?;

        Ok(())
    }
}

impl Machine {
    /// The shared directory is mounted at a fixed path inside the guest; this
    /// rewrites a host-side path under the shared directory into the
    /// corresponding guest-side path, preserving the staging subdirectory so
    /// concurrent transfers (each given their own `tempdir_in`) don't
    /// collide on the guest side either.
    fn guest_shared_path(&self, host_path: &Path) -> Result<String> {
        let relative = host_path
            .strip_prefix(self.shared_dir())
            .context("staged path must live under the shared directory")?;
        Ok(format!("{GUEST_SHARED_DIR}/{}", relative.display()))
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dest_path = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            fs::copy(entry.path(), dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encoding_is_stable() {
        let data = b"hello there, this has \xffnon-utf8 bytes too";
        let encoded = BASE64.encode(data);
        let decoded = BASE64.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn copy_dir_recursive_preserves_nested_structure() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir(src.path().join("nested")).unwrap();
        fs::write(src.path().join("a.txt"), b"a").unwrap();
        fs::write(src.path().join("nested/b.txt"), b"b").unwrap();

        let dst = tempfile::tempdir().unwrap();
        copy_dir_recursive(src.path(), &dst.path().join("copy")).unwrap();

        assert_eq!(fs::read(dst.path().join("copy/a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(dst.path().join("copy/nested/b.txt")).unwrap(), b"b");
    }
}
