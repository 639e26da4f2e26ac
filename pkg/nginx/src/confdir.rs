use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, info};

use pkg_constants::paths::{CERTS_DIR, MAIN_CONF_FILE, STAGING_DIR};

use crate::render::RenderedConfig;

/// The directory the proxy reads its configuration from.
///
/// A new tree is first written under `.staging` so it can be validated
/// without touching live files, then promoted file by file with renames
/// inside the same filesystem.
#[derive(Debug, Clone)]
pub struct ConfigDir {
    root: PathBuf,
}

impl ConfigDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn main_conf(&self) -> PathBuf {
        self.root.join(MAIN_CONF_FILE)
    }

    pub fn staging(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Wipe whatever a previous run left behind.
    pub fn reset(&self) -> anyhow::Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .with_context(|| format!("removing {}", self.root.display()))?;
        }
        fs::create_dir_all(self.root.join(CERTS_DIR))?;
        info!("Config directory {} reset", self.root.display());
        Ok(())
    }

    /// Write `rendered` into the staging tree. Returns the staged main file.
    pub fn stage(&self, rendered: &RenderedConfig) -> anyhow::Result<PathBuf> {
        let staging = self.staging();
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        for (rel, content) in rendered.files() {
            let path = staging.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_file(&path, content).with_context(|| format!("writing {}", path.display()))?;
        }
        debug!("Staged {} files in {}", rendered.len(), staging.display());
        Ok(staging.join(MAIN_CONF_FILE))
    }

    /// Move the staged files over the live ones, then delete live files the
    /// new tree no longer contains.
    pub fn promote(&self, rendered: &RenderedConfig) -> anyhow::Result<()> {
        let staging = self.staging();
        for (rel, _) in rendered.files() {
            let from = staging.join(rel);
            let to = self.root.join(rel);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&from, &to)
                .with_context(|| format!("promoting {} to {}", from.display(), to.display()))?;
        }

        let live: BTreeSet<PathBuf> = rendered.files().map(|(rel, _)| rel.clone()).collect();
        for stale in self.managed_files()?.difference(&live) {
            fs::remove_file(self.root.join(stale))?;
            debug!("Removed stale {}", stale.display());
        }
        self.discard_staging()
    }

    pub fn discard_staging(&self) -> anyhow::Result<()> {
        let staging = self.staging();
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        Ok(())
    }

    /// Live `.conf` and `.pem` files below the root, relative to it,
    /// excluding the staging tree.
    fn managed_files(&self) -> anyhow::Result<BTreeSet<PathBuf>> {
        let mut out = BTreeSet::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    if path != self.staging() {
                        pending.push(path);
                    }
                } else if file_type.is_file() && is_config_file(&path) {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        out.insert(rel.to_path_buf());
                    }
                }
            }
        }
        Ok(out)
    }
}

fn is_key_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("pem")
}

// Certificate bundles carry the private key: owner-only.
fn write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mode = if is_key_file(path) { 0o600 } else { 0o644 };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    file.write_all(content)?;
    // `mode` only applies on creation and is subject to the umask.
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn is_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("conf") | Some("pem")
    )
}
