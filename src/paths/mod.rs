//! Model storage path resolution.
//!
//! Maps the running OS to the per-user application data directory and makes
//! sure the model subdirectory exists before anything else touches it. The
//! layout matches what the desktop client expects:
//!
//! - Windows: `%APPDATA%\microchat\models`
//! - macOS: `~/Library/Application Support/microchat/models`
//! - other Unix: `~/.local/share/microchat/models`
//! - anything else: `~/.microchat/models`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Application directory name under the user's data root.
pub const APP_DIR_NAME: &str = "microchat";

/// The single model file this backend manages.
pub const MODEL_FILENAME: &str = "Llama-3.2-3B-Instruct-Q4_0.gguf";

/// Operating system family, as far as storage layout is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsIdentity {
    Windows,
    MacOs,
    OtherUnix,
    /// Kernel identity could not be determined.
    Unknown,
}

impl OsIdentity {
    /// Identity of the platform this binary was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OsIdentity::Windows
        } else if cfg!(target_os = "macos") {
            OsIdentity::MacOs
        } else if cfg!(unix) {
            OsIdentity::OtherUnix
        } else {
            OsIdentity::Unknown
        }
    }
}

/// Resolved location of the model file on disk.
///
/// Derived once at startup and immutable afterwards. The directory is
/// guaranteed to exist after resolution succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelLocation {
    /// Directory holding the model file (`<base>/models`).
    pub directory: PathBuf,
    /// Model file name.
    pub filename: String,
    /// Full path to the model file.
    pub full_path: PathBuf,
}

impl ModelLocation {
    /// Resolve the model location for the current OS and user.
    ///
    /// Creates the directory chain if it is missing. There is no fallback
    /// location: a filesystem failure here is fatal to the caller.
    pub fn resolve() -> Result<Self> {
        let base = base_dir(OsIdentity::current())?;
        Self::resolve_in(&base)
    }

    /// Resolve relative to an explicit base directory.
    ///
    /// Idempotent: calling twice yields the same location and does not fail
    /// if the directory already exists.
    pub fn resolve_in(base: &Path) -> Result<Self> {
        let directory = base.join("models");
        fs::create_dir_all(&directory).with_context(|| {
            format!("failed to create model directory {}", directory.display())
        })?;
        let full_path = directory.join(MODEL_FILENAME);
        Ok(Self {
            directory,
            filename: MODEL_FILENAME.to_string(),
            full_path,
        })
    }

    /// Whether the model file is present on disk.
    pub fn exists(&self) -> bool {
        self.full_path.exists()
    }

    /// Size of the model file in bytes, if present.
    pub fn size_bytes(&self) -> Option<u64> {
        fs::metadata(&self.full_path).ok().map(|m| m.len())
    }
}

/// Base application directory for the current user.
fn base_dir(identity: OsIdentity) -> Result<PathBuf> {
    let home = dirs::home_dir();
    let app_data = dirs::data_dir();
    base_dir_from(identity, home.as_deref(), app_data.as_deref())
        .context("could not determine a user directory for model storage")
}

/// Pure mapping from OS identity and user directories to the base directory.
///
/// Returns `None` only when the required user directory is unavailable.
fn base_dir_from(
    identity: OsIdentity,
    home: Option<&Path>,
    app_data: Option<&Path>,
) -> Option<PathBuf> {
    match identity {
        OsIdentity::Windows => app_data.map(|d| d.join(APP_DIR_NAME)),
        OsIdentity::MacOs => home.map(|h| {
            h.join("Library")
                .join("Application Support")
                .join(APP_DIR_NAME)
        }),
        OsIdentity::OtherUnix => {
            home.map(|h| h.join(".local").join("share").join(APP_DIR_NAME))
        }
        OsIdentity::Unknown => home.map(|h| h.join(format!(".{APP_DIR_NAME}"))),
    }
}
