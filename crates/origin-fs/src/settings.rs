//! Installation settings.
//!
//! Settings come from a TOML file (`--config`, then `ORIGINFS_CONFIG`, then
//! `<config dir>/originfs/config.toml`) and fall back to defaults rooted at
//! `ORIGINFS_HOME` or the platform's local data directory.

use crate::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "ORIGINFS_CONFIG";

/// Environment variable overriding the default state directory.
pub const HOME_ENV: &str = "ORIGINFS_HOME";

const REGISTRY_FILE: &str = "origins.json";
const LOG_FILE: &str = "mount.log";

/// Installation-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Registry document, locks, staging areas and the worker log live here.
    pub state_dir: PathBuf,
    /// Parent directory of newly created origins.
    pub storage_root: PathBuf,
    /// Parent directory of every mount point.
    pub mount_root: PathBuf,
    /// How long a daemonizing mount waits for its worker to become ready.
    pub readiness_timeout_secs: u64,
    /// stdout/stderr sink of a daemonized mount worker.
    pub log_file: Option<PathBuf>,
    /// Creator tag recorded in per-origin metadata.
    pub creator_tag: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::rooted_at(default_state_dir())
    }
}

impl Settings {
    /// Settings with every directory placed under `state_dir`.
    pub fn rooted_at<P: Into<PathBuf>>(state_dir: P) -> Self {
        let state_dir = state_dir.into();
        Self {
            storage_root: state_dir.join("origins"),
            mount_root: state_dir.join("mnt"),
            state_dir,
            readiness_timeout_secs: 30,
            log_file: None,
            creator_tag: "originfs".to_string(),
        }
    }

    /// Resolve settings from an explicit path, the environment or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let candidate = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(CONFIG_ENV)
                .map(PathBuf::from)
                .or_else(|| {
                    dirs::config_dir()
                        .map(|dir| dir.join("originfs").join("config.toml"))
                        .filter(|path| path.is_file())
                }),
        };

        let settings = match candidate {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.absolutize()
    }

    /// Parse a TOML settings file. Relative paths resolve against its directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let text = fs::read_to_string(path).map_err(|e| Error::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Fields left out of the file follow `state_dir` rather than the global default.
        let raw: toml::Table = toml::from_str(&text).map_err(|e| Error::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let base = match raw.get("state_dir").and_then(|v| v.as_str()) {
            Some(dir) => Self::rooted_at(dir),
            None => Self::default(),
        };
        let invalid = |reason: String| Error::Settings {
            path: path.to_path_buf(),
            reason,
        };
        let mut table = match toml::Value::try_from(&base).map_err(|e| invalid(e.to_string()))? {
            toml::Value::Table(table) => table,
            _ => toml::Table::new(),
        };
        for (key, value) in raw {
            table.insert(key, value);
        }
        let merged: Settings = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| invalid(e.to_string()))?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(merged.relative_to(dir))
    }

    fn relative_to(mut self, dir: &Path) -> Self {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        join(&mut self.state_dir);
        join(&mut self.storage_root);
        join(&mut self.mount_root);
        if let Some(log) = self.log_file.as_mut() {
            join(log);
        }
        self
    }

    fn absolutize(self) -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|e| Error::Settings {
            path: PathBuf::from("."),
            reason: e.to_string(),
        })?;
        Ok(self.relative_to(&cwd))
    }

    /// Path of the registry document.
    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join(REGISTRY_FILE)
    }

    /// Directory holding per-origin lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Directory holding staging areas of mounted lazy archives.
    pub fn staging_root(&self) -> PathBuf {
        self.state_dir.join("staging")
    }

    /// Where a daemonized worker sends stdout and stderr.
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join(LOG_FILE))
    }

    /// Bounded readiness wait of a daemonizing mount.
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    /// Create every directory the settings refer to.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.storage_root,
            &self.mount_root,
            &self.lock_dir(),
            &self.staging_root(),
        ] {
            fs::create_dir_all(dir).map_err(|e| Error::Settings {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(home);
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("originfs"))
        .unwrap_or_else(|| std::env::temp_dir().join("originfs"))
}
