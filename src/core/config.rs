//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{BrsError, Result};

/// Full configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub watchdog: WatchdogConfig,
    pub store: StoreConfig,
    pub paths: PathsConfig,
}

/// Inventory and hashing behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScanConfig {
    pub start_path: PathBuf,
    /// Use paths verbatim instead of resolving them with `realpath`.
    pub skip_realpath: bool,
    pub chunk_size_bytes: usize,
    pub parallelism: usize,
    pub cross_devices: bool,
    pub excluded_paths: Vec<PathBuf>,
}

/// Stall detection knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    pub stall_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

/// Baseline database settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub db_file: PathBuf,
    /// Attempts for transient open/busy/locked failures before giving up.
    pub open_retries: u32,
    pub retry_backoff_ms: u64,
    pub busy_timeout_ms: u64,
}

/// Filesystem paths used by brs itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_path: PathBuf::from("/"),
            skip_realpath: false,
            chunk_size_bytes: 1024 * 1024,
            parallelism: std::thread::available_parallelism()
                .map_or(2, |n| n.get().saturating_div(2).max(1)),
            cross_devices: true,
            excluded_paths: vec![
                PathBuf::from("/proc"),
                PathBuf::from("/sys"),
                PathBuf::from("/dev"),
                PathBuf::from("/run"),
            ],
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: 5_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl WatchdogConfig {
    #[must_use]
    pub const fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from("data.db"),
            open_retries: 5,
            retry_backoff_ms: 200,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[BRS-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("brs").join("config.toml"),
            jsonl_log: home_dir
                .join(".local")
                .join("share")
                .join("brs")
                .join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| BrsError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(BrsError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the JSON form, stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // scan
        if let Some(raw) = lookup("BRS_SCAN_START_PATH") {
            self.scan.start_path = PathBuf::from(raw);
        }
        set_bool(&mut lookup, "BRS_SCAN_SKIP_REALPATH", &mut self.scan.skip_realpath)?;
        set_parsed(
            &mut lookup,
            "BRS_SCAN_CHUNK_SIZE_BYTES",
            &mut self.scan.chunk_size_bytes,
        )?;
        set_parsed(&mut lookup, "BRS_SCAN_PARALLELISM", &mut self.scan.parallelism)?;
        set_bool(&mut lookup, "BRS_SCAN_CROSS_DEVICES", &mut self.scan.cross_devices)?;

        // watchdog
        set_parsed(
            &mut lookup,
            "BRS_WATCHDOG_STALL_TIMEOUT_MS",
            &mut self.watchdog.stall_timeout_ms,
        )?;
        set_parsed(
            &mut lookup,
            "BRS_WATCHDOG_POLL_INTERVAL_MS",
            &mut self.watchdog.poll_interval_ms,
        )?;

        // store
        if let Some(raw) = lookup("BRS_STORE_DB_FILE") {
            self.store.db_file = PathBuf::from(raw);
        }
        set_parsed(&mut lookup, "BRS_STORE_OPEN_RETRIES", &mut self.store.open_retries)?;
        set_parsed(
            &mut lookup,
            "BRS_STORE_RETRY_BACKOFF_MS",
            &mut self.store.retry_backoff_ms,
        )?;
        set_parsed(
            &mut lookup,
            "BRS_STORE_BUSY_TIMEOUT_MS",
            &mut self.store.busy_timeout_ms,
        )?;

        // paths
        if let Some(raw) = lookup("BRS_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }

        Ok(())
    }

    /// Strip trailing slashes so exclusion checks compare equal to walked paths.
    fn normalize_paths(&mut self) {
        for path in self
            .scan
            .excluded_paths
            .iter_mut()
            .chain(std::iter::once(&mut self.scan.start_path))
        {
            let s = path.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *path = PathBuf::from(stripped);
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.scan.chunk_size_bytes == 0 {
            return Err(BrsError::InvalidConfig {
                details: "scan.chunk_size_bytes must be > 0".to_string(),
            });
        }
        if self.scan.parallelism == 0 {
            return Err(BrsError::InvalidConfig {
                details: "scan.parallelism must be >= 1".to_string(),
            });
        }
        if self.watchdog.poll_interval_ms == 0 {
            return Err(BrsError::InvalidConfig {
                details: "watchdog.poll_interval_ms must be > 0".to_string(),
            });
        }
        if self.watchdog.stall_timeout_ms <= self.watchdog.poll_interval_ms {
            return Err(BrsError::InvalidConfig {
                details: format!(
                    "watchdog.stall_timeout_ms ({}) must be > watchdog.poll_interval_ms ({})",
                    self.watchdog.stall_timeout_ms, self.watchdog.poll_interval_ms
                ),
            });
        }
        if self.store.open_retries == 0 {
            return Err(BrsError::InvalidConfig {
                details: "store.open_retries must be >= 1".to_string(),
            });
        }
        if self.store.db_file.as_os_str().is_empty() {
            return Err(BrsError::InvalidConfig {
                details: "store.db_file must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_parsed<F, T>(lookup: &mut F, name: &str, slot: &mut T) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.trim().parse::<T>().map_err(|error| BrsError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    set_parsed(lookup, name, slot)
}

#[cfg(test)]
mod tests {
    use super::{BrsError, Config};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scan.start_path, PathBuf::from("/"));
        assert_eq!(cfg.store.db_file, PathBuf::from("data.db"));
        assert_eq!(cfg.watchdog.stall_timeout_ms, 5_000);
        assert_eq!(cfg.watchdog.poll_interval_ms, 1_000);
    }

    #[test]
    fn stall_timeout_must_exceed_poll_interval() {
        let mut cfg = Config::default();
        cfg.watchdog.stall_timeout_ms = 500;
        let err = cfg.validate().expect_err("expected watchdog error");
        assert!(err.to_string().contains("stall_timeout_ms"));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let mut cfg = Config::default();
        cfg.scan.chunk_size_bytes = 0;
        let err = cfg.validate().expect_err("expected chunk size error");
        assert!(err.to_string().contains("chunk_size_bytes"));
    }

    #[test]
    fn zero_open_retries_rejected() {
        let mut cfg = Config::default();
        cfg.store.open_retries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("BRS_SCAN_SKIP_REALPATH", "true"),
            ("BRS_WATCHDOG_STALL_TIMEOUT_MS", "9000"),
            ("BRS_STORE_DB_FILE", "/var/lib/brs/baseline.db"),
            ("BRS_SCAN_CHUNK_SIZE_BYTES", "4096"),
        ]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("overrides should parse");

        assert!(cfg.scan.skip_realpath);
        assert_eq!(cfg.watchdog.stall_timeout_ms, 9_000);
        assert_eq!(cfg.store.db_file, PathBuf::from("/var/lib/brs/baseline.db"));
        assert_eq!(cfg.scan.chunk_size_bytes, 4096);
    }

    #[test]
    fn env_invalid_boolean_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("BRS_SCAN_SKIP_REALPATH", "sometimes")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("invalid bool should fail");
        match err {
            BrsError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("BRS_SCAN_SKIP_REALPATH"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn normalize_paths_trims_trailing_slashes_and_keeps_root() {
        let mut cfg = Config::default();
        cfg.scan.start_path = PathBuf::from("/srv/data/");
        cfg.scan.excluded_paths = vec![PathBuf::from("/"), PathBuf::from("/srv/data/tmp/")];
        cfg.normalize_paths();
        assert_eq!(cfg.scan.start_path, PathBuf::from("/srv/data"));
        assert!(cfg.scan.excluded_paths.contains(&PathBuf::from("/")));
        assert!(cfg.scan.excluded_paths.contains(&PathBuf::from("/srv/data/tmp")));
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/brs/config.toml"))).unwrap_err();
        assert!(matches!(err, BrsError::MissingConfig { .. }));
    }

    #[test]
    fn load_parses_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[watchdog]\nstall_timeout_ms = 2500\n\n[scan]\nskip_realpath = true\n",
        )
        .unwrap();
        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.watchdog.stall_timeout_ms, 2_500);
        assert_eq!(cfg.watchdog.poll_interval_ms, 1_000);
        assert!(cfg.scan.skip_realpath);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn stable_hash_tracks_changes() {
        let cfg = Config::default();
        let before = cfg.stable_hash().expect("hash");
        assert_eq!(before, cfg.stable_hash().expect("hash"));
        let mut modified = Config::default();
        modified.scan.chunk_size_bytes += 1;
        assert_ne!(before, modified.stable_hash().expect("hash"));
    }
}
