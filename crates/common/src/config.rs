//! Coordinator configuration.
//!
//! Resolution order, lowest precedence first: built-in defaults, optional
//! TOML file, `COORD_*` environment variables. The CLI applies its flags on
//! top of the returned [`CoordConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use path_clean::PathClean;
use serde::Deserialize;

pub const DEFAULT_RENDEZVOUS: &str = "coordd";

pub const ENV_CONFIG: &str = "COORD_CONFIG";
pub const ENV_RENDEZVOUS: &str = "COORD_RENDEZVOUS";
pub const ENV_RUNTIME_DIR: &str = "COORD_RUNTIME_DIR";
pub const ENV_SETTINGS_FILE: &str = "COORD_SETTINGS_FILE";
pub const ENV_DEBUG: &str = "COORD_DEBUG";
pub const ENV_MAX_RESTARTS: &str = "COORD_MAX_RESTARTS";
pub const ENV_RESTART_COOLDOWN_MS: &str = "COORD_RESTART_COOLDOWN_MS";
pub const ENV_DISABLE_PATH_REWRITE: &str = "COORD_DISABLE_PATH_REWRITE";

#[derive(Debug, Clone)]
pub struct CoordConfig {
    pub rendezvous: String,
    pub runtime_dir: PathBuf,
    pub settings_file: PathBuf,
    pub debug: bool,
    pub tick_interval: Duration,
    pub grace_period: Duration,
    pub max_kill_attempts: u32,
    pub shutdown_timeout: Duration,
    pub worker_stop_timeout: Duration,
    pub negotiation_retries: u32,
    pub negotiation_backoff: Duration,
    pub max_restarts: u32,
    pub restart_cooldown: Duration,
    pub disable_path_rewrite: bool,
    /// Ignored values found while loading. Loading happens before logging is
    /// set up, so the caller reports these once a subscriber exists.
    pub warnings: Vec<String>,
}

impl Default for CoordConfig {
    fn default() -> Self {
        let tick_interval = Duration::from_millis(3_000);
        Self {
            rendezvous: DEFAULT_RENDEZVOUS.to_string(),
            runtime_dir: std::env::temp_dir(),
            settings_file: default_settings_file(),
            debug: false,
            tick_interval,
            grace_period: tick_interval,
            max_kill_attempts: 3,
            shutdown_timeout: Duration::from_millis(10_000),
            worker_stop_timeout: Duration::from_millis(5_000),
            negotiation_retries: 3,
            negotiation_backoff: Duration::from_millis(50),
            max_restarts: 3,
            restart_cooldown: Duration::from_millis(2_000),
            disable_path_rewrite: false,
            warnings: Vec::new(),
        }
    }
}

/// On-disk shape; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    rendezvous: Option<String>,
    runtime_dir: Option<String>,
    settings_file: Option<String>,
    debug: Option<bool>,
    tick_interval_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    max_kill_attempts: Option<u32>,
    shutdown_timeout_ms: Option<u64>,
    worker_stop_timeout_ms: Option<u64>,
    negotiation_retries: Option<u32>,
    negotiation_backoff_ms: Option<u64>,
    max_restarts: Option<u32>,
    restart_cooldown_ms: Option<u64>,
    disable_path_rewrite: Option<bool>,
}

impl CoordConfig {
    /// Defaults, then `path` (or `COORD_CONFIG`) when given, then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let env_path = std::env::var(ENV_CONFIG).ok().map(PathBuf::from);
        if let Some(path) = path.map(Path::to_path_buf).or(env_path) {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            config.apply_toml(&contents, path.parent())
                .with_context(|| format!("invalid config {}", path.display()))?;
        }

        config.apply_env();
        Ok(config)
    }

    /// Apply a TOML document; relative paths resolve against `base`.
    pub fn apply_toml(&mut self, contents: &str, base: Option<&Path>) -> Result<()> {
        let file: FileConfig = toml::from_str(contents)?;

        if let Some(name) = file.rendezvous {
            self.rendezvous = name;
        }
        if let Some(dir) = file.runtime_dir {
            self.runtime_dir = resolve_path(&dir, base);
        }
        if let Some(path) = file.settings_file {
            self.settings_file = resolve_path(&path, base);
        }
        if let Some(debug) = file.debug {
            self.debug = debug;
        }
        if let Some(ms) = file.tick_interval_ms {
            self.set_tick_interval(ms);
        }
        if let Some(ms) = file.grace_period_ms {
            self.grace_period = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.max_kill_attempts {
            self.max_kill_attempts = attempts.max(1);
        }
        if let Some(ms) = file.shutdown_timeout_ms {
            self.shutdown_timeout = Duration::from_millis(clamp(ms, 100, 600_000));
        }
        if let Some(ms) = file.worker_stop_timeout_ms {
            self.worker_stop_timeout = Duration::from_millis(clamp(ms, 10, 600_000));
        }
        if let Some(retries) = file.negotiation_retries {
            self.negotiation_retries = retries;
        }
        if let Some(ms) = file.negotiation_backoff_ms {
            self.negotiation_backoff = Duration::from_millis(clamp(ms, 1, 10_000));
        }
        if let Some(max) = file.max_restarts {
            self.max_restarts = max;
        }
        if let Some(ms) = file.restart_cooldown_ms {
            self.restart_cooldown = Duration::from_millis(ms);
        }
        if let Some(flag) = file.disable_path_rewrite {
            self.disable_path_rewrite = flag;
        }
        Ok(())
    }

    /// Overlay `COORD_*` variables. Unparsable values are skipped and
    /// recorded in [`CoordConfig::warnings`].
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// [`CoordConfig::apply_env`] against an arbitrary variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(name) = var(ENV_RENDEZVOUS) {
            self.rendezvous = name;
        }
        if let Some(dir) = var(ENV_RUNTIME_DIR) {
            self.runtime_dir = resolve_path(&dir, None);
        }
        if let Some(path) = var(ENV_SETTINGS_FILE) {
            self.settings_file = resolve_path(&path, None);
        }
        if let Some(debug) = self.env_bool(ENV_DEBUG, var(ENV_DEBUG)) {
            self.debug = debug;
        }
        if let Some(max) = self.env_u64(ENV_MAX_RESTARTS, var(ENV_MAX_RESTARTS)) {
            self.max_restarts = max.min(u64::from(u32::MAX)) as u32;
        }
        if let Some(ms) = self.env_u64(ENV_RESTART_COOLDOWN_MS, var(ENV_RESTART_COOLDOWN_MS)) {
            self.restart_cooldown = Duration::from_millis(ms);
        }
        if let Some(flag) = self.env_bool(ENV_DISABLE_PATH_REWRITE, var(ENV_DISABLE_PATH_REWRITE)) {
            self.disable_path_rewrite = flag;
        }
    }

    fn env_u64(&mut self, name: &str, raw: Option<String>) -> Option<u64> {
        let raw = raw?;
        match raw.parse::<u64>() {
            Ok(value) => Some(value),
            Err(err) => {
                self.warnings
                    .push(format!("Invalid {} value '{}': {}", name, raw, err));
                None
            }
        }
    }

    fn env_bool(&mut self, name: &str, raw: Option<String>) -> Option<bool> {
        let raw = raw?;
        let parsed = parse_bool(&raw);
        if parsed.is_none() {
            self.warnings
                .push(format!("Invalid {} value '{}': expected a boolean", name, raw));
        }
        parsed
    }

    /// Tick interval in milliseconds, clamped to [100ms, 60s].
    pub fn set_tick_interval(&mut self, ms: u64) {
        let follow = self.grace_period == self.tick_interval;
        self.tick_interval = Duration::from_millis(clamp(ms, 100, 60_000));
        if follow {
            self.grace_period = self.tick_interval;
        }
    }
}

/// `~/.config/coordd/settings.json`, or a temp-dir fallback without `HOME`.
pub fn default_settings_file() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) if !home.is_empty() => PathBuf::from(home)
            .join(".config")
            .join("coordd")
            .join("settings.json"),
        _ => std::env::temp_dir().join("coordd-settings.json"),
    }
}

fn resolve_path(raw: &str, base: Option<&Path>) -> PathBuf {
    let expanded = PathBuf::from(expand_home(raw));
    let resolved = if expanded.is_absolute() {
        expanded
    } else if let Some(base) = base {
        base.join(expanded)
    } else {
        expanded
    };
    resolved.clean()
}

fn expand_home(raw: &str) -> String {
    if let Some(stripped) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, stripped);
        }
    }
    raw.to_string()
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn clamp(v: u64, min: u64, max: u64) -> u64 {
    if v < min {
        return min;
    }
    if v > max {
        return max;
    }
    v
}
