//! Configuration file management for workpool.
//!
//! Provides a TOML-based config file at `~/.config/workpool/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use workpool_core::worker::SimulationConfig;

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_POLL_BACKOFF_MS: u64 = 100;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// On-disk config. Every key is optional.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub pool: PoolSection,
    pub worker: WorkerSection,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    /// Number of concurrent worker slots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Coordinator sleep between idle polls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_ticks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ticks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_every: Option<u64>,
}

impl ConfigFile {
    /// A config file with every key spelled out at its default value.
    pub fn with_defaults() -> Self {
        let sim = SimulationConfig::default();
        Self {
            server: ServerSection {
                bind: Some(DEFAULT_BIND.to_string()),
                port: Some(DEFAULT_PORT),
            },
            pool: PoolSection {
                size: Some(DEFAULT_POOL_SIZE),
                poll_backoff_ms: Some(DEFAULT_POLL_BACKOFF_MS),
            },
            worker: WorkerSection {
                tick_ms: Some(sim.tick.as_millis() as u64),
                min_ticks: Some(sim.min_ticks),
                max_ticks: Some(sim.max_ticks),
                progress_every: Some(sim.progress_every),
            },
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the workpool config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/workpool` or `~/.config/workpool`,
/// also on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("workpool");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("workpool")
}

/// Return the path to the workpool config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`. A missing file is an empty
/// config; a malformed one is an error.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line; `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub pool_size: Option<usize>,
    pub poll_backoff_ms: Option<u64>,
    pub tick_ms: Option<u64>,
}

/// Fully resolved and validated configuration, ready for use.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkpoolConfig {
    pub bind: String,
    pub port: u16,
    pub pool_size: usize,
    pub poll_backoff: Duration,
    pub simulation: SimulationConfig,
}

/// Read `name` from the environment and parse it. Unset is `None`; set but
/// unparsable is an error naming the variable.
fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} env var has an invalid value: {raw:?}")),
        Err(_) => Ok(None),
    }
}

impl WorkpoolConfig {
    /// Resolve configuration from the default config file location.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        Self::resolve_from(&config_path(), cli)
    }

    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// | key | flag | env |
    /// |---|---|---|
    /// | `server.bind` | `--bind` | `WORKPOOL_BIND` |
    /// | `server.port` | `--port` | `WORKPOOL_PORT` |
    /// | `pool.size` | `--pool-size` | `WORKPOOL_POOL_SIZE` |
    /// | `pool.poll_backoff_ms` | `--poll-backoff-ms` | `WORKPOOL_POLL_BACKOFF_MS` |
    /// | `worker.tick_ms` | `--tick-ms` | `WORKPOOL_TICK_MS` |
    /// | `worker.min_ticks` | | `WORKPOOL_MIN_TICKS` |
    /// | `worker.max_ticks` | | `WORKPOOL_MAX_TICKS` |
    /// | `worker.progress_every` | | `WORKPOOL_PROGRESS_EVERY` |
    pub fn resolve_from(path: &Path, cli: &CliOverrides) -> Result<Self> {
        let file = load_config_from(path)?;
        let sim_defaults = SimulationConfig::default();

        let bind = match cli.bind.clone() {
            Some(bind) => bind,
            None => env_var::<String>("WORKPOOL_BIND")?
                .or(file.server.bind)
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
        };
        let port = pick(cli.port, env_var("WORKPOOL_PORT")?, file.server.port, DEFAULT_PORT);
        let pool_size = pick(
            cli.pool_size,
            env_var("WORKPOOL_POOL_SIZE")?,
            file.pool.size,
            DEFAULT_POOL_SIZE,
        );
        let poll_backoff_ms = pick(
            cli.poll_backoff_ms,
            env_var("WORKPOOL_POLL_BACKOFF_MS")?,
            file.pool.poll_backoff_ms,
            DEFAULT_POLL_BACKOFF_MS,
        );
        let tick_ms = pick(
            cli.tick_ms,
            env_var("WORKPOOL_TICK_MS")?,
            file.worker.tick_ms,
            sim_defaults.tick.as_millis() as u64,
        );
        let min_ticks = pick(
            None,
            env_var("WORKPOOL_MIN_TICKS")?,
            file.worker.min_ticks,
            sim_defaults.min_ticks,
        );
        let max_ticks = pick(
            None,
            env_var("WORKPOOL_MAX_TICKS")?,
            file.worker.max_ticks,
            sim_defaults.max_ticks,
        );
        let progress_every = pick(
            None,
            env_var("WORKPOOL_PROGRESS_EVERY")?,
            file.worker.progress_every,
            sim_defaults.progress_every,
        );

        let config = Self {
            bind,
            port,
            pool_size,
            poll_backoff: Duration::from_millis(poll_backoff_ms),
            simulation: SimulationConfig {
                tick: Duration::from_millis(tick_ms),
                min_ticks,
                max_ticks,
                progress_every,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("pool.size must be at least 1");
        }
        let sim = &self.simulation;
        if sim.min_ticks == 0 {
            bail!("worker.min_ticks must be at least 1");
        }
        if sim.min_ticks > sim.max_ticks {
            bail!(
                "worker.min_ticks ({}) must not exceed worker.max_ticks ({})",
                sim.min_ticks,
                sim.max_ticks
            );
        }
        if sim.progress_every == 0 {
            bail!("worker.progress_every must be at least 1");
        }
        Ok(())
    }
}

fn pick<T>(cli: Option<T>, env: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(env).or(file).unwrap_or(default)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
