use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Bounds applied to every caller, regardless of what they ask for.
#[derive(Debug, Clone)]
pub struct Limits {
    pub max_body_bytes: usize,
    pub default_list_limit: u32,
    pub max_list_limit: u32,
    pub default_replay_timeout_secs: u64,
    pub max_replay_timeout_secs: u64,
    pub max_replay_response_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_bytes: 1_048_576,
            default_list_limit: 20,
            max_list_limit: 100,
            default_replay_timeout_secs: 30,
            max_replay_timeout_secs: 300,
            max_replay_response_bytes: 65_536,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Retention {
    /// Per-endpoint cap, enforced on append. `None` keeps everything.
    pub max_entries: Option<u32>,
    /// Entries older than this are removed by the background sweep.
    pub max_age: Option<Duration>,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: String,
    pub cors_permissive: bool,
    pub cors_allowed_origins: Vec<String>,
    pub trust_proxy_headers: bool,
    pub notify_url: Option<String>,
    pub limits: Limits,
    pub retention: Retention,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            database_path: ":memory:".to_string(),
            cors_permissive: false,
            cors_allowed_origins: vec!["http://localhost:3000".to_string()],
            trust_proxy_headers: false,
            notify_url: None,
            limits: Limits::default(),
            retention: Retention {
                sweep_interval: Duration::from_secs(60),
                ..Retention::default()
            },
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: '{raw}'")),
        Err(_) => Ok(None),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Limits::default();

        let bind_addr = std::env::var("BIND_ADDR")
            .or_else(|_| std::env::var("PORT").map(|p| format!("0.0.0.0:{p}")))
            .unwrap_or_else(|_| "0.0.0.0:3000".to_string());

        let database_path = match std::env::var("DATABASE_PATH") {
            Ok(path) => path,
            Err(_) => {
                let current_dir = std::env::current_dir()?;
                let path: PathBuf = current_dir.join("hookwatch.db");
                path.to_string_lossy().into_owned()
            }
        };

        let cors_permissive = std::env::var("CORS_PERMISSIVE").is_ok();

        let cors_allowed_origins = if cors_permissive {
            Vec::new() // Not used in permissive mode
        } else {
            std::env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect()
        };

        let limits = Limits {
            max_body_bytes: env_parse("MAX_BODY_BYTES")?.unwrap_or(defaults.max_body_bytes),
            default_list_limit: env_parse("DEFAULT_LIST_LIMIT")?
                .unwrap_or(defaults.default_list_limit),
            max_list_limit: env_parse("MAX_LIST_LIMIT")?.unwrap_or(defaults.max_list_limit),
            default_replay_timeout_secs: env_parse("DEFAULT_REPLAY_TIMEOUT_SECS")?
                .unwrap_or(defaults.default_replay_timeout_secs),
            max_replay_timeout_secs: env_parse("MAX_REPLAY_TIMEOUT_SECS")?
                .unwrap_or(defaults.max_replay_timeout_secs),
            max_replay_response_bytes: env_parse("MAX_REPLAY_RESPONSE_BYTES")?
                .unwrap_or(defaults.max_replay_response_bytes),
        };
        anyhow::ensure!(
            limits.default_list_limit >= 1 && limits.default_list_limit <= limits.max_list_limit,
            "DEFAULT_LIST_LIMIT must be between 1 and MAX_LIST_LIMIT"
        );
        anyhow::ensure!(
            limits.default_replay_timeout_secs >= 1
                && limits.default_replay_timeout_secs <= limits.max_replay_timeout_secs,
            "DEFAULT_REPLAY_TIMEOUT_SECS must be between 1 and MAX_REPLAY_TIMEOUT_SECS"
        );

        let retention = Retention {
            max_entries: env_parse("RETENTION_MAX_ENTRIES")?,
            max_age: env_parse::<u64>("RETENTION_MAX_AGE_SECS")?.map(Duration::from_secs),
            sweep_interval: Duration::from_secs(
                env_parse::<u64>("RETENTION_SWEEP_SECS")?.unwrap_or(60).max(1),
            ),
        };
        anyhow::ensure!(
            retention.max_entries != Some(0),
            "RETENTION_MAX_ENTRIES must be at least 1"
        );

        Ok(Self {
            bind_addr,
            database_path,
            cors_permissive,
            cors_allowed_origins,
            trust_proxy_headers: std::env::var("TRUST_PROXY_HEADERS").is_ok(),
            notify_url: std::env::var("NOTIFY_URL").ok().filter(|s| !s.trim().is_empty()),
            limits,
            retention,
        })
    }

    pub fn log_startup_info(&self) {
        info!("Listening on {}", self.bind_addr);
        info!("Capture store: {}", self.database_path);
        info!(
            "Limits: body {} bytes, list {}/{}, replay timeout {}s/{}s",
            self.limits.max_body_bytes,
            self.limits.default_list_limit,
            self.limits.max_list_limit,
            self.limits.default_replay_timeout_secs,
            self.limits.max_replay_timeout_secs,
        );

        match (self.retention.max_entries, self.retention.max_age) {
            (None, None) => info!("Retention: logs kept until cleared"),
            (entries, age) => info!(
                "Retention: max {:?} entries per endpoint, max age {:?}",
                entries, age
            ),
        }

        if let Some(ref url) = self.notify_url {
            info!("Capture notifications sent to {}", url);
        }
    }
}
