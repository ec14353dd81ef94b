use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{dispatcher::DispatchMode, errors::Error, Result};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 4;

/// Tunables of the dispatch engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Sessions inactive for longer than this become eviction candidates.
    pub idle_timeout: Duration,
    /// Spacing between idle sweeps.
    pub sweep_interval: Duration,
    /// Worker pool size (pooled mode only).
    pub workers: usize,
    pub mode: DispatchMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            workers: DEFAULT_WORKERS,
            mode: DispatchMode::Pooled,
        }
    }
}

impl EngineConfig {
    /// Read engine tunables from `CHATSTATE_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let idle_timeout = env_u64("CHATSTATE_IDLE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);
        let sweep_interval = env_u64("CHATSTATE_SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);
        let workers = env_u64("CHATSTATE_WORKERS")?
            .map(|n| n as usize)
            .unwrap_or(defaults.workers);
        let mode = match env_str("CHATSTATE_DISPATCH_MODE") {
            Some(raw) => raw.parse::<DispatchMode>()?,
            None => defaults.mode,
        };

        let cfg = Self {
            idle_timeout,
            sweep_interval,
            workers,
            mode,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("worker pool size must be > 0".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("idle sweep interval must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Process configuration for a chatstate bot.
#[derive(Clone, Debug)]
pub struct Config {
    pub telegram_bot_token: String,
    pub engine: EngineConfig,
    /// Directory for persisted session state; persistence is off when unset.
    pub store_dir: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let engine = EngineConfig::from_env()?;
        let store_dir = env_str("CHATSTATE_STORE_DIR")
            .and_then(non_empty)
            .map(PathBuf::from);

        Ok(Self {
            telegram_bot_token,
            engine,
            store_dir,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    let Some(raw) = env_str(key).and_then(non_empty) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.idle_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.mode, DispatchMode::Pooled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = EngineConfig {
            workers: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn dotenv_parsing_strips_quotes_and_comments() {
        let parsed = parse_dotenv(
            "# comment\nTELEGRAM_BOT_TOKEN=\"abc:def\"\n\nCHATSTATE_WORKERS = 8\nbroken line\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("TELEGRAM_BOT_TOKEN".to_string(), "abc:def".to_string()),
                ("CHATSTATE_WORKERS".to_string(), "8".to_string()),
            ]
        );
    }
}
