//! Settings loaded from TOML, with live reload

use crate::error::{EngineError, EngineResult};
use crate::proxy::models::Protocol;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub checker: CheckerSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub auto_remove: AutoRemoveSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub coalescer: CoalescerSettings,
    #[serde(default)]
    pub leadership: LeadershipSettings,
    #[serde(default)]
    pub maintenance: MaintenanceSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub default_judges: Vec<JudgeConfig>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://proxies.db?mode=rwc".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CheckerSettings {
    pub interval_days: u64,
    pub interval_hours: u64,
    pub interval_minutes: u64,
    pub interval_seconds: u64,
    pub retries: u32,
    pub timeout_ms: u64,
    /// Protocols checked at all; users' protocol lists are filtered by this
    pub protocols: Vec<Protocol>,
    /// This host's public address, used to spot transparent proxies
    pub local_ip: Option<String>,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            interval_days: 0,
            interval_hours: 0,
            interval_minutes: 5,
            interval_seconds: 0,
            retries: 2,
            timeout_ms: 7_500,
            protocols: Protocol::ALL.to_vec(),
            local_ip: None,
        }
    }
}

impl CheckerSettings {
    /// Total check interval, at least one second
    pub fn interval(&self) -> Duration {
        let secs = self
            .interval_days
            .saturating_mul(86_400)
            .saturating_add(self.interval_hours.saturating_mul(3_600))
            .saturating_add(self.interval_minutes.saturating_mul(60))
            .saturating_add(self.interval_seconds);
        Duration::from_secs(secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Derive the worker count from queue depth instead of `threads`
    pub dynamic: bool,
    pub threads: usize,
    pub min_threads: usize,
    pub max_threads: usize,
    /// Period of the convergence tick (one worker stopped per tick)
    pub adjust_tick_ms: u64,
    /// How often the target is recomputed when settings do not change
    pub refresh_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            dynamic: true,
            threads: 50,
            min_threads: 1,
            max_threads: 2_000,
            adjust_tick_ms: 1_000,
            refresh_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AutoRemoveSettings {
    /// Master switch; a user's own flag must also be set
    pub enabled: bool,
    /// Threshold given to newly created users
    pub threshold: u32,
}

impl Default for AutoRemoveSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    pub poll_interval_ms: u64,
    pub page_size: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_ttl_secs: u64,
    /// How long a claimed item stays shielded from queue repair
    pub claim_ttl_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            page_size: 1_000,
            heartbeat_interval_secs: 5,
            heartbeat_ttl_secs: 15,
            claim_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CoalescerSettings {
    pub flush_interval_ms: u64,
    pub max_batch: usize,
}

impl Default for CoalescerSettings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 25,
            max_batch: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LeadershipSettings {
    pub ttl_secs: u64,
    pub retry_backoff_ms: u64,
}

impl Default for LeadershipSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            retry_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub queue_repair_interval_secs: u64,
    pub statistics_retention_days: u64,
    pub retention_interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            queue_repair_interval_secs: 300,
            statistics_retention_days: 7,
            retention_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct LoggingSettings {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct JudgeConfig {
    pub url: String,
    #[serde(default)]
    pub regex: Option<String>,
}

impl Settings {
    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(data)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that parse but cannot drive a checker.
    pub fn validate(&self) -> EngineResult<()> {
        if self.checker.protocols.is_empty() {
            return Err(EngineError::Config(
                "checker.protocols must list at least one protocol".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml(&data).with_context(|| format!("parsing config {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }
}

/// Polls a config file and publishes new settings when it changes
pub struct SettingsWatcher {
    path: PathBuf,
    poll: Duration,
    last_modified: Option<SystemTime>,
    tx: watch::Sender<Settings>,
}

impl SettingsWatcher {
    /// Load the file once and return the watcher plus a receiver of settings.
    pub fn new(path: PathBuf, poll: Duration) -> anyhow::Result<(Self, watch::Receiver<Settings>)> {
        let settings = Settings::load(Some(&path))?;
        let last_modified = modified(&path);
        let (tx, rx) = watch::channel(settings);
        Ok((
            Self {
                path,
                poll,
                last_modified,
                tx,
            },
            rx,
        ))
    }

    /// Reload if the file changed; returns true when new settings were published.
    pub fn poll_once(&mut self) -> bool {
        let current = modified(&self.path);
        if current.is_none() || current == self.last_modified {
            return false;
        }
        self.last_modified = current;
        match Settings::load(Some(&self.path)) {
            Ok(settings) => {
                let changed = self.tx.send_if_modified(|old| {
                    if *old == settings {
                        false
                    } else {
                        *old = settings;
                        true
                    }
                });
                if changed {
                    info!(path = %self.path.display(), "settings reloaded");
                }
                changed
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring invalid settings");
                false
            }
        }
    }

    pub async fn run(mut self, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => { self.poll_once(); }
            }
        }
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.checker.interval(), Duration::from_secs(300));
        assert_eq!(settings.checker.protocols.len(), 4);
    }

    #[test]
    fn test_interval_components() {
        let settings = Settings::from_toml(
            r#"
[checker]
interval_hours = 1
interval_minutes = 2
interval_seconds = 3
protocols = ["http", "socks5"]

[dispatcher]
dynamic = false
threads = 12

[[default_judges]]
url = "http://judge.example/azenv.php"
regex = "REMOTE_ADDR"
"#,
        )
        .unwrap();
        assert_eq!(settings.checker.interval(), Duration::from_secs(3_723));
        assert_eq!(
            settings.checker.protocols,
            vec![Protocol::Http, Protocol::Socks5]
        );
        assert!(!settings.dispatcher.dynamic);
        assert_eq!(settings.dispatcher.threads, 12);
        assert_eq!(settings.default_judges.len(), 1);
    }

    #[test]
    fn test_empty_protocol_list_is_rejected() {
        let err = Settings::from_toml("[checker]\nprotocols = []\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let checker = CheckerSettings {
            interval_minutes: 0,
            ..CheckerSettings::default()
        };
        assert_eq!(checker.interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_watcher_publishes_changes_and_keeps_last_good() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[checker]\ninterval_seconds = 10\ninterval_minutes = 0").unwrap();
        let (mut watcher, rx) =
            SettingsWatcher::new(file.path().to_path_buf(), Duration::from_millis(10)).unwrap();
        assert_eq!(rx.borrow().checker.interval(), Duration::from_secs(10));

        // force a different mtime regardless of filesystem granularity
        watcher.last_modified = None;
        fs::write(file.path(), "[checker]\ninterval_seconds = 20\ninterval_minutes = 0\n").unwrap();
        assert!(watcher.poll_once());
        assert_eq!(rx.borrow().checker.interval(), Duration::from_secs(20));

        watcher.last_modified = None;
        fs::write(file.path(), "[checker\nbroken").unwrap();
        assert!(!watcher.poll_once());
        assert_eq!(rx.borrow().checker.interval(), Duration::from_secs(20));
    }
}
