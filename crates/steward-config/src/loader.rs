use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use steward_core::{Result, StewardError};

use crate::schema::{StewardConfig, WarningSeverity};

/// Loads and optionally hot-reloads the Steward configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<StewardConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > STEWARD_CONFIG env > ~/.steward/steward.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("STEWARD_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".steward")
            .join("steward.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            StewardConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (no file backing).
    pub fn from_config(config: StewardConfig) -> Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::from("steward.toml"),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> StewardConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<StewardConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse_file(path: &Path) -> Result<StewardConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<StewardConfig>(&raw).map_err(|e| {
            StewardError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate: log warnings, fail on the first error.
    fn check(config: &StewardConfig) -> Result<()> {
        let findings = config.findings();
        let mut errors = findings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error);
        if let Some(first) = errors.next() {
            let more = errors.count();
            let mut reason = first.message.clone();
            if more > 0 {
                reason.push_str(&format!(" (and {more} more)"));
            }
            return Err(StewardError::ConfigValidation {
                field: first.field.clone(),
                reason,
            });
        }
        for w in &findings {
            warn!("{}", w);
        }
        Ok(())
    }

    /// Apply env var overrides (STEWARD_LOG_LEVEL, STEWARD_WORKERS, etc.)
    fn apply_env_overrides(mut config: StewardConfig) -> StewardConfig {
        if let Ok(v) = std::env::var("STEWARD_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("STEWARD_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            config.engine.workers = n;
        }
        if let Ok(v) = std::env::var("STEWARD_LEASE_TTL_SECS")
            && let Ok(n) = v.parse::<u64>()
        {
            config.engine.lease_ttl_secs = n;
        }
        if let Ok(v) = std::env::var("STEWARD_DB_PATH") {
            config.store.path = Some(PathBuf::from(v));
        }
        config
    }

    /// Reload the config from disk. An invalid file leaves the current config in place.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(StewardError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads the config when the file changes.
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let path_for_event = self.config_path.clone();

        info!(config_path = ?self.config_path, "starting config file watcher");

        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "file watcher error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                let is_our_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == path_for_event.file_name());
                if !is_our_file {
                    return;
                }

                info!("config file changed, reloading");
                match ConfigLoader::parse_file(&path_for_event) {
                    Ok(new_config) => {
                        let new_config = ConfigLoader::apply_env_overrides(new_config);
                        if let Err(e) = new_config.validate() {
                            warn!(error = %e, "config file has errors, keeping current config");
                            return;
                        }
                        *config.write() = new_config;
                        info!("configuration hot-reloaded successfully");
                    }
                    Err(e) => {
                        warn!(error = %e, "config file has errors, keeping current config");
                    }
                }
            })
            .map_err(|e| StewardError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| StewardError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
