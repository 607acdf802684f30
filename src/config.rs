//! Pipeline configuration.
//!
//! Tool names, timeouts and the job storage root. Values are loadable from a
//! TOML file; anything absent falls back to the defaults below. Build and
//! pack steps invoke third-party toolchains with unpredictable build times,
//! so their budget is deliberately long; metadata-generation steps are bound
//! tightly to fail fast on tool misconfiguration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default wall-clock budget for manifest-generating init steps.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default wall-clock budget for image/operator pack steps.
pub const DEFAULT_PACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default wall-clock budget for source fetches (clone, sparse pull).
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Secondary executable search location when PATH resolution fails.
pub const DEFAULT_FALLBACK_BIN_DIR: &str = "/snap/bin";

#[derive(Debug, Clone)]
pub struct ForgeConfig {
    /// Root directory under which per-job workspaces are created.
    pub storage_root: PathBuf,
    /// Checked for executables that are not on PATH.
    pub fallback_bin_dir: PathBuf,
    pub git_tool: String,
    pub rock_tool: String,
    pub charm_tool: String,
    pub fetch_timeout: Duration,
    pub init_timeout: Duration,
    pub pack_timeout: Duration,
    /// Kill a child that produces no output for this long. `None` disables
    /// silence detection; the hard timeout still applies.
    pub idle_timeout: Option<Duration>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            storage_root: cache_root.join("charmforge").join("jobs"),
            fallback_bin_dir: PathBuf::from(DEFAULT_FALLBACK_BIN_DIR),
            git_tool: "git".to_string(),
            rock_tool: "rockcraft".to_string(),
            charm_tool: "charmcraft".to_string(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            pack_timeout: DEFAULT_PACK_TIMEOUT,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ForgeConfigToml {
    storage_root: Option<PathBuf>,
    fallback_bin_dir: Option<PathBuf>,
    git_tool: Option<String>,
    rock_tool: Option<String>,
    charm_tool: Option<String>,
    fetch_timeout_secs: Option<u64>,
    init_timeout_secs: Option<u64>,
    pack_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
}

impl ForgeConfig {
    /// Load configuration from a TOML file, filling gaps with defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let parsed: ForgeConfigToml = toml::from_str(&text)
            .with_context(|| format!("parsing config '{}'", path.display()))?;

        let defaults = ForgeConfig::default();
        Ok(Self {
            storage_root: parsed.storage_root.unwrap_or(defaults.storage_root),
            fallback_bin_dir: parsed.fallback_bin_dir.unwrap_or(defaults.fallback_bin_dir),
            git_tool: parsed.git_tool.unwrap_or(defaults.git_tool),
            rock_tool: parsed.rock_tool.unwrap_or(defaults.rock_tool),
            charm_tool: parsed.charm_tool.unwrap_or(defaults.charm_tool),
            fetch_timeout: parsed
                .fetch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            init_timeout: parsed
                .init_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.init_timeout),
            pack_timeout: parsed
                .pack_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.pack_timeout),
            idle_timeout: parsed.idle_timeout_secs.map(Duration::from_secs),
        })
    }
}
