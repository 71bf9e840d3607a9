//! Site configuration, persisted as TOML (`sitegraph.toml`).
//!
//! Every section is optional; missing sections and fields fall back to their
//! defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Rank calculator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankConfig {
    /// Probability of following a link rather than teleporting.
    pub damping: f64,
    /// Largest per-node change between iterations below which the ranking has converged.
    pub tolerance: f64,
    /// Hard iteration bound.
    pub max_iterations: usize,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            damping: 0.85,
            tolerance: 1e-6,
            max_iterations: 100,
        }
    }
}

/// Community detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityConfig {
    pub max_iterations: usize,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
        }
    }
}

/// Link suggester settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestConfig {
    /// Suggestions kept per node.
    pub top_k: usize,
    /// Weight of the shared-neighbor score; the topical score gets the rest.
    pub neighbor_weight: f64,
    /// Candidates scoring at or below this are dropped.
    pub min_score: f64,
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            neighbor_weight: 0.6,
            min_score: 0.0,
        }
    }
}

/// Path analyzer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Graphs with at most this many nodes get exact centrality.
    pub exact_threshold: usize,
    /// Pivot count for sampled centrality on larger graphs.
    pub pivots: usize,
    /// Seed for pivot selection.
    pub seed: u64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            exact_threshold: 500,
            pivots: 100,
            seed: 42,
        }
    }
}

/// Structural metric thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Minimum in-degree for a page to count as a hub.
    pub hub_threshold: usize,
    /// Maximum total degree for a page to count as a leaf.
    pub leaf_threshold: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            hub_threshold: 10,
            leaf_threshold: 2,
        }
    }
}

/// Build cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of ready entries held in memory.
    pub capacity: usize,
    /// Entries older than this are dropped by `evict_expired`.
    pub max_age_secs: Option<u64>,
    /// Persisted cache directory. Memory-only when absent.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_age_secs: None,
            dir: None,
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// How a build run treats per-artifact failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// The run succeeds only if every artifact succeeds.
    #[default]
    Strict,
    /// Failures are reported but the run still succeeds.
    BestEffort,
    /// The first failure cancels the rest of the run.
    FailFast,
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BuildMode::Strict => "strict",
            BuildMode::BestEffort => "best-effort",
            BuildMode::FailFast => "fail-fast",
        })
    }
}

impl std::str::FromStr for BuildMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "strict" => Ok(BuildMode::Strict),
            "best-effort" => Ok(BuildMode::BestEffort),
            "fail-fast" => Ok(BuildMode::FailFast),
            other => Err(ConfigError::Invalid {
                field: "scheduler.mode".into(),
                message: format!("unknown mode `{other}` (expected strict, best-effort or fail-fast)"),
            }),
        }
    }
}

/// Build scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads. 0 means available parallelism.
    pub workers: usize,
    /// Whole-run deadline.
    pub deadline_secs: Option<u64>,
    pub mode: BuildMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            deadline_secs: None,
            mode: BuildMode::Strict,
        }
    }
}

impl SchedulerConfig {
    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Complete site configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub rank: RankConfig,
    pub community: CommunityConfig,
    pub suggest: SuggestConfig,
    pub paths: PathConfig,
    pub graph: GraphConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl SiteConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: SiteConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Reject values the analyzers cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field: field.into(),
                message: message.into(),
            }
        }

        if !(self.rank.damping > 0.0 && self.rank.damping < 1.0) {
            return Err(invalid("rank.damping", "must be strictly between 0 and 1"));
        }
        if !(self.rank.tolerance > 0.0) {
            return Err(invalid("rank.tolerance", "must be positive"));
        }
        if self.rank.max_iterations == 0 {
            return Err(invalid("rank.max_iterations", "must be at least 1"));
        }
        if self.community.max_iterations == 0 {
            return Err(invalid("community.max_iterations", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.suggest.neighbor_weight) {
            return Err(invalid("suggest.neighbor_weight", "must be within [0, 1]"));
        }
        if self.cache.capacity == 0 {
            return Err(invalid("cache.capacity", "must be at least 1"));
        }
        Ok(())
    }
}
