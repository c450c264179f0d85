//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/segmerge/segmerge.toml`
//! 3. Explicit config file passed by the caller
//! 4. Environment variables: `SEGMERGE_*` prefix, `__` between section and key
//!
//! Selector fields accept their names (`"median"`, `"propagate-split"`) as
//! well as their legacy numeric codes.

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::application::services::labeling::{Consistency, EvalMode};
use crate::application::services::merge_order::SizeThresholds;
use crate::application::ApplicationError;
use crate::domain::boundary_stat::DEFAULT_RESERVOIR_CAPACITY;
use crate::domain::{Metric, StatKind};

/// Merge-order generation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    /// Boundary statistic (median or mean)
    pub statistic: StatKind,
    /// Samples kept per boundary by the median statistic
    pub reservoir_capacity: usize,
    /// Store only contour points per region
    pub contour_only: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            statistic: StatKind::Median,
            reservoir_capacity: DEFAULT_RESERVOIR_CAPACITY,
            contour_only: true,
        }
    }
}

/// Small-region elimination settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreMergeConfig {
    /// One or two region size thresholds (cells)
    pub size_thresholds: Vec<usize>,
    /// Mean region evidence above which a mid-sized region merges
    pub evidence_threshold: f64,
    /// Renumber labels to 1..k afterwards
    pub relabel: bool,
}

impl Default for PreMergeConfig {
    fn default() -> Self {
        Self {
            size_thresholds: vec![50],
            evidence_threshold: 0.5,
            relabel: false,
        }
    }
}

/// Ground-truth labelling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassifyConfig {
    pub mode: EvalMode,
    pub metric: Metric,
    /// Only used in global mode
    pub consistency: Consistency,
    /// Refine local labels with best known partitions
    pub opt_split: bool,
    /// Let ties go to merge (thick boundaries)
    pub tweak: bool,
    /// Largest precision loss a merge may cause
    pub max_precision_drop: f64,
    /// Jaccard index needed to flag a root cause
    pub min_jaccard: f64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            mode: EvalMode::Local,
            metric: Metric::PairF1,
            consistency: Consistency::PropagateMerge,
            opt_split: false,
            tweak: false,
            max_precision_drop: 1.0,
            min_jaccard: 0.5,
        }
    }
}

impl ClassifyConfig {
    pub fn validate(&self) -> Result<(), ApplicationError> {
        if !(0.0..=1.0).contains(&self.min_jaccard) {
            return Err(ApplicationError::config(format!(
                "classify.min_jaccard must be within [0, 1], got {}",
                self.min_jaccard
            )));
        }
        if self.max_precision_drop.is_nan() || self.max_precision_drop < 0.0 {
            return Err(ApplicationError::config(format!(
                "classify.max_precision_drop must be >= 0, got {}",
                self.max_precision_drop
            )));
        }
        Ok(())
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; rayon's default when unset
    pub threads: Option<usize>,
}

impl RuntimeConfig {
    pub fn thread_pool(&self) -> Result<rayon::ThreadPool, ApplicationError> {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = self.threads {
            builder = builder.num_threads(n);
        }
        builder
            .build()
            .map_err(|e| ApplicationError::OperationFailed {
                context: "build thread pool".to_string(),
                source: Box::new(e),
            })
    }
}

/// Unified configuration for segmerge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub merge: MergeConfig,
    pub pre_merge: PreMergeConfig,
    pub classify: ClassifyConfig,
    pub runtime: RuntimeConfig,
}

/// Selector written either by name or by numeric code.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Selector {
    Code(i64),
    Name(String),
}

impl Selector {
    /// Resolve through `TryFrom<i64>` for codes and serde names otherwise.
    fn resolve<T>(&self, field: &str) -> Result<T, ApplicationError>
    where
        T: TryFrom<i64, Error = String> + DeserializeOwned,
    {
        match self {
            Selector::Code(code) => {
                T::try_from(*code).map_err(|e| ApplicationError::config(format!("{field}: {e}")))
            }
            Selector::Name(name) => toml::Value::String(name.clone())
                .try_into()
                .map_err(|e| ApplicationError::config(format!("{field}: {e}"))),
        }
    }

    fn parse(raw: &str) -> Self {
        raw.trim()
            .parse::<i64>()
            .map(Selector::Code)
            .unwrap_or_else(|_| Selector::Name(raw.trim().to_string()))
    }
}

/// Sparse mirror of [`MergeConfig`] for layering.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawMergeConfig {
    pub statistic: Option<Selector>,
    pub reservoir_capacity: Option<usize>,
    pub contour_only: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawPreMergeConfig {
    pub size_thresholds: Option<Vec<usize>>,
    pub evidence_threshold: Option<f64>,
    pub relabel: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawClassifyConfig {
    pub mode: Option<Selector>,
    pub metric: Option<Selector>,
    pub consistency: Option<Selector>,
    pub opt_split: Option<bool>,
    pub tweak: Option<bool>,
    pub max_precision_drop: Option<f64>,
    pub min_jaccard: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawRuntimeConfig {
    pub threads: Option<usize>,
}

/// Raw settings as read from one TOML layer; unset keys keep the lower layer.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub merge: RawMergeConfig,
    pub pre_merge: RawPreMergeConfig,
    pub classify: RawClassifyConfig,
    pub runtime: RawRuntimeConfig,
}

/// Get the XDG config directory for segmerge.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "segmerge").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("segmerge.toml"))
}

/// Load a TOML file into RawSettings for manual merging.
fn load_raw_settings(path: &Path) -> Result<RawSettings, ApplicationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ApplicationError::Config {
        message: format!("read {}: {}", path.display(), e),
    })?;
    toml::from_str(&content).map_err(|e| ApplicationError::Config {
        message: format!("parse {}: {}", path.display(), e),
    })
}

impl Settings {
    /// Overlay one raw layer; keys it sets win.
    pub fn merge_with(&self, overlay: &RawSettings) -> Result<Self, ApplicationError> {
        let mut out = self.clone();

        let m = &overlay.merge;
        if let Some(s) = &m.statistic {
            out.merge.statistic = s.resolve("merge.statistic")?;
        }
        if let Some(v) = m.reservoir_capacity {
            out.merge.reservoir_capacity = v;
        }
        if let Some(v) = m.contour_only {
            out.merge.contour_only = v;
        }

        let p = &overlay.pre_merge;
        if let Some(v) = &p.size_thresholds {
            out.pre_merge.size_thresholds = v.clone();
        }
        if let Some(v) = p.evidence_threshold {
            out.pre_merge.evidence_threshold = v;
        }
        if let Some(v) = p.relabel {
            out.pre_merge.relabel = v;
        }

        let c = &overlay.classify;
        if let Some(s) = &c.mode {
            out.classify.mode = s.resolve("classify.mode")?;
        }
        if let Some(s) = &c.metric {
            out.classify.metric = s.resolve("classify.metric")?;
        }
        if let Some(s) = &c.consistency {
            out.classify.consistency = s.resolve("classify.consistency")?;
        }
        if let Some(v) = c.opt_split {
            out.classify.opt_split = v;
        }
        if let Some(v) = c.tweak {
            out.classify.tweak = v;
        }
        if let Some(v) = c.max_precision_drop {
            out.classify.max_precision_drop = v;
        }
        if let Some(v) = c.min_jaccard {
            out.classify.min_jaccard = v;
        }

        if let Some(v) = overlay.runtime.threads {
            out.runtime.threads = Some(v);
        }
        Ok(out)
    }

    /// Load settings with layered precedence.
    ///
    /// # Arguments
    /// * `config_file` - Optional explicit config file, applied after the global one
    ///
    /// # Precedence (lowest to highest)
    /// 1. Compiled defaults
    /// 2. Global config: `$XDG_CONFIG_HOME/segmerge/segmerge.toml`
    /// 3. `config_file`
    /// 4. Environment variables: `SEGMERGE_*` prefix
    #[instrument(level = "debug")]
    pub fn load(config_file: Option<&Path>) -> Result<Self, ApplicationError> {
        // 1. Start with defaults
        let mut current = Self::default();

        // 2. Global config
        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                debug!("load: global config {}", global_path.display());
                current = current.merge_with(&load_raw_settings(&global_path)?)?;
            }
        }

        // 3. Explicit file must exist
        if let Some(path) = config_file {
            current = current.merge_with(&load_raw_settings(path)?)?;
        }

        // 4. Apply environment variables (explicit override)
        current = Self::apply_env_overrides(current)?;

        current.validate()?;
        Ok(current)
    }

    /// Parse a single TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ApplicationError> {
        let raw: RawSettings = toml::from_str(content).map_err(|e| ApplicationError::Config {
            message: format!("parse config: {e}"),
        })?;
        let settings = Self::default().merge_with(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply SEGMERGE_* environment variables as explicit overrides.
    fn apply_env_overrides(settings: Self) -> Result<Self, ApplicationError> {
        // Use config crate just for env var parsing
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("SEGMERGE")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("pre_merge.size_thresholds")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_err)?;

        let mut raw = RawSettings::default();
        if let Ok(val) = config.get_string("merge.statistic") {
            raw.merge.statistic = Some(Selector::parse(&val));
        }
        if let Ok(val) = config.get_int("merge.reservoir_capacity") {
            raw.merge.reservoir_capacity = Some(to_usize("merge.reservoir_capacity", val)?);
        }
        if let Ok(val) = config.get_bool("merge.contour_only") {
            raw.merge.contour_only = Some(val);
        }
        if let Ok(val) = config.get::<Vec<i64>>("pre_merge.size_thresholds") {
            raw.pre_merge.size_thresholds = Some(
                val.into_iter()
                    .map(|v| to_usize("pre_merge.size_thresholds", v))
                    .collect::<Result<_, _>>()?,
            );
        }
        if let Ok(val) = config.get_float("pre_merge.evidence_threshold") {
            raw.pre_merge.evidence_threshold = Some(val);
        }
        if let Ok(val) = config.get_bool("pre_merge.relabel") {
            raw.pre_merge.relabel = Some(val);
        }
        if let Ok(val) = config.get_string("classify.mode") {
            raw.classify.mode = Some(Selector::parse(&val));
        }
        if let Ok(val) = config.get_string("classify.metric") {
            raw.classify.metric = Some(Selector::parse(&val));
        }
        if let Ok(val) = config.get_string("classify.consistency") {
            raw.classify.consistency = Some(Selector::parse(&val));
        }
        if let Ok(val) = config.get_bool("classify.opt_split") {
            raw.classify.opt_split = Some(val);
        }
        if let Ok(val) = config.get_bool("classify.tweak") {
            raw.classify.tweak = Some(val);
        }
        if let Ok(val) = config.get_float("classify.max_precision_drop") {
            raw.classify.max_precision_drop = Some(val);
        }
        if let Ok(val) = config.get_float("classify.min_jaccard") {
            raw.classify.min_jaccard = Some(val);
        }
        if let Ok(val) = config.get_int("runtime.threads") {
            raw.runtime.threads = Some(to_usize("runtime.threads", val)?);
        }

        settings.merge_with(&raw)
    }

    /// Reject malformed values before any computation starts.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        SizeThresholds::try_from(self.pre_merge.size_thresholds.as_slice())?;
        if self.merge.reservoir_capacity == 0 {
            return Err(ApplicationError::config("merge.reservoir_capacity must be > 0"));
        }
        if self.runtime.threads == Some(0) {
            return Err(ApplicationError::config("runtime.threads must be > 0"));
        }
        self.classify.validate()
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ApplicationError> {
        toml::to_string_pretty(self).map_err(|e| ApplicationError::Config {
            message: format!("serialize config: {e}"),
        })
    }

    /// Generate a template config file.
    pub fn template() -> String {
        r#"# segmerge configuration
#
# Locations (by precedence, lowest to highest):
#   Global: ~/.config/segmerge/segmerge.toml
#   File:   explicit path given by the caller
#   Env:    SEGMERGE_<SECTION>__<KEY> environment variables
#           e.g. SEGMERGE_CLASSIFY__MODE=global

[merge]
# Boundary statistic: "median" (1) or "mean" (2)
# statistic = "median"
# Samples kept per boundary by the median statistic
# reservoir_capacity = 256
# Keep only contour points per region
# contour_only = true

[pre_merge]
# One or two region size thresholds
# size_thresholds = [50, 200]
# Mid-sized regions merge when their mean evidence exceeds this
# evidence_threshold = 0.5
# Renumber labels to 1..k
# relabel = false

[classify]
# "local" (0) or "global" (1)
# mode = "local"
# "pair-f1" (1) or "rand-index" (2)
# metric = "pair-f1"
# Global mode only: "none" (0), "propagate-merge" (1), "propagate-split" (2)
# consistency = "propagate-merge"
# opt_split = false
# tweak = false
# max_precision_drop = 1.0
# min_jaccard = 0.5

[runtime]
# threads = 8
"#
        .to_string()
    }
}

fn to_usize(field: &str, value: i64) -> Result<usize, ApplicationError> {
    usize::try_from(value)
        .map_err(|_| ApplicationError::config(format!("{field} must be >= 0, got {value}")))
}

fn config_err(e: ConfigError) -> ApplicationError {
    ApplicationError::Config {
        message: e.to_string(),
    }
}
