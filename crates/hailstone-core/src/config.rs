//! Search configuration.
//!
//! Loaded from an optional JSON file, overridden by command-line flags and
//! validated once before any GPU object is created.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::{BindingStyle, ElementLayout};
use crate::{Error, Result};

/// When the search loop stops on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Termination {
    /// Run until interrupted.
    #[default]
    Unbounded,
    /// Stop after retiring `limit` batches.
    Batches { limit: u64 },
    /// Stop once this run finds a record above the one it started with.
    NewRecord,
}

/// Which slot backend executes the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Vulkan compute.
    #[default]
    Vulkan,
    /// Host reference on the CPU.
    Host,
}

/// Search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Fraction of each heap the plan may use.
    #[serde(default = "default_memory_budget")]
    pub memory_budget: f64,

    /// Values per batch.
    #[serde(default = "default_iter_size")]
    pub iter_size: u32,

    /// Output element layout.
    #[serde(default)]
    pub element_layout: ElementLayout,

    /// Buffer binding style.
    #[serde(default)]
    pub binding_style: BindingStyle,

    /// Termination mode.
    #[serde(default)]
    pub termination: Termination,

    /// Ignore any existing checkpoint.
    #[serde(default)]
    pub restart: bool,

    /// Checkpoint file.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,

    /// Retired batches between checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// Seconds between checkpoints regardless of batch count.
    #[serde(default = "default_checkpoint_period_secs")]
    pub checkpoint_period_secs: u64,

    /// Write periodic checkpoints from a background thread.
    #[serde(default = "default_true")]
    pub background_checkpoints: bool,

    /// Persisted pipeline cache blob, if any.
    #[serde(default = "default_pipeline_cache_path")]
    pub pipeline_cache_path: Option<PathBuf>,

    /// Precompiled SPIR-V replacing the built-in kernel.
    #[serde(default)]
    pub shader_path: Option<PathBuf>,

    /// Upper bound on slots regardless of budget.
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,

    /// Preferred workgroup size.
    #[serde(default = "default_workgroup_size")]
    pub workgroup_size: u32,

    /// Leading batches cross-checked against the host reference.
    #[serde(default = "default_validate_batches")]
    pub validate_batches: u64,

    /// Slot backend.
    #[serde(default)]
    pub backend: BackendKind,

    /// Physical device index; the first discrete GPU is used when unset.
    #[serde(default)]
    pub device_index: Option<usize>,

    /// Milliseconds per wait before logging a stall.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
}

fn default_memory_budget() -> f64 {
    0.8
}

fn default_iter_size() -> u32 {
    128
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("hailstone.checkpoint.json")
}

fn default_checkpoint_interval() -> u64 {
    4096
}

fn default_checkpoint_period_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_pipeline_cache_path() -> Option<PathBuf> {
    Some(PathBuf::from("hailstone.pipeline-cache"))
}

fn default_max_slots() -> u32 {
    8
}

fn default_workgroup_size() -> u32 {
    64
}

fn default_validate_batches() -> u64 {
    1
}

fn default_wait_timeout_ms() -> u64 {
    5_000
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            memory_budget: default_memory_budget(),
            iter_size: default_iter_size(),
            element_layout: ElementLayout::default(),
            binding_style: BindingStyle::default(),
            termination: Termination::default(),
            restart: false,
            checkpoint_path: default_checkpoint_path(),
            checkpoint_interval: default_checkpoint_interval(),
            checkpoint_period_secs: default_checkpoint_period_secs(),
            background_checkpoints: true,
            pipeline_cache_path: default_pipeline_cache_path(),
            shader_path: None,
            max_slots: default_max_slots(),
            workgroup_size: default_workgroup_size(),
            validate_batches: default_validate_batches(),
            backend: BackendKind::default(),
            device_index: None,
            wait_timeout_ms: default_wait_timeout_ms(),
        }
    }
}

impl SearchConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::config(format!("failed to open {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Checks values that no plan could satisfy.
    pub fn validate(&self) -> Result<()> {
        if !(self.memory_budget > 0.0 && self.memory_budget <= 1.0) {
            return Err(Error::config(format!(
                "memory_budget must be in (0, 1], got {}",
                self.memory_budget
            )));
        }
        if self.iter_size == 0 {
            return Err(Error::config("iter_size must be at least 1"));
        }
        let per_invocation = self.element_layout.strategy().values_per_invocation();
        if self.iter_size % per_invocation != 0 {
            return Err(Error::config(format!(
                "iter_size {} is not a multiple of {} required by the {:?} layout",
                self.iter_size, per_invocation, self.element_layout
            )));
        }
        if self.max_slots < 2 {
            return Err(Error::config("max_slots must be at least 2"));
        }
        if self.workgroup_size == 0 {
            return Err(Error::config("workgroup_size must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::config("checkpoint_interval must be at least 1"));
        }
        if let Termination::Batches { limit: 0 } = self.termination {
            return Err(Error::config("batch limit must be at least 1"));
        }
        Ok(())
    }

    /// Checkpoint period as a duration.
    pub fn checkpoint_period(&self) -> Duration {
        Duration::from_secs(self.checkpoint_period_secs.max(1))
    }

    /// Per-wait timeout as a duration.
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let config = SearchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.iter_size, 128);
        assert_eq!(config.termination, Termination::Unbounded);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SearchConfig = serde_json::from_str(
            r#"{ "iter_size": 256, "termination": { "mode": "batches", "limit": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.iter_size, 256);
        assert_eq!(config.termination, Termination::Batches { limit: 10 });
        assert!((config.memory_budget - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.backend, BackendKind::Vulkan);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "backend": "host", "termination": {{ "mode": "new_record" }} }}"#
        )
        .unwrap();

        let config = SearchConfig::load(file.path()).unwrap();
        assert_eq!(config.backend, BackendKind::Host);
        assert_eq!(config.termination, Termination::NewRecord);
    }

    #[test]
    fn test_rejects_odd_iter_size_for_compact() {
        let config = SearchConfig {
            iter_size: 127,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let wide = SearchConfig {
            iter_size: 127,
            element_layout: ElementLayout::Wide64,
            ..Default::default()
        };
        assert!(wide.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_budget() {
        for budget in [0.0, -0.5, 1.5, f64::NAN] {
            let config = SearchConfig {
                memory_budget: budget,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "budget {budget} accepted");
        }
    }
}
