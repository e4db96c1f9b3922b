use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::registry::ItemRegistry;

/// Identity of one input item, normally the canonical path of an audio file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(PathBuf);

impl ItemId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ItemId {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for ItemId {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&Path> for ItemId {
    fn from(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

impl From<&str> for ItemId {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}

impl From<String> for ItemId {
    fn from(path: String) -> Self {
        Self(PathBuf::from(path))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Where the inference routine should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Gpu => "gpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "gpu" => Ok(Device::Gpu),
            other => Err(UnknownVariant {
                kind: "device",
                value: other.to_string(),
            }),
        }
    }
}

/// Separation model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelVariant {
    /// 4 stems, single model
    #[default]
    Standard,
    /// 4 stems, bag of fine-tuned models
    FineTuned,
    /// 6 stems
    SixStem,
}

impl ModelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Standard => "standard",
            ModelVariant::FineTuned => "fine-tuned",
            ModelVariant::SixStem => "six-stem",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ModelVariant::Standard),
            "fine-tuned" => Ok(ModelVariant::FineTuned),
            "six-stem" => Ok(ModelVariant::SixStem),
            other => Err(UnknownVariant {
                kind: "model",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidOptions {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("{name} overlap must be in [0, 1), got {value}")]
    Overlap { name: &'static str, value: f32 },
}

/// Resolved option values for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub output_dir: PathBuf,
    pub device: Device,
    pub chunk_size: usize,
    pub overlap_large: f32,
    pub overlap_small: f32,
    pub model: ModelVariant,
    pub vocals_only: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./separated"),
            device: Device::Auto,
            chunk_size: 1_000_000,
            overlap_large: 0.6,
            overlap_small: 0.5,
            model: ModelVariant::Standard,
            vocals_only: false,
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        if self.chunk_size == 0 {
            return Err(InvalidOptions::ZeroChunkSize);
        }
        for (name, value) in [("large", self.overlap_large), ("small", self.overlap_small)] {
            if !(0.0..1.0).contains(&value) {
                return Err(InvalidOptions::Overlap { name, value });
            }
        }
        Ok(())
    }
}

/// Immutable snapshot of one run: the enabled items and the options they
/// are processed with.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    items: Vec<ItemId>,
    options: JobOptions,
}

impl JobSpec {
    pub fn new(items: Vec<ItemId>, options: JobOptions) -> Self {
        Self { items, options }
    }

    /// Snapshot the currently enabled items of `registry`.
    pub fn from_registry(registry: &ItemRegistry, options: JobOptions) -> Self {
        Self::new(registry.enabled_identities(), options)
    }

    pub fn items(&self) -> &[ItemId] {
        &self.items
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
