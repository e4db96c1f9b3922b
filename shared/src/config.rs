use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{Device, JobOptions, ModelVariant};

const APP_DIR: &str = "stemsplit";
const CONFIG_FILE: &str = "config.yaml";

/// Persisted settings document. Every field is optional; getters fall back
/// to the defaults of [`JobOptions`] and [`InferenceConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub separation: SeparationConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    pub output_dir: Option<PathBuf>,
    pub device: Option<Device>,
    pub chunk_size: Option<usize>,
    pub overlap_large: Option<f32>,
    pub overlap_small: Option<f32>,
    pub model: Option<ModelVariant>,
    pub vocals_only: Option<bool>,
}

/// How to launch the external separation program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub cancel_grace_seconds: Option<u64>,
}

impl SeparationConfig {
    fn merge(&mut self, other: &SeparationConfig) {
        overlay(&mut self.output_dir, &other.output_dir);
        overlay(&mut self.device, &other.device);
        overlay(&mut self.chunk_size, &other.chunk_size);
        overlay(&mut self.overlap_large, &other.overlap_large);
        overlay(&mut self.overlap_small, &other.overlap_small);
        overlay(&mut self.model, &other.model);
        overlay(&mut self.vocals_only, &other.vocals_only);
    }
}

impl InferenceConfig {
    pub fn program(&self) -> String {
        self.program.clone().unwrap_or_else(|| "python".to_string())
    }

    pub fn args(&self) -> Vec<String> {
        self.args
            .clone()
            .unwrap_or_else(|| vec!["inference.py".to_string()])
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds.unwrap_or(5))
    }

    fn merge(&mut self, other: &InferenceConfig) {
        overlay(&mut self.program, &other.program);
        overlay(&mut self.args, &other.args);
        overlay(&mut self.cancel_grace_seconds, &other.cancel_grace_seconds);
    }
}

fn overlay<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if source.is_some() {
        target.clone_from(source);
    }
}

impl Settings {
    /// Default location, `$XDG_CONFIG_HOME/stemsplit/config.yaml` or the
    /// platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// A missing file yields defaults; an unreadable or malformed one is an
    /// error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings in {:?}", path))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::default_path().context("Could not determine config directory")?;
        self.save_to(&path)
    }

    /// Write the settings as YAML. Settings whose job options do not
    /// validate are refused and nothing is written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.job_options()
            .validate()
            .context("Refusing to save invalid settings")?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {:?}", dir))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml).with_context(|| format!("Failed to write settings to {:?}", path))?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Overlay every value set in `other` onto `self`.
    pub fn merge(&mut self, other: &Settings) {
        self.separation.merge(&other.separation);
        self.inference.merge(&other.inference);
    }

    /// Resolve the separation section into concrete job options.
    pub fn job_options(&self) -> JobOptions {
        let defaults = JobOptions::default();
        let s = &self.separation;
        JobOptions {
            output_dir: s.output_dir.clone().unwrap_or(defaults.output_dir),
            device: s.device.unwrap_or(defaults.device),
            chunk_size: s.chunk_size.unwrap_or(defaults.chunk_size),
            overlap_large: s.overlap_large.unwrap_or(defaults.overlap_large),
            overlap_small: s.overlap_small.unwrap_or(defaults.overlap_small),
            model: s.model.unwrap_or(defaults.model),
            vocals_only: s.vocals_only.unwrap_or(defaults.vocals_only),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.job_options(), JobOptions::default());
        assert_eq!(settings.inference.cancel_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn save_then_load_through_nested_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut settings = Settings::default();
        settings.separation.model = Some(ModelVariant::SixStem);
        settings.separation.vocals_only = Some(true);
        settings.inference.program = Some("demucs-runner".into());
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.job_options().model, ModelVariant::SixStem);
        assert_eq!(loaded.inference.program(), "demucs-runner");
    }

    #[test]
    fn partial_document_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "separation:\n  device: cpu\n  chunk_size: 500000\n").unwrap();

        let options = Settings::load_from(&path).unwrap().job_options();
        assert_eq!(options.device, Device::Cpu);
        assert_eq!(options.chunk_size, 500_000);
        assert_eq!(options.overlap_large, 0.6);
        assert!(!options.vocals_only);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "separation: [not, a, map").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn merge_prefers_values_set_on_the_right() {
        let mut base = Settings::default();
        base.separation.device = Some(Device::Gpu);
        base.separation.chunk_size = Some(42);

        let mut overrides = Settings::default();
        overrides.separation.device = Some(Device::Cpu);
        overrides.inference.cancel_grace_seconds = Some(1);

        base.merge(&overrides);
        assert_eq!(base.separation.device, Some(Device::Cpu));
        assert_eq!(base.separation.chunk_size, Some(42));
        assert_eq!(base.inference.cancel_grace_period(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_settings_are_not_saved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut settings = Settings::default();
        settings.separation.overlap_large = Some(1.5);

        let err = settings.save_to(&path).unwrap_err();
        assert!(format!("{err:#}").contains("overlap"), "{err:#}");
        assert!(!path.exists());
    }
}
