use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::pipeline::{DEFAULT_PAGE_HEIGHT, DEFAULT_PAGE_WIDTH};

pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {detail}")]
    Invalid { detail: String },
}

/// Order in which pages are rasterized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RenderOrder {
    /// Every page, front to back
    #[default]
    Sequential,
    /// Only pages explicitly requested, first request first served
    OnDemand,
}

/// Where the input stream is materialized before opening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StagingMode {
    /// Named temp file, removed when the run ends
    #[default]
    TempFile,
    /// Growable in-memory buffer
    Memory,
}

/// What a single page failure does to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageFailurePolicy {
    /// Leave the page absent, report it, keep going
    #[default]
    Continue,
    /// Fail the whole run on the first page failure
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_page_width")]
    pub target_page_width: u32,

    #[serde(default = "default_page_height")]
    pub target_page_height: u32,

    #[serde(default)]
    pub render_order: RenderOrder,

    #[serde(default = "default_concurrency")]
    pub max_concurrent_renders: usize,

    #[serde(default)]
    pub staging: StagingMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    /// Decoded pages kept in memory; the rest are spilled to PNG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_resident_pages: Option<usize>,

    #[serde(default)]
    pub page_failure: PageFailurePolicy,

    /// RGBA fill for canvas area not covered by the page
    #[serde(default = "default_background")]
    pub page_background: [u8; 4],
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_page_width() -> u32 {
    DEFAULT_PAGE_WIDTH
}

fn default_page_height() -> u32 {
    DEFAULT_PAGE_HEIGHT
}

fn default_concurrency() -> usize {
    1
}

fn default_background() -> [u8; 4] {
    [0xFF, 0xFF, 0xFF, 0xFF]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            target_page_width: default_page_width(),
            target_page_height: default_page_height(),
            render_order: RenderOrder::default(),
            max_concurrent_renders: default_concurrency(),
            staging: StagingMode::default(),
            staging_dir: None,
            max_resident_pages: None,
            page_failure: PageFailurePolicy::default(),
            page_background: default_background(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(content)?;
        if config.version < CURRENT_VERSION {
            migrate_config(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!("Loaded pipeline config from {path:?}");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Saved pipeline config to {path:?}");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_page_width == 0 || self.target_page_height == 0 {
            return Err(ConfigError::Invalid {
                detail: format!(
                    "target page size must be non-zero, got {}x{}",
                    self.target_page_width, self.target_page_height
                ),
            });
        }
        if self.max_concurrent_renders == 0 {
            return Err(ConfigError::Invalid {
                detail: "max_concurrent_renders must be at least 1".to_string(),
            });
        }
        if self.max_resident_pages == Some(0) {
            return Err(ConfigError::Invalid {
                detail: "max_resident_pages must be at least 1 when set".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_target_size(mut self, width: u32, height: u32) -> Self {
        self.target_page_width = width;
        self.target_page_height = height;
        self
    }

    #[must_use]
    pub fn with_render_order(mut self, order: RenderOrder) -> Self {
        self.render_order = order;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_renders(mut self, jobs: usize) -> Self {
        self.max_concurrent_renders = jobs;
        self
    }

    #[must_use]
    pub fn with_staging(mut self, staging: StagingMode) -> Self {
        self.staging = staging;
        self
    }

    #[must_use]
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_max_resident_pages(mut self, pages: usize) -> Self {
        self.max_resident_pages = Some(pages);
        self
    }

    #[must_use]
    pub fn with_page_failure(mut self, policy: PageFailurePolicy) -> Self {
        self.page_failure = policy;
        self
    }

    #[must_use]
    pub fn with_page_background(mut self, rgba: [u8; 4]) -> Self {
        self.page_background = rgba;
        self
    }
}

fn migrate_config(config: &mut PipelineConfig) {
    info!(
        "Migrating pipeline config from v{} to v{}",
        config.version, CURRENT_VERSION
    );

    config.version = CURRENT_VERSION;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_reference_canvas() {
        let config = PipelineConfig::default();
        assert_eq!(config.target_page_width, 1240);
        assert_eq!(config.target_page_height, 1754);
        assert_eq!(config.render_order, RenderOrder::Sequential);
        assert_eq!(config.max_concurrent_renders, 1);
        assert_eq!(config.page_failure, PageFailurePolicy::Continue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "target_page_width: 600\nrender_order: on_demand\nmax_resident_pages: 4\n",
        )
        .unwrap();

        assert_eq!(config.target_page_width, 600);
        assert_eq!(config.target_page_height, 1754);
        assert_eq!(config.render_order, RenderOrder::OnDemand);
        assert_eq!(config.max_resident_pages, Some(4));
        assert_eq!(config.staging, StagingMode::TempFile);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = PipelineConfig::from_yaml_str("max_concurrent_renders: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = PipelineConfig::from_yaml_str("target_page_height: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = PipelineConfig::from_yaml_str("render_order: sideways\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("pageflow.yaml");
        let config = PipelineConfig::default()
            .with_target_size(320, 480)
            .with_max_concurrent_renders(3)
            .with_page_failure(PageFailurePolicy::Abort);

        config.save(&path).unwrap();
        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn old_versions_are_migrated() {
        let config = PipelineConfig::from_yaml_str("version: 0\n").unwrap();
        assert_eq!(config.version, CURRENT_VERSION);
    }
}
