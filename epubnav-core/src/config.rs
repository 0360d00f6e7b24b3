use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::locations::DEFAULT_CHUNK_SIZE;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub locations: LocationsConfig,
    pub search: SearchConfig,
    pub navigation: NavigationConfig,
    pub display: DisplayConfig,
    pub panels: Vec<PanelConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationsConfig {
    /// Characters per location.
    pub chunk_size: usize,
}

impl Default for LocationsConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Sections searched at once. Unset searches every section concurrently.
    pub concurrency: Option<usize>,
    pub excerpt_window: usize,
    pub result_limit: usize,
    pub panel_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            excerpt_window: 150,
            result_limit: 200,
            panel_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Fraction of the viewport a drag has to travel to turn the page.
    pub swipe_threshold: f32,
    /// Width in pixels of the strip along the right edge that opens the
    /// side panel.
    pub panel_margin: u32,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            swipe_threshold: 0.25,
            panel_margin: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    None,
    Location,
    #[default]
    Percentage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub progress: ProgressMode,
}

/// A search panel: a named, fixed query run against the open document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConfig {
    pub id: String,
    pub query: String,
}

impl ReaderConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {:?}", path))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn panel(&self, id: &str) -> Option<&PanelConfig> {
        self.panels.iter().find(|panel| panel.id == id)
    }
}
