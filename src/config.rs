//! Export run configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::symbols::{AutoNamePatterns, DEFAULT_AUTO_NAME_PATTERNS};
use crate::{Address, Bitness};

/// Errors raised while loading a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid auto-name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Knobs for one export run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Use this base address instead of the backend's
    pub base_addr: Option<Address>,
    /// Use this width instead of the backend's
    pub bitness: Option<Bitness>,
    /// Symbol file handed to every debug-symbol provider
    pub symbol_file: Option<PathBuf>,
    /// Regexes matching backend placeholder names
    pub auto_name_patterns: Vec<String>,
    /// Demangle names coming from symbol files
    pub demangle: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            base_addr: None,
            bitness: None,
            symbol_file: None,
            auto_name_patterns: DEFAULT_AUTO_NAME_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            demangle: true,
        }
    }
}

impl ExportConfig {
    /// Load a JSON configuration; missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Compile `auto_name_patterns`
    pub fn auto_names(&self) -> Result<AutoNamePatterns, ConfigError> {
        Ok(AutoNamePatterns::new(&self.auto_name_patterns)?)
    }
}
