//! Config directories holding `config.json`

use super::burrow::{BurrowConfig, BURROW_CONFIG_FILE};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// One config directory: global (`~/.config/burrow/`), project (`.burrow/`)
/// or one given on the command line
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("burrow");
        Ok(Self::new(dir))
    }

    pub fn project(root: &Path) -> Self {
        Self::new(root.join(".burrow"))
    }

    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(&cwd))
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(BURROW_CONFIG_FILE)
    }

    /// The parsed file, `None` when there is none. A file that exists but
    /// does not parse is an error naming the file.
    pub fn read(&self) -> Result<Option<BurrowConfig>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}
