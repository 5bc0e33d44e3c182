//! User configuration
//!
//! Sources, archives and exclusion patterns live in one JSON document,
//! `~/.murphyconfig.json` by default:
//!
//! ```json
//! {
//!   "sources": [{ "name": "Documents", "paths": ["/home/me/Documents"] }],
//!   "archives": [{ "name": "USB", "type": "FilesystemArchive", "path": "/media/usb/Backup" }],
//!   "fileRegExps": ["\\.DS_Store$", "node_modules/"],
//!   "ui": {}
//! }
//! ```
//!
//! `ui` belongs to whatever front end is in use and is carried through
//! untouched.

use crate::archive::Archive;
use crate::error::{MurphyError, Result};
use crate::source::Source;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the configuration inside the home folder
pub const CONFIG_FILE_NAME: &str = ".murphyconfig.json";

/// Persistent sources, archives and exclusion patterns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Named sets of folders to back up
    pub sources: Vec<Source>,
    /// Known backup destinations
    #[serde(default)]
    pub archives: Vec<Archive>,
    /// Regular expressions; matching file keys are never backed up
    #[serde(default, rename = "fileRegExps")]
    pub exclude_patterns: Vec<String>,
    /// Front-end settings, preserved verbatim
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub ui: serde_json::Value,
}

impl Config {
    /// `$HOME/.murphyconfig.json` (`%USERPROFILE%` on Windows)
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .ok_or_else(|| MurphyError::configuration("cannot determine the home folder"))?;
        Ok(PathBuf::from(home).join(CONFIG_FILE_NAME))
    }

    /// Read the configuration at `path`; a missing file is an empty configuration
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {:?}, starting empty", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Config = serde_json::from_str(&contents).map_err(|e| {
            MurphyError::configuration(format!("{} is not a valid configuration: {}", path.display(), e))
        })?;
        debug!(
            "Loaded {} source(s) and {} archive(s) from {:?}",
            config.sources.len(),
            config.archives.len(),
            path
        );
        Ok(config)
    }

    /// Write the configuration as pretty-printed JSON
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Register a source; names must be unique
    pub fn add_source(&mut self, source: Source) -> Result<()> {
        if self.find_source(source.name()).is_some() {
            return Err(MurphyError::configuration(format!(
                "a source named {:?} already exists",
                source.name()
            )));
        }
        self.sources.push(source);
        Ok(())
    }

    /// Register an archive; names must be unique
    pub fn add_archive(&mut self, archive: Archive) -> Result<()> {
        if self.find_archive(archive.name()).is_some() {
            return Err(MurphyError::configuration(format!(
                "an archive named {:?} already exists",
                archive.name()
            )));
        }
        self.archives.push(archive);
        Ok(())
    }

    /// Source called `name`
    pub fn find_source(&self, name: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.name() == name)
    }

    /// Archive called `name`
    pub fn find_archive(&self, name: &str) -> Option<&Archive> {
        self.archives.iter().find(|a| a.name() == name)
    }

    /// Compiled exclusion patterns
    pub fn file_regexps(&self) -> Result<Vec<Regex>> {
        compile_patterns(&self.exclude_patterns)
    }
}

/// Compile exclusion patterns, naming the first invalid one
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| MurphyError::InvalidPattern(format!("{}: {}", pattern, e)))
        })
        .collect()
}
