//! Persistence of route definitions
//!
//! Only route definitions are stored. Health records are runtime state and
//! start over as UNKNOWN after a restart.

use crate::route::Route;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current on-disk format version
const FILE_VERSION: u32 = 1;

/// Durable storage for route definitions
pub trait RouteStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<Route>>;
    fn save(&self, routes: &[Route]) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RouteFile {
    version: u32,
    routes: Vec<Route>,
}

/// Stores routes as a JSON document, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RouteStore for JsonFileStore {
    fn load(&self) -> anyhow::Result<Vec<Route>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read routes file {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let file: RouteFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse routes file {}", self.path.display()))?;
        if file.version != FILE_VERSION {
            anyhow::bail!(
                "Unsupported routes file version {} in {}",
                file.version,
                self.path.display()
            );
        }

        Ok(file.routes)
    }

    fn save(&self, routes: &[Route]) -> anyhow::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let file = RouteFile {
            version: FILE_VERSION,
            routes: routes.to_vec(),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, &file)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to write routes file {}", self.path.display()))?;

        Ok(())
    }
}
