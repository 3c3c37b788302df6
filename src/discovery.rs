use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::parsers::DatasetFormat;

/// Finds donor/recipient dataset files for batch runs
pub struct DatasetDiscovery {
    recursive: bool,
}

impl DatasetDiscovery {
    pub fn new(recursive: bool) -> Self {
        Self { recursive }
    }

    /// Expand files and directories into a sorted, de-duplicated list of datasets.
    ///
    /// Files named explicitly are kept whatever their extension, so an
    /// unsupported one surfaces as a parse error instead of being skipped.
    pub fn discover(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for path in paths {
            if path.is_file() {
                files.push(path.clone());
            } else if path.is_dir() {
                let mut dir_files = self.discover_in_directory(path)?;
                dir_files.sort();
                files.extend(dir_files);
            } else {
                anyhow::bail!("Input path not found: {}", path.display());
            }
        }

        let mut seen = HashSet::new();
        files.retain(|path| seen.insert(path.clone()));
        debug!("Discovered {} dataset files", files.len());
        Ok(files)
    }

    fn discover_in_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if self.recursive {
            for entry in WalkDir::new(dir)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if path.is_file() && self.is_dataset_file(path) {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            let entries = fs::read_dir(dir)
                .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

            for entry in entries {
                let entry = entry.with_context(|| {
                    format!("Failed to read directory entry in: {}", dir.display())
                })?;
                let path = entry.path();
                if path.is_file() && self.is_dataset_file(&path) {
                    files.push(path);
                }
            }
        }

        Ok(files)
    }

    fn is_dataset_file(&self, path: &Path) -> bool {
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        !hidden && DatasetFormat::from_path(path).is_supported()
    }
}
