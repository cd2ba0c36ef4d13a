//! Recursive source file discovery

use glob::Pattern;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Invalid discovery pattern
#[derive(Debug, thiserror::Error)]
#[error("Invalid file pattern '{pattern}': {message}")]
pub struct PatternError {
    pub pattern: String,
    pub message: String,
}

/// File name filter: one include glob minus any exclusion globs
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Pattern,
    exclude: Vec<Pattern>,
}

fn compile(pattern: &str) -> Result<Pattern, PatternError> {
    Pattern::new(pattern).map_err(|e| PatternError {
        pattern: pattern.to_string(),
        message: e.msg.to_string(),
    })
}

impl FileFilter {
    pub fn new(include: &str) -> Result<Self, PatternError> {
        Ok(Self {
            include: compile(include)?,
            exclude: Vec::new(),
        })
    }

    pub fn excluding<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self, PatternError> {
        for pattern in patterns {
            self.exclude.push(compile(pattern.as_ref())?);
        }
        Ok(self)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.include.matches(file_name) && !self.exclude.iter().any(|p| p.matches(file_name))
    }
}

/// Walk `root` and return every regular file whose name passes `filter`,
/// sorted by path. Unreadable entries are logged and skipped.
pub fn discover(root: &Path, filter: &FileFilter) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| filter.matches(name))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();

    files.sort();
    debug!(root = %root.display(), count = files.len(), "Discovered files");
    files
}

/// Immediate subdirectories of `root`, sorted by name
pub fn subdirectories(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}
