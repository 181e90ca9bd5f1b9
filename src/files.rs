//! Directory listing and copying helpers shared by the data stages

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Lower-cased extension of `path` with a leading dot, e.g. `.png`
pub fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
}

/// Regular files directly inside `dir` whose extension is in `extensions`,
/// sorted by path. An empty `extensions` slice matches every file.
pub fn list_files(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    collect(WalkDir::new(dir).min_depth(1).max_depth(1), dir, extensions, false)
}

/// Like [`list_files`] but descends into subdirectories, skipping hidden
/// entries such as in-flight `.partial` downloads
pub fn list_files_recursive(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    collect(WalkDir::new(dir).min_depth(1), dir, extensions, true)
}

fn collect(walker: WalkDir, dir: &Path, extensions: &[&str], skip_hidden: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in walker
        .into_iter()
        .filter_entry(|e| !(skip_hidden && is_hidden(e)))
    {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", dir.display()))?;
        if entry.file_type().is_file() && matches_extension(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn matches_extension(path: &Path, extensions: &[&str]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    match dotted_extension(path) {
        Some(ext) => extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)),
        None => false,
    }
}

/// File name of `path` as UTF-8, lossy
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Recursively copy the contents of `src` into `dst` (created if missing)
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to read directory: {}", src.display()))?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create directory: {}", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}
