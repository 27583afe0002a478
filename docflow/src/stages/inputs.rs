//! Picking which source files a reader handles.

use std::path::{Path, PathBuf};

fn is_lock_file(name: &str) -> bool {
    name.starts_with('~') || name.ends_with('~')
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Returns the files of `dir` a reader should handle, sorted by name.
///
/// With an explicit list only those files are considered; relative names
/// resolve against `dir`. Otherwise every file in `dir` with one of
/// `extensions` is taken. Editor lock files (`~` prefix or suffix) are
/// always skipped. A missing directory yields an empty list.
pub async fn select_sources(
    dir: &Path,
    explicit: Option<&[String]>,
    extensions: &[&str],
) -> std::io::Result<Vec<PathBuf>> {
    let mut selected = Vec::new();

    if let Some(files) = explicit {
        for file in files {
            let path = Path::new(file);
            let path = if path.is_absolute() {
                path.to_path_buf()
            } else {
                dir.join(path)
            };
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            if !is_lock_file(&name) && has_extension(&path, extensions) {
                selected.push(path);
            }
        }
    } else {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(selected),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_lock_file(&name) && has_extension(&path, extensions) {
                selected.push(path);
            }
        }
    }

    selected.sort();
    selected.dedup();
    Ok(selected)
}
