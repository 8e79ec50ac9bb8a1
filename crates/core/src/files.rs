//! Filesystem helpers for staging inputs and harvesting outputs.
//!
//! Directory walks run on the blocking pool; single-file operations use
//! `tokio::fs` directly.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// Recursively find every file named `name` under `root`.
///
/// Entries are visited in name order, files of a directory before its
/// subdirectories, so the result order is stable across runs. Symlinked
/// directories are followed, each real directory at most once. A missing
/// `root` yields an empty list.
pub async fn find_files_named(root: &Path, name: &str) -> io::Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || {
        let mut found = Vec::new();
        if root.is_dir() {
            walk(&root, &name, &mut found, &mut HashSet::new())?;
        }
        Ok(found)
    })
    .await
    .map_err(io::Error::other)?
}

fn walk(
    dir: &Path,
    name: &str,
    found: &mut Vec<PathBuf>,
    visited: &mut HashSet<PathBuf>,
) -> io::Result<()> {
    // Breaks symlink cycles.
    if !visited.insert(dir.canonicalize()?) {
        return Ok(());
    }
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    entries.sort();

    let (dirs, files): (Vec<_>, Vec<_>) = entries.into_iter().partition(|p| p.is_dir());
    found.extend(
        files
            .into_iter()
            .filter(|p| p.file_name().is_some_and(|f| f == name)),
    );
    for sub in dirs {
        walk(&sub, name, found, visited)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Directory maintenance
// ---------------------------------------------------------------------------

/// Remove everything inside `dir`, creating it if it does not exist.
pub async fn clear_directory(dir: &Path) -> io::Result<()> {
    if !tokio::fs::try_exists(dir).await? {
        return tokio::fs::create_dir_all(dir).await;
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

/// Delete files directly inside `dir` whose names start with `prefix` and
/// end with `suffix`. Returns the number of files removed.
pub async fn remove_matching(dir: &Path, prefix: &str, suffix: &str) -> io::Result<usize> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(0);
    }
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(prefix)
            && file_name.ends_with(suffix)
            && entry.file_type().await?.is_file()
        {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Copy / move
// ---------------------------------------------------------------------------

/// Copy `src` into `dest_dir`, keeping its file name.
///
/// With `overwrite` an existing file of the same name is replaced;
/// otherwise a numeric suffix is appended. Returns the destination path.
pub async fn copy_into(src: &Path, dest_dir: &Path, overwrite: bool) -> io::Result<PathBuf> {
    let dest = destination_for(src, dest_dir, overwrite).await?;
    tokio::fs::copy(src, &dest).await?;
    Ok(dest)
}

/// Move `src` into `dest_dir` without overwriting anything there.
///
/// Falls back to copy + delete when a plain rename is not possible
/// (e.g. across filesystems). Returns the destination path.
pub async fn move_into(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let dest = destination_for(src, dest_dir, false).await?;
    if tokio::fs::rename(src, &dest).await.is_err() {
        tokio::fs::copy(src, &dest).await?;
        tokio::fs::remove_file(src).await?;
    }
    Ok(dest)
}

async fn destination_for(src: &Path, dest_dir: &Path, overwrite: bool) -> io::Result<PathBuf> {
    let file_name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{}' has no file name", src.display()),
        )
    })?;
    tokio::fs::create_dir_all(dest_dir).await?;

    let dest = dest_dir.join(file_name);
    if overwrite || !tokio::fs::try_exists(&dest).await? {
        return Ok(dest);
    }

    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = src
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let mut index = 1u32;
    loop {
        let candidate = dest_dir.join(format!("{stem}_{index}{ext}"));
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        index += 1;
    }
}
