//! Filesystem helpers: atomic JSON writes, directory scans.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

pub fn ensure_dirs<I, P>(dirs: I) -> Result<()>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    for dir in dirs {
        std::fs::create_dir_all(dir.as_ref())
            .with_context(|| format!("create directory {}", dir.as_ref().display()))?;
    }
    Ok(())
}

/// True when `path` exists, is a regular file, and is non-empty.
pub fn valid_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Serializes `value` as pretty JSON and writes it to `path` atomically:
/// write to `<path>.tmp` in the same directory, fsync, rename over the
/// target, fsync the directory. A crash at any point leaves either the old
/// contents or the new contents, never a torn file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize index")?;
    let tmp = path.with_extension("json.tmp");

    {
        use std::io::Write;
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("fsync {}", tmp.display()))?;
    }

    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;

    // Some filesystems need the directory entry flushed too, or a crash
    // between rename and metadata flush can lose the rename.
    if let Some(dir) = path.parent() {
        if let Ok(d) = std::fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

/// Returns the names of subdirectories directly under `dir`. A missing
/// base directory is treated as empty.
pub fn scan_subdirs(dir: &Path) -> Vec<String> {
    scan_entries(dir, |e| e.path().is_dir())
}

/// Returns file stems of regular files under `dir` with the given
/// extension (without the leading dot), e.g. blob hexes from `<hex>.erofs`.
pub fn scan_file_stems(dir: &Path, ext: &str) -> Vec<String> {
    let mut stems = scan_entries(dir, |e| {
        let p = e.path();
        p.is_file() && p.extension().map(|x| x == ext).unwrap_or(false)
    });
    for s in &mut stems {
        if let Some(stem) = Path::new(&s).file_stem() {
            *s = stem.to_string_lossy().into_owned();
        }
    }
    stems
}

fn scan_entries(dir: &Path, keep: impl Fn(&std::fs::DirEntry) -> bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| keep(e))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Names present on disk but absent from `referenced`, the candidates
/// for collection.
pub fn filter_unreferenced(
    on_disk: &[String],
    referenced: &std::collections::HashSet<String>,
) -> Vec<String> {
    on_disk
        .iter()
        .filter(|name| !referenced.contains(*name))
        .cloned()
        .collect()
}

/// Removes entries under `dir` matching `matches`. Returns per-entry
/// errors without stopping at the first failure.
pub fn remove_matching(
    dir: &Path,
    matches: impl Fn(&std::fs::DirEntry) -> bool,
) -> Vec<anyhow::Error> {
    let mut errs = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return errs;
    };
    for entry in entries.flatten() {
        if !matches(&entry) {
            continue;
        }
        let path: PathBuf = entry.path();
        let res = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = res {
            if e.kind() != std::io::ErrorKind::NotFound {
                errs.push(anyhow::anyhow!("remove {}: {e}", path.display()));
            }
        }
    }
    errs
}
