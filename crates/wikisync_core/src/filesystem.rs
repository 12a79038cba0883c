use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

pub const CONTENT_FILENAME: &str = "index.md";
pub const MEMO_FILENAME: &str = "memo.md";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to `path` through a sibling temp file and a rename, so a
/// crash never leaves a partially written target behind.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::Filesystem(format!("path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(
        ".{file_name}.{}-{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp_path, bytes)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    if let Err(error) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    write_atomic(path, content.as_bytes())
}

/// True when `path` exists and holds something other than whitespace.
pub fn has_content(path: &Path) -> bool {
    fs::read_to_string(path).is_ok_and(|content| !content.trim().is_empty())
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

/// File names in `dir` that are neither page content nor memo, sorted.
/// Hidden files (including in-flight temp files) are skipped.
pub fn attachment_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == CONTENT_FILENAME || name == MEMO_FILENAME || name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// First `hex_len` hex characters of the sha256 of `value`.
pub fn compute_hash(value: &str, hex_len: usize) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut output = String::with_capacity(hex_len);
    for byte in digest.iter() {
        if output.len() >= hex_len {
            break;
        }
        output.push_str(&format!("{byte:02x}"));
    }
    output.truncate(hex_len);
    output
}

pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn display_path(path: &Path) -> String {
    normalize_separators(&path.to_string_lossy())
}

/// Resolve `.` and `..` in a slash-separated relative path. Returns `None`
/// when the path climbs above its root.
pub fn normalize_relative(path: &str) -> Option<String> {
    let normalized = normalize_separators(path);
    let mut segments: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}
