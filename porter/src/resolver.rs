//! Specifier resolution primitives (spec.md §4.2).
//!
//! This module holds the filesystem-shaped half of resolution — extension
//! probing, directory-index probing, alias rewriting and the `browser` field
//! override — as free functions over plain paths. `Packet::resolve` (in
//! `packet.rs`) drives the full algorithm (steps 1–7), since bare-specifier
//! resolution needs the Packet forest and lock table that this module has no
//! business knowing about. The split mirrors the teacher's own `Resolve`
//! trait plug-point kept separate from the path algebra in `modules.rs`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const JS_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "json"];
pub const CSS_EXTENSIONS: &[&str] = &["css", "less"];

/// A resolved candidate, plus whether the on-disk path's case differed from
/// the requested one (spec.md §4.2 step 7 — a warning, not a failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found {
    pub path: PathBuf,
    pub case_mismatch: bool,
}

/// Tries `candidate`, then `candidate.<ext>` for each of `exts` in order.
/// First match wins.
pub fn resolve_with_extensions(candidate: &Path, exts: &[&str]) -> Option<Found> {
    if candidate.is_file() {
        return Some(Found {
            path: candidate.to_path_buf(),
            case_mismatch: case_mismatch(candidate),
        });
    }
    for ext in exts {
        let with_ext = append_extension(candidate, ext);
        if with_ext.is_file() {
            return Some(Found {
                path: with_ext.clone(),
                case_mismatch: case_mismatch(&with_ext),
            });
        }
    }
    None
}

/// Tries `<dir>/index.<ext>` for each of `exts` in order (spec.md §4.2 step
/// 6, the directory rule).
pub fn resolve_directory_index(dir: &Path, exts: &[&str]) -> Option<Found> {
    if !dir.is_dir() {
        return None;
    }
    for ext in exts {
        let candidate = dir.join(format!("index.{ext}"));
        if candidate.is_file() {
            return Some(Found {
                path: candidate.clone(),
                case_mismatch: case_mismatch(&candidate),
            });
        }
    }
    None
}

/// Resolves `base_dir.join(specifier)` through the extension rule and, if
/// that candidate is a directory, the directory-index rule.
pub fn resolve_relative(base_dir: &Path, specifier: &str, exts: &[&str]) -> Option<Found> {
    let candidate = normalize(&base_dir.join(specifier));
    if let Some(found) = resolve_with_extensions(&candidate, exts) {
        return Some(found);
    }
    if candidate.is_dir() {
        return resolve_directory_index(&candidate, exts);
    }
    None
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Collapses `.`/`..` components without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Rewrites a bare specifier through the configured alias table (spec.md
/// §6 `resolve.alias`): the first prefix match wins.
pub fn apply_alias(specifier: &str, aliases: &HashMap<String, String>) -> Option<String> {
    aliases.iter().find_map(|(prefix, target)| {
        specifier
            .strip_prefix(prefix.as_str())
            .map(|rest| format!("{target}{rest}"))
    })
}

/// Outcome of applying a Packet's `browser` field override to a resolved
/// subpath, spec.md §4.2 step 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserOverride {
    /// No entry in the `browser` map for this key.
    Unchanged,
    /// Mapped to `false`: the target is disabled (empty placeholder module).
    Disabled,
    /// Mapped to another path: rewrite and re-resolve from there.
    Rewrite(String),
}

pub fn apply_browser_field(key: &str, browser: &HashMap<String, BrowserValue>) -> BrowserOverride {
    match browser.get(key) {
        None => BrowserOverride::Unchanged,
        Some(BrowserValue::Disabled) => BrowserOverride::Disabled,
        Some(BrowserValue::Rewrite(to)) => BrowserOverride::Rewrite(to.clone()),
    }
}

/// A single entry of a manifest's `browser` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserValue {
    Disabled,
    Rewrite(String),
}

/// True if the path as resolved differs in case from what's actually on
/// disk — a warning-only condition on case-insensitive filesystems (spec.md
/// §4.2 step 7). Best-effort: only checks the final path component.
fn case_mismatch(path: &Path) -> bool {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return false;
    };
    let Ok(entries) = fs::read_dir(parent) else {
        return false;
    };
    for entry in entries.flatten() {
        let entry_name = entry.file_name();
        if entry_name.eq_ignore_ascii_case(name) && entry_name != name {
            return true;
        }
    }
    false
}
