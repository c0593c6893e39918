// src/core/filesystem/path.rs

//! Root-confined path resolution. Every user-supplied path is joined to the
//! server's data root and resolved through symlinks; anything that lands
//! outside the root is rejected. No symlink, however nested, allows escape.

use crate::core::errors::{HelmsmanError, Result};
use std::path::{Component, Path, PathBuf};

/// Lexically cleans a path: drops `.` components and applies `..` against
/// the components gathered so far. Used only for the non-existing suffix of
/// a path, where no symlink can hide.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Strips leading separators and drive-relative noise so that joining the
/// result onto the root can never replace the root.
fn strip_rooted(rel: &Path) -> PathBuf {
    rel.components()
        .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir | Component::CurDir))
        .collect()
}

/// Splits `path` at its deepest existing ancestor. The first element
/// returned exists on disk (at worst it is `/`); the second is the
/// not-yet-existing remainder.
fn split_existing(path: &Path) -> (PathBuf, PathBuf) {
    let mut existing = path.to_path_buf();
    let mut remainder = PathBuf::new();
    loop {
        if existing.symlink_metadata().is_ok() {
            return (existing, remainder);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder = Path::new(name).join(remainder);
                existing = parent.to_path_buf();
            }
            _ => return (PathBuf::from("/"), remainder),
        }
    }
}

/// Resolves `rel` against `root`, expanding every symlink on the way, and
/// fails unless the result stays inside `root`. The final component does
/// not need to exist. `root` must already be canonical.
pub fn safe_path(root: &Path, rel: &Path) -> Result<PathBuf> {
    let joined = lexical_clean(&root.join(strip_rooted(rel)));
    let (existing, remainder) = split_existing(&joined);

    let resolved = existing
        .canonicalize()
        .map_err(|_| HelmsmanError::PathResolution {
            path: rel.to_path_buf(),
        })?;
    let full = lexical_clean(&resolved.join(remainder));

    if full == root || full.starts_with(root) {
        Ok(full)
    } else {
        Err(HelmsmanError::PathResolution {
            path: rel.to_path_buf(),
        })
    }
}

/// Like [`safe_path`] but leaves the final component unresolved: the parent
/// directory is fully expanded and containment-checked, while the leaf is
/// appended verbatim. Used by delete and rename so that a symlink is
/// operated on as a link instead of through its target.
pub fn safe_leaf_path(root: &Path, rel: &Path) -> Result<PathBuf> {
    let cleaned = lexical_clean(&strip_rooted(rel));
    let Some(name) = cleaned.file_name() else {
        // The path reduced to the root itself.
        return Err(HelmsmanError::PathResolution {
            path: rel.to_path_buf(),
        });
    };
    let parent = cleaned.parent().unwrap_or_else(|| Path::new(""));
    let resolved_parent = safe_path(root, parent)?;
    Ok(resolved_parent.join(name))
}
