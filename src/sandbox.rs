//! Workspace path containment.
//!
//! Every resource and tool handler that touches the filesystem resolves
//! client-supplied relative paths through [`resolve`] instead of joining
//! them directly — symlinks are followed, but the final target must stay
//! inside the workspace root.

use crate::errors::FlyError;
use std::path::{Path, PathBuf};

/// Resolve `relative_path` against `root`, rejecting anything that escapes
/// `root` once symlinks are followed.
///
/// `relative_path` need not exist on disk yet (write targets don't). In that
/// case the deepest existing ancestor is canonicalized and the remaining,
/// not-yet-created components are appended back on — still denying escapes
/// introduced by `..` segments or a symlinked ancestor.
pub fn resolve(root: &Path, relative_path: &str) -> Result<PathBuf, FlyError> {
    if relative_path.contains('\0') {
        return Err(FlyError::PermissionDenied(format!(
            "invalid path: {relative_path}"
        )));
    }

    let root_canonical = root
        .canonicalize()
        .map_err(|e| FlyError::Internal(format!("cannot resolve workspace root: {e}")))?;

    let candidate = root.join(relative_path);
    let (existing_ancestor, remainder) = deepest_existing_ancestor(&candidate);

    let ancestor_canonical = existing_ancestor.canonicalize().map_err(|e| {
        FlyError::PermissionDenied(format!("cannot resolve path {relative_path}: {e}"))
    })?;

    if !ancestor_canonical.starts_with(&root_canonical) {
        return Err(FlyError::PermissionDenied(format!(
            "path escapes workspace: {relative_path}"
        )));
    }

    let resolved = remainder
        .into_iter()
        .fold(ancestor_canonical, |acc, component| acc.join(component));

    if !resolved.starts_with(&root_canonical) {
        return Err(FlyError::PermissionDenied(format!(
            "path escapes workspace: {relative_path}"
        )));
    }

    Ok(resolved)
}

/// Check an already-resolved absolute path stays within `root` — used when a
/// path comes from somewhere other than [`resolve`] (e.g. a directory walk)
/// but still needs to be asserted before use.
pub fn contains(root: &Path, candidate: &Path) -> Result<(), FlyError> {
    let root_canonical = root
        .canonicalize()
        .map_err(|e| FlyError::Internal(format!("cannot resolve workspace root: {e}")))?;
    let candidate_canonical = candidate
        .canonicalize()
        .map_err(|e| FlyError::PermissionDenied(format!("cannot resolve path: {e}")))?;
    if !candidate_canonical.starts_with(&root_canonical) {
        return Err(FlyError::PermissionDenied(format!(
            "path escapes workspace: {}",
            candidate.display()
        )));
    }
    Ok(())
}

fn deepest_existing_ancestor(path: &Path) -> (PathBuf, Vec<std::ffi::OsString>) {
    let mut remainder = Vec::new();
    let mut current = path.to_path_buf();

    while !current.exists() {
        match current.file_name() {
            Some(name) => {
                remainder.push(name.to_os_string());
                current = match current.parent() {
                    Some(p) => p.to_path_buf(),
                    None => break,
                };
            }
            None => break,
        }
    }

    remainder.reverse();
    (current, remainder)
}
