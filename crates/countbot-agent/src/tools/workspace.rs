//! Workspace path resolution shared by the file tools.

use std::path::{Path, PathBuf};

/// Resolve `path` against the workspace root. When `restrict` is set, the
/// canonicalized result must stay inside the workspace.
///
/// Relative paths are joined onto the workspace root; absolute paths are
/// taken as-is (and then subject to the restriction check).
pub fn resolve_path(workspace: &Path, path: &str, restrict: bool) -> Result<PathBuf, String> {
    let candidate = {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            workspace.join(p)
        }
    };

    if !restrict {
        return Ok(candidate);
    }

    // Canonicalize the deepest existing ancestor so `..` escapes are caught
    // even for files that don't exist yet.
    let check = deepest_existing(&candidate);
    let canonical = check
        .canonicalize()
        .map_err(|e| format!("invalid path '{path}': {e}"))?;
    let workspace_canonical = workspace
        .canonicalize()
        .map_err(|e| format!("invalid workspace: {e}"))?;

    if canonical.starts_with(&workspace_canonical) {
        Ok(candidate)
    } else {
        Err(format!("path '{path}' is outside the workspace"))
    }
}

fn deepest_existing(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    current
}
