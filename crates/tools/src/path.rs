//! Path confinement for file tools.
//!
//! Paths from the model are resolved against a workspace root, canonicalized
//! (symlinks and `..` included) and must land inside the root and outside
//! every forbidden prefix.

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("File not found: {path}")]
    NotFound { path: String },

    #[error("Path '{path}' is outside the workspace")]
    OutsideWorkspace { path: String },

    #[error("Path '{path}' matches forbidden pattern '{pattern}'")]
    Forbidden { path: String, pattern: String },

    #[error("Failed to resolve path '{path}': {reason}")]
    Unresolvable { path: String, reason: String },
}

/// Resolve `raw` against `workspace` and check it against the sandbox rules.
///
/// Returns the canonical path on success. The target must exist.
pub fn resolve(
    workspace: &Path,
    raw: &str,
    forbidden_paths: &[String],
) -> Result<PathBuf, PathError> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace.join(candidate)
    };

    let canonical = joined.canonicalize().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PathError::NotFound { path: raw.into() },
        _ => PathError::Unresolvable {
            path: raw.into(),
            reason: e.to_string(),
        },
    })?;

    for pattern in forbidden_paths {
        let prefix = expand_tilde(pattern);
        // Canonicalize when possible so symlinked homes compare equal
        let prefix = prefix.canonicalize().unwrap_or(prefix);
        if canonical.starts_with(&prefix) {
            return Err(PathError::Forbidden {
                path: raw.into(),
                pattern: pattern.clone(),
            });
        }
    }

    let root = workspace
        .canonicalize()
        .map_err(|e| PathError::Unresolvable {
            path: workspace.display().to_string(),
            reason: e.to_string(),
        })?;
    if !canonical.starts_with(&root) {
        return Err(PathError::OutsideWorkspace { path: raw.into() });
    }

    Ok(canonical)
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match (path, home) {
        ("~", Some(home)) => PathBuf::from(home),
        (p, Some(home)) if p.starts_with("~/") => PathBuf::from(home).join(&p[2..]),
        (p, _) => PathBuf::from(p),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();

        let resolved = resolve(dir.path(), "src/main.rs", &[]).unwrap();
        assert!(resolved.ends_with("src/main.rs"));
    }

    #[test]
    fn dot_dot_escape_rejected() {
        let outer = tempfile::tempdir().unwrap();
        let workspace = outer.path().join("ws");
        std::fs::create_dir(&workspace).unwrap();
        std::fs::write(outer.path().join("secret.txt"), "x").unwrap();

        let err = resolve(&workspace, "../secret.txt", &[]).unwrap_err();
        assert!(matches!(err, PathError::OutsideWorkspace { .. }));
    }

    #[test]
    fn dot_dot_that_stays_inside_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();
        assert!(resolve(dir.path(), "a/../b.txt", &[]).is_ok());
    }

    #[test]
    fn absolute_path_outside_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::NamedTempFile::new().unwrap();
        let raw = other.path().to_string_lossy().to_string();
        let err = resolve(dir.path(), &raw, &[]).unwrap_err();
        assert!(matches!(err, PathError::OutsideWorkspace { .. }));
    }

    #[test]
    fn forbidden_prefix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".secrets")).unwrap();
        std::fs::write(dir.path().join(".secrets/key"), "k").unwrap();

        let forbidden = vec![dir.path().join(".secrets").to_string_lossy().to_string()];
        let err = resolve(dir.path(), ".secrets/key", &forbidden).unwrap_err();
        assert!(matches!(err, PathError::Forbidden { .. }));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "nope.txt", &[]).unwrap_err();
        assert!(matches!(err, PathError::NotFound { .. }));
        assert_eq!(err.to_string(), "File not found: nope.txt");
    }

    #[test]
    fn tilde_expansion() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_tilde("~/.ssh"), PathBuf::from(home).join(".ssh"));
        }
        assert_eq!(expand_tilde("/etc"), PathBuf::from("/etc"));
    }
}
