use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathPolicyError {
    #[error("path is empty")]
    Empty,
    #[error("path contains an unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("path is outside the repository root: {0}")]
    OutsideRoot(String),
}

/// Maps a canonical repository-relative path ("Docs/A.txt") to an absolute
/// path under `root`. Parent components and prefixes are rejected.
pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathPolicyError> {
    if relative.is_empty() {
        return Ok(root.to_path_buf());
    }

    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathPolicyError::UnsupportedComponent(relative.to_string()));
            }
        }
    }
    Ok(out)
}

/// Maps an absolute local path back to the canonical forward-slash form.
/// Paths outside `root` are a policy violation.
pub fn relative_from_local(root: &Path, absolute: &Path) -> Result<String, PathPolicyError> {
    let relative = absolute
        .strip_prefix(root)
        .map_err(|_| PathPolicyError::OutsideRoot(absolute.display().to_string()))?;

    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str(&part.to_string_lossy());
            }
            Component::CurDir => continue,
            _ => {
                return Err(PathPolicyError::UnsupportedComponent(
                    absolute.display().to_string(),
                ));
            }
        }
    }
    if out.is_empty() {
        return Err(PathPolicyError::Empty);
    }
    Ok(out)
}

/// Parent of a canonical path; the repository root is the empty string.
/// Returns `None` for the root itself.
pub fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(""))
}

pub fn file_name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// True when `path` is `prefix` itself or lies beneath it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_relative_under_root() {
        let root = PathBuf::from("/sync");
        assert_eq!(
            local_path_for(&root, "Docs/A.txt").unwrap(),
            PathBuf::from("/sync/Docs/A.txt")
        );
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathPolicyError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn empty_relative_is_the_root() {
        let root = PathBuf::from("/sync");
        assert_eq!(local_path_for(&root, "").unwrap(), root);
    }

    #[test]
    fn relative_from_local_uses_forward_slashes() {
        let root = PathBuf::from("/sync");
        let abs = PathBuf::from("/sync/Docs/A.txt");
        assert_eq!(relative_from_local(&root, &abs).unwrap(), "Docs/A.txt");
    }

    #[test]
    fn relative_from_local_rejects_outside_root() {
        let root = PathBuf::from("/sync");
        let abs = PathBuf::from("/elsewhere/A.txt");
        assert!(matches!(
            relative_from_local(&root, &abs),
            Err(PathPolicyError::OutsideRoot(_))
        ));
    }

    #[test]
    fn parent_of_top_level_is_empty() {
        assert_eq!(parent_of("a.txt"), Some(""));
        assert_eq!(parent_of("Docs/a.txt"), Some("Docs"));
        assert_eq!(parent_of(""), None);
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(file_name_of("Docs/a.txt"), "a.txt");
        assert_eq!(file_name_of("a.txt"), "a.txt");
    }

    #[test]
    fn join_handles_root_parent() {
        assert_eq!(join("", "a.txt"), "a.txt");
        assert_eq!(join("Docs", "a.txt"), "Docs/a.txt");
    }

    #[test]
    fn is_under_requires_segment_boundary() {
        assert!(is_under("Mirrored", "Mirrored"));
        assert!(is_under("Mirrored/a.txt", "Mirrored"));
        assert!(!is_under("MirroredOld/a.txt", "Mirrored"));
    }
}
