use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path must be absolute: {0}")]
    Relative(String),
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("invalid item name: {0:?}")]
    InvalidName(String),
}

/// How the server compares paths. Keys produced here back every uniqueness
/// check and lookup in the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathCase {
    #[default]
    Sensitive,
    Insensitive,
}

impl PathCase {
    pub fn key(&self, path: &str) -> String {
        match self {
            PathCase::Sensitive => path.to_string(),
            PathCase::Insensitive => path.to_lowercase(),
        }
    }

    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.key(a) == self.key(b)
    }
}

pub fn normalize_remote_path(path: &str) -> Result<String, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(PathError::Relative(path.to_string()));
    }
    let mut out = String::with_capacity(path.len());
    for part in path.split('/').filter(|part| !part.is_empty()) {
        if part == "." || part == ".." || part.contains('\0') {
            return Err(PathError::UnsupportedComponent);
        }
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || name.trim().is_empty()
    {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// `None` for the root.
pub fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

pub fn is_same_or_descendant(path: &str, ancestor: &str, case: PathCase) -> bool {
    let path = case.key(path);
    let ancestor = case.key(ancestor);
    if ancestor == "/" {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(&ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Two paths depend on each other when one is equal to, or an ancestor of,
/// the other.
pub fn paths_related(a: &str, b: &str, case: PathCase) -> bool {
    is_same_or_descendant(a, b, case) || is_same_or_descendant(b, a, case)
}

/// Re-roots `path` from under `from` to under `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    let rest = path.strip_prefix(from)?;
    if from != "/" && !rest.starts_with('/') {
        return None;
    }
    let rest = rest.trim_start_matches('/');
    Some(join(to, rest))
}

pub fn cache_path_for(cache_root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = cache_root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_remote_path_under_cache_root() {
        let root = PathBuf::from("/cache");
        let mapped = cache_path_for(&root, "/Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/cache/Docs/A.txt"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/cache");
        assert!(matches!(
            cache_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent)
        ));
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize_remote_path("//Docs///A.txt/").unwrap(), "/Docs/A.txt");
        assert_eq!(normalize_remote_path("/").unwrap(), "/");
        assert_eq!(normalize_remote_path(""), Err(PathError::Empty));
        assert!(matches!(
            normalize_remote_path("Docs"),
            Err(PathError::Relative(_))
        ));
        assert_eq!(
            normalize_remote_path("/Docs/../etc"),
            Err(PathError::UnsupportedComponent)
        );
    }

    #[test]
    fn validate_name_rejects_traversal() {
        assert!(validate_name("report.pdf").is_ok());
        for bad in ["", ".", "..", "a/b", "  ", "nul\0"] {
            assert!(validate_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(parent_path("/Docs/A.txt").as_deref(), Some("/Docs"));
        assert_eq!(parent_path("/Docs").as_deref(), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(file_name("/Docs/A.txt"), "A.txt");
        assert_eq!(join("/", "Docs"), "/Docs");
    }

    #[test]
    fn relation_respects_component_boundaries() {
        let case = PathCase::Sensitive;
        assert!(paths_related("/a", "/a/b", case));
        assert!(paths_related("/a/b", "/a", case));
        assert!(!paths_related("/a", "/ab", case));
        assert!(!paths_related("/a", "/A", case));
        assert!(paths_related("/a", "/A", PathCase::Insensitive));
    }

    #[test]
    fn rebase_moves_descendants() {
        assert_eq!(rebase("/a/b/c", "/a", "/x").as_deref(), Some("/x/b/c"));
        assert_eq!(rebase("/a", "/a", "/x").as_deref(), Some("/x"));
        assert_eq!(rebase("/ab", "/a", "/x"), None);
    }
}
