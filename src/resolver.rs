//! Request path validation against the configured root directory.
//!
//! Paths from the network are untrusted. Traversal is rejected lexically
//! before the filesystem is touched, then the canonical path is checked
//! again so that symlinks cannot lead outside the root.

use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, TransferError};

/// Maps request paths to regular files under a root directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver bounded by `root`.
    ///
    /// The root must exist and be a directory.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = std::fs::canonicalize(root.as_ref())?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root '{}' is not a directory", root.display()),
            ));
        }
        Ok(PathResolver { root })
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path to a readable regular file under the root.
    ///
    /// Relative paths are interpreted against the root; absolute paths are
    /// accepted only when they already point inside it.
    pub async fn resolve(&self, request: &str) -> Result<PathBuf> {
        if request.is_empty() {
            return Err(TransferError::InvalidRequest("empty path".to_string()));
        }

        let requested = Path::new(request);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let normalized = match normalize_lexically(&joined) {
            Some(path) if path.starts_with(&self.root) => path,
            _ => {
                return Err(TransferError::InvalidRequest(
                    "path escapes root directory".to_string(),
                ))
            }
        };

        let canonical = tokio::fs::canonicalize(&normalized)
            .await
            .map_err(lookup_error)?;
        if !canonical.starts_with(&self.root) {
            return Err(TransferError::Access(
                "path resolves outside root directory".to_string(),
            ));
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(lookup_error)?;
        if !metadata.is_file() {
            return Err(TransferError::NotFound("not a regular file".to_string()));
        }

        Ok(canonical)
    }
}

/// Map a filesystem lookup failure to a transfer error.
pub(crate) fn lookup_error(err: io::Error) -> TransferError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => TransferError::Access("permission denied".to_string()),
        io::ErrorKind::NotFound => TransferError::NotFound("no such file".to_string()),
        _ => TransferError::NotFound(format!("cannot resolve path: {err}")),
    }
}

/// Resolve `.` and `..` without consulting the filesystem.
///
/// Returns `None` when `..` would climb above the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathResolver) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/readme.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        let resolver = PathResolver::new(dir.path()).unwrap();
        (dir, resolver)
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/srv/a/./b/../c")),
            Some(PathBuf::from("/srv/a/c"))
        );
        assert_eq!(normalize_lexically(Path::new("/..")), None);
        assert_eq!(normalize_lexically(Path::new("/srv/../../etc")), None);
    }

    #[test]
    fn test_root_must_be_directory() {
        let (dir, _) = setup();
        assert!(PathResolver::new(dir.path().join("top.txt")).is_err());
        assert!(PathResolver::new(dir.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_resolve_relative() {
        let (_dir, resolver) = setup();
        let path = resolver.resolve("docs/readme.txt").await.unwrap();
        assert_eq!(path, resolver.root().join("docs/readme.txt"));
    }

    #[tokio::test]
    async fn test_resolve_absolute_inside_root() {
        let (_dir, resolver) = setup();
        let absolute = resolver.root().join("top.txt");
        let path = resolver.resolve(absolute.to_str().unwrap()).await.unwrap();
        assert_eq!(path, absolute);
    }

    #[tokio::test]
    async fn test_resolve_dot_segments_inside_root() {
        let (_dir, resolver) = setup();
        let path = resolver.resolve("./docs/../top.txt").await.unwrap();
        assert_eq!(path, resolver.root().join("top.txt"));
    }

    #[tokio::test]
    async fn test_reject_traversal() {
        let (_dir, resolver) = setup();
        for request in ["../etc/passwd", "docs/../../secret", "/etc/passwd", "/"] {
            match resolver.resolve(request).await {
                Err(TransferError::InvalidRequest(_)) => {}
                other => panic!("{request}: unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_reject_empty() {
        let (_dir, resolver) = setup();
        assert!(matches!(
            resolver.resolve("").await,
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let (_dir, resolver) = setup();
        assert!(matches!(
            resolver.resolve("nope.txt").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_directory_is_not_served() {
        let (_dir, resolver) = setup();
        assert!(matches!(
            resolver.resolve("docs").await,
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            resolver.resolve(".").await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape() {
        let (dir, resolver) = setup();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        assert!(matches!(
            resolver.resolve("link.txt").await,
            Err(TransferError::Access(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_inside_root() {
        let (dir, resolver) = setup();
        std::os::unix::fs::symlink(
            dir.path().join("docs/readme.txt"),
            dir.path().join("alias.txt"),
        )
        .unwrap();

        let path = resolver.resolve("alias.txt").await.unwrap();
        assert_eq!(path, resolver.root().join("docs/readme.txt"));
    }
}
