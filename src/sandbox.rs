//! Workspace confinement.
//!
//! Every path a tool touches goes through [`Workspace::resolve`]. The raw path is
//! joined onto the workspace root, the deepest existing ancestor is canonicalized
//! (following symlinks), and whatever does not exist yet is appended lexically.
//! The result must be a descendant of the canonical root, which rejects `../`
//! traversal, absolute paths elsewhere, and symlinks pointing out of the tree
//! with the same check.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path must not be empty")]
    Empty,
    #[error(
        "access denied: '{raw}' resolves to {} which is outside the workspace ({})",
        resolved.display(),
        root.display()
    )]
    Violation {
        raw: String,
        resolved: PathBuf,
        root: PathBuf,
    },
    #[error("access denied: '{raw}' is a symlink whose target cannot be resolved")]
    DanglingSymlink { raw: String },
    #[error("workspace root {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to resolve '{raw}': {source}")]
    Io {
        raw: String,
        #[source]
        source: io::Error,
    },
}

impl SandboxError {
    /// True for errors that mean "this path would leave the workspace".
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            SandboxError::Violation { .. } | SandboxError::DanglingSymlink { .. }
        )
    }
}

/// The canonical directory all tool operations are confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Canonicalize `path` once at startup. The root never changes afterwards.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let path = path.as_ref();
        let root = path.canonicalize().map_err(|source| SandboxError::Io {
            raw: path.display().to_string(),
            source,
        })?;
        if !root.is_dir() {
            return Err(SandboxError::NotADirectory(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a raw, model-supplied path to a canonical path inside the workspace.
    ///
    /// The target does not need to exist (write creates files), but every part of
    /// it that does exist is resolved through symlinks before the containment
    /// check runs.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, SandboxError> {
        if raw.trim().is_empty() {
            return Err(SandboxError::Empty);
        }

        // An absolute path replaces the root here; the containment check below
        // decides whether it is acceptable.
        let joined = self.root.join(raw);

        let mut existing = joined.clone();
        let mut tail: Vec<Component<'_>> = Vec::new();
        let components: Vec<Component<'_>> = joined.components().collect();
        let mut keep = components.len();
        while fs::symlink_metadata(&existing).is_err() {
            if keep == 0 || !existing.pop() {
                return Err(SandboxError::Io {
                    raw: raw.to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no existing ancestor"),
                });
            }
            keep -= 1;
            tail.push(components[keep]);
        }
        tail.reverse();

        let mut resolved = match existing.canonicalize() {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // The entry exists but its target does not: a dangling symlink.
                return Err(SandboxError::DanglingSymlink {
                    raw: raw.to_string(),
                });
            }
            Err(source) => {
                return Err(SandboxError::Io {
                    raw: raw.to_string(),
                    source,
                })
            }
        };

        // Nothing below this point exists, so nothing can be a symlink and
        // lexical normalization is exact.
        for component in tail {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    resolved.push(component.as_os_str());
                }
            }
        }

        if !self.contains(&resolved) {
            return Err(SandboxError::Violation {
                raw: raw.to_string(),
                resolved,
                root: self.root.clone(),
            });
        }

        Ok(resolved)
    }

    /// Component-wise containment (so `/ws-other` is not inside `/ws`).
    pub fn contains(&self, canonical: &Path) -> bool {
        canonical.starts_with(&self.root)
    }

    /// Path relative to the root for display, `.` for the root itself.
    pub fn display_relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ws/src")).unwrap();
        fs::write(dir.path().join("ws/src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("secret.txt"), "outside").unwrap();
        let ws = Workspace::open(dir.path().join("ws")).unwrap();
        (dir, ws)
    }

    #[test]
    fn test_resolves_existing_file() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("src/main.rs").unwrap();
        assert_eq!(resolved, ws.root().join("src/main.rs"));
    }

    #[test]
    fn test_dot_is_root() {
        let (_dir, ws) = workspace();
        assert_eq!(ws.resolve(".").unwrap(), ws.root());
        assert_eq!(ws.display_relative(ws.root()), ".");
    }

    #[test]
    fn test_allows_missing_nested_target() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("new_dir/deeper/file.txt").unwrap();
        assert_eq!(resolved, ws.root().join("new_dir/deeper/file.txt"));
    }

    #[test]
    fn test_rejects_traversal_forms() {
        let (_dir, ws) = workspace();
        for raw in [
            "../secret.txt",
            "src/../../secret.txt",
            "./../secret.txt",
            "missing/../../secret.txt",
            "src/../missing/../../..",
        ] {
            let err = ws.resolve(raw).unwrap_err();
            assert!(err.is_violation(), "{raw} should be rejected, got {err}");
        }
    }

    #[test]
    fn test_inner_traversal_that_stays_inside_is_allowed() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("src/../src/main.rs").unwrap();
        assert_eq!(resolved, ws.root().join("src/main.rs"));
        let resolved = ws.resolve("missing/../src").unwrap();
        assert_eq!(resolved, ws.root().join("src"));
    }

    #[test]
    fn test_rejects_absolute_outside() {
        let (dir, ws) = workspace();
        let outside = dir.path().join("secret.txt");
        let err = ws.resolve(outside.to_str().unwrap()).unwrap_err();
        assert!(err.is_violation());
        assert!(ws.resolve("/").unwrap_err().is_violation());
    }

    #[test]
    fn test_allows_absolute_inside() {
        let (_dir, ws) = workspace();
        let inside = ws.root().join("src/main.rs");
        assert_eq!(ws.resolve(inside.to_str().unwrap()).unwrap(), inside);
    }

    #[test]
    fn test_rejects_sibling_with_shared_prefix() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ws")).unwrap();
        fs::create_dir_all(dir.path().join("ws-other")).unwrap();
        fs::write(dir.path().join("ws-other/file.txt"), "x").unwrap();
        let ws = Workspace::open(dir.path().join("ws")).unwrap();

        let err = ws.resolve("../ws-other/file.txt").unwrap_err();
        assert!(err.is_violation());
    }

    #[test]
    fn test_rejects_empty() {
        let (_dir, ws) = workspace();
        assert!(matches!(ws.resolve("   "), Err(SandboxError::Empty)));
    }

    #[test]
    fn test_keeps_surrounding_spaces_in_names() {
        let (_dir, ws) = workspace();
        fs::write(ws.root().join(" padded.txt "), "x").unwrap();

        let resolved = ws.resolve(" padded.txt ").unwrap();
        assert_eq!(resolved, ws.root().join(" padded.txt "));
        assert!(resolved.is_file());
        assert_ne!(ws.resolve("padded.txt").unwrap(), resolved);
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escapes() {
        use std::os::unix::fs::symlink;

        let (dir, ws) = workspace();
        symlink(dir.path().join("secret.txt"), ws.root().join("link.txt")).unwrap();
        symlink(dir.path(), ws.root().join("up")).unwrap();

        assert!(ws.resolve("link.txt").unwrap_err().is_violation());
        assert!(ws.resolve("up/secret.txt").unwrap_err().is_violation());
        // Writing a new file through an escaping directory link is also caught.
        assert!(ws.resolve("up/new.txt").unwrap_err().is_violation());
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_dangling_symlink() {
        use std::os::unix::fs::symlink;

        let (dir, ws) = workspace();
        symlink(dir.path().join("nowhere.txt"), ws.root().join("dangling")).unwrap();

        let err = ws.resolve("dangling").unwrap_err();
        assert!(matches!(err, SandboxError::DanglingSymlink { .. }));
        assert!(!dir.path().join("nowhere.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_follows_symlink_that_stays_inside() {
        use std::os::unix::fs::symlink;

        let (_dir, ws) = workspace();
        symlink(ws.root().join("src"), ws.root().join("alias")).unwrap();
        let resolved = ws.resolve("alias/main.rs").unwrap();
        assert_eq!(resolved, ws.root().join("src/main.rs"));
    }

    #[test]
    fn test_open_rejects_file_root() {
        let (_dir, ws) = workspace();
        let err = Workspace::open(ws.root().join("src/main.rs")).unwrap_err();
        assert!(matches!(err, SandboxError::NotADirectory(_)));
    }
}
