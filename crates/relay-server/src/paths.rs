//! Working-directory validation against the configured roots.

use std::path::{Path, PathBuf};

use crate::error::CwdError;

/// Expand a leading `~` or `~/` to the home directory. Other paths are returned as given.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path {
        "~" => "",
        _ => match path.strip_prefix("~/") {
            Some(rest) => rest,
            None => return PathBuf::from(path),
        },
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => PathBuf::from(path),
    }
}

/// Resolve `path` to its canonical form and require it to be a directory under one of `roots`.
pub async fn validate_cwd(path: &Path, roots: &[PathBuf]) -> Result<PathBuf, CwdError> {
    if roots.is_empty() {
        return Err(CwdError::NoRoots);
    }

    let real = tokio::fs::canonicalize(path)
        .await
        .map_err(|source| CwdError::Unresolvable {
            path: path.to_path_buf(),
            source,
        })?;

    let metadata = tokio::fs::metadata(&real)
        .await
        .map_err(|source| CwdError::Unresolvable {
            path: real.clone(),
            source,
        })?;
    if !metadata.is_dir() {
        return Err(CwdError::NotADirectory(real));
    }

    for root in roots {
        // Roots that no longer exist simply never match.
        let Ok(root) = tokio::fs::canonicalize(root).await else {
            continue;
        };
        if real.starts_with(&root) {
            return Ok(real);
        }
    }

    Err(CwdError::OutsideRoots(real))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_accepts_nested_directory() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let real = validate_cwd(&nested, &[root.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(real, std::fs::canonicalize(&nested).unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escape_through_dotdot() {
        let root = tempfile::tempdir().unwrap();
        let inner = root.path().join("inner");
        std::fs::create_dir_all(&inner).unwrap();

        let escaped = inner.join("../..");
        let err = validate_cwd(&escaped, &[inner.clone()]).await.unwrap_err();
        assert!(matches!(err, CwdError::OutsideRoots(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_rejects_files_and_missing_paths() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let roots = [root.path().to_path_buf()];

        assert!(matches!(
            validate_cwd(&file, &roots).await,
            Err(CwdError::NotADirectory(_))
        ));
        assert!(matches!(
            validate_cwd(&root.path().join("missing"), &roots).await,
            Err(CwdError::Unresolvable { .. })
        ));
        assert!(matches!(
            validate_cwd(root.path(), &[]).await,
            Err(CwdError::NoRoots)
        ));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs"), PathBuf::from("/abs"));
        assert!(expand_home("~/x").ends_with("x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~"), home);
            assert_eq!(expand_home("~/a/b"), home.join("a/b"));
        }
        // `~user` is not expanded.
        assert_eq!(expand_home("~other/x"), PathBuf::from("~other/x"));
    }
}
