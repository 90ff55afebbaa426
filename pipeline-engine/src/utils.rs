// Utility Functions
// Repository root detection for template path resolution

use std::path::{Path, PathBuf};

/// Walk up from `start` to the first directory containing `.git`.
/// `None` if `start` is not inside a repository.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().ok()?;
    start
        .ancestors()
        .find(|ancestor| ancestor.join(".git").exists())
        .map(Path::to_path_buf)
}

/// Repository root containing the pipeline file, or the file's own directory
pub fn default_repo_root(pipeline_file: &Path) -> PathBuf {
    let dir = match pipeline_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    find_repo_root(&dir).unwrap_or(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_find_repo_root_from_nested_dir() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        let nested = temp.path().join("ci").join("templates");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(
            find_repo_root(&nested).unwrap(),
            temp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_find_repo_root_missing_path() {
        assert!(find_repo_root(Path::new("/definitely/not/a/real/path")).is_none());
    }

    #[test]
    fn test_default_repo_root_prefers_repository() {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir(temp.path().join(".git")).unwrap();
        fs::create_dir_all(temp.path().join("ci")).unwrap();
        let file = temp.path().join("ci").join("pipeline.yml");

        assert_eq!(
            default_repo_root(&file),
            temp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_default_repo_root_falls_back_to_parent() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("pipeline.yml");
        let root = default_repo_root(&file);
        // tempdirs normally live outside any repository
        if find_repo_root(temp.path()).is_none() {
            assert_eq!(root, temp.path());
        }
    }
}
