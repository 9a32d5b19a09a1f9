//! Version control integration.
//!
//! The baseline manager keys records by branch and commit, and incremental
//! selection maps changed files onto affected pages. Both go through the
//! [`VersionControl`] capability so tests can substitute fixed answers.

use git2::{DiffOptions, Repository};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use crate::error::{Result, SnapError};

/// Read-only queries against the repository under test.
pub trait VersionControl: Send + Sync {
    /// Current branch name (e.g. "main").
    fn current_branch(&self) -> Result<String>;

    /// Current commit id as full hex.
    fn current_commit(&self) -> Result<String>;

    /// Paths changed between `base` and the working tree (staged and
    /// unstaged), repo-relative.
    fn diff_files(&self, base: &str) -> Result<Vec<PathBuf>>;
}

/// git2-backed implementation.
pub struct GitVersionControl {
    // Repository is Send but not Sync; queries serialize behind the lock
    repo: Mutex<Repository>,
}

impl std::fmt::Debug for GitVersionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitVersionControl").finish_non_exhaustive()
    }
}

impl GitVersionControl {
    /// Discover the repository containing `path`.
    pub fn discover(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::discover(path.as_ref()).map_err(|e| {
            SnapError::VersionControl(format!(
                "no git repository at {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }
}

impl VersionControl for GitVersionControl {
    fn current_branch(&self) -> Result<String> {
        let repo = self.repo.lock();
        let head = repo.head()?;
        if head.is_branch() {
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        } else {
            // Detached HEAD: expose the commit id the way git status does
            Ok(head
                .peel_to_commit()
                .map(|c| c.id().to_string())
                .unwrap_or_else(|_| "HEAD".to_string()))
        }
    }

    fn current_commit(&self) -> Result<String> {
        let repo = self.repo.lock();
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    fn diff_files(&self, base: &str) -> Result<Vec<PathBuf>> {
        let repo = self.repo.lock();
        let object = repo
            .revparse_single(base)
            .map_err(|e| SnapError::VersionControl(format!("cannot resolve '{base}': {e}")))?;
        let tree = object.peel_to_tree()?;

        let mut options = DiffOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut options))?;

        let mut files = Vec::new();
        for delta in diff.deltas() {
            if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                let path = path.to_path_buf();
                if !files.contains(&path) {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

/// Fixed answers for tests and for running outside a repository.
#[derive(Debug, Clone)]
pub struct StaticVersionControl {
    pub branch: String,
    pub commit: String,
    pub changed_files: Vec<PathBuf>,
}

impl StaticVersionControl {
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit: commit.into(),
            changed_files: Vec::new(),
        }
    }

    pub fn with_changed_files(mut self, files: Vec<PathBuf>) -> Self {
        self.changed_files = files;
        self
    }
}

impl VersionControl for StaticVersionControl {
    fn current_branch(&self) -> Result<String> {
        Ok(self.branch.clone())
    }

    fn current_commit(&self) -> Result<String> {
        Ok(self.commit.clone())
    }

    fn diff_files(&self, _base: &str) -> Result<Vec<PathBuf>> {
        Ok(self.changed_files.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_version_control() {
        let vcs = StaticVersionControl::new("feature/header", "abc123")
            .with_changed_files(vec![PathBuf::from("src/header.tsx")]);
        assert_eq!(vcs.current_branch().unwrap(), "feature/header");
        assert_eq!(vcs.current_commit().unwrap(), "abc123");
        assert_eq!(vcs.diff_files("main").unwrap().len(), 1);
    }

    #[test]
    fn test_discover_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitVersionControl::discover(dir.path()).unwrap_err();
        assert!(matches!(err, SnapError::VersionControl(_)));
    }

    #[test]
    fn test_git_queries_on_fresh_repo() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        // One commit so HEAD resolves
        std::fs::write(dir.path().join("page.html"), "<html></html>").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("page.html")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        {
            let tree = repo.find_tree(tree_id).unwrap();
            let sig = git2::Signature::now("test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
        }
        drop(repo);

        let vcs = GitVersionControl::discover(dir.path()).unwrap();
        let branch = vcs.current_branch().unwrap();
        assert!(branch == "main" || branch == "master");
        assert_eq!(vcs.current_commit().unwrap().len(), 40);

        // Modify the file; it must show up against HEAD
        std::fs::write(dir.path().join("page.html"), "<html><body/></html>").unwrap();
        let changed = vcs.diff_files("HEAD").unwrap();
        assert_eq!(changed, vec![PathBuf::from("page.html")]);
    }
}
