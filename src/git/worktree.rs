//! Git worktree operations
//!
//! Branch detection for session metadata and isolated worktrees for ticket
//! sessions.

use git2::{BranchType, Repository};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during git operations
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepository(String),
    #[error("Git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("Worktree already exists: {0}")]
    WorktreeExists(String),
    #[error("Branch not found: {0}")]
    BranchNotFound(String),
    #[error("Invalid worktree path: {0}")]
    InvalidPath(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Information about a git worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Path to the worktree
    pub path: PathBuf,
    /// Branch checked out in the worktree
    pub branch: String,
}

/// Check if a path is inside a git repository
pub fn is_git_repository(path: &Path) -> bool {
    Repository::discover(path).is_ok()
}

/// Get repository for a path
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    Repository::discover(path).map_err(|_| GitError::NotARepository(path.display().to_string()))
}

/// Short name of the branch checked out at `path`, if any
pub fn current_branch(path: &Path) -> Option<String> {
    let repo = Repository::discover(path).ok()?;
    let head = repo.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(String::from)
}

/// Turn free text into something usable as a branch or directory name
pub fn sanitize_branch_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '/' || c == '.' || c == '_' {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches(|c| c == '-' || c == '/' || c == '.').to_string()
}

/// Default location of a worktree for `branch`: a sibling directory of the
/// repository named `<repo>-worktrees/<branch>`
pub fn worktree_path_for(repo: &Repository, branch: &str) -> Result<PathBuf, GitError> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| GitError::InvalidPath("Bare repositories are not supported".into()))?;
    let workdir = workdir.canonicalize()?;
    let repo_name = workdir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GitError::InvalidPath(workdir.display().to_string()))?;
    let parent = workdir
        .parent()
        .ok_or_else(|| GitError::InvalidPath(workdir.display().to_string()))?;

    Ok(parent
        .join(format!("{}-worktrees", repo_name))
        .join(branch.replace('/', "-")))
}

/// Create a new worktree for the specified branch
///
/// The branch is taken from a local branch, then `origin/<branch>`; when
/// neither exists and `base` is given it is created from `base` (local, then
/// `origin/<base>`).
pub fn create_worktree(
    repo: &Repository,
    worktree_path: &Path,
    branch_name: &str,
    base: Option<&str>,
) -> Result<WorktreeInfo, GitError> {
    if worktree_path.as_os_str().is_empty() {
        return Err(GitError::InvalidPath("Worktree path cannot be empty".into()));
    }

    if worktree_path.exists() {
        return Err(GitError::WorktreeExists(
            worktree_path.display().to_string(),
        ));
    }

    let worktree_name = worktree_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| GitError::InvalidPath("Invalid worktree name".into()))?;

    if repo.find_worktree(worktree_name).is_ok() {
        return Err(GitError::WorktreeExists(worktree_name.to_string()));
    }

    let branch = match repo.find_branch(branch_name, BranchType::Local) {
        Ok(branch) => branch,
        Err(_) => {
            let remote_branch_name = format!("origin/{}", branch_name);
            match repo.find_branch(&remote_branch_name, BranchType::Remote) {
                Ok(remote_branch) => {
                    let commit = remote_branch.get().peel_to_commit()?;
                    repo.branch(branch_name, &commit, false)?
                }
                Err(_) => {
                    let base = base.ok_or_else(|| GitError::BranchNotFound(branch_name.to_string()))?;
                    let commit = find_base_commit(repo, base)?;
                    repo.branch(branch_name, &commit, false)?
                }
            }
        }
    };

    let reference = branch.into_reference();

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    repo.worktree(
        worktree_name,
        worktree_path,
        Some(git2::WorktreeAddOptions::new().reference(Some(&reference))),
    )?;

    Ok(WorktreeInfo {
        path: worktree_path.to_path_buf(),
        branch: branch_name.to_string(),
    })
}

fn find_base_commit<'r>(repo: &'r Repository, base: &str) -> Result<git2::Commit<'r>, GitError> {
    if let Ok(branch) = repo.find_branch(base, BranchType::Local) {
        return Ok(branch.get().peel_to_commit()?);
    }
    if let Ok(branch) = repo.find_branch(&format!("origin/{}", base), BranchType::Remote) {
        return Ok(branch.get().peel_to_commit()?);
    }
    Err(GitError::BranchNotFound(base.to_string()))
}

/// Get (or create) the worktree for `branch` of the repository containing
/// `project_path`. An existing worktree directory is reused.
pub fn prepare_worktree(
    project_path: &Path,
    branch: &str,
    base: &str,
) -> Result<WorktreeInfo, GitError> {
    let repo = open_repository(project_path)?;
    let path = worktree_path_for(&repo, branch)?;

    if path.join(".git").exists() {
        return Ok(WorktreeInfo {
            path,
            branch: branch.to_string(),
        });
    }

    create_worktree(&repo, &path, branch, Some(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_repo() -> (TempDir, Repository) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let repo_dir = temp_dir.path().join("project");
        fs::create_dir_all(&repo_dir).unwrap();
        let repo = Repository::init(&repo_dir).expect("Failed to init repo");

        {
            let signature = git2::Signature::now("Test", "test@example.com").unwrap();
            let tree_id = repo.index().unwrap().write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                "Initial commit",
                &tree,
                &[],
            )
            .expect("Failed to create initial commit");
        }

        (temp_dir, repo)
    }

    fn head_branch(repo: &Repository) -> String {
        repo.head().unwrap().shorthand().unwrap().to_string()
    }

    #[test]
    fn test_is_git_repository() {
        let (temp_dir, _repo) = create_test_repo();
        assert!(is_git_repository(&temp_dir.path().join("project")));

        let plain = TempDir::new().unwrap();
        assert!(!is_git_repository(plain.path()));
    }

    #[test]
    fn test_open_repository_not_a_repo() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let result = open_repository(temp_dir.path());
        assert!(matches!(result, Err(GitError::NotARepository(_))));
    }

    #[test]
    fn test_current_branch() {
        let (temp_dir, repo) = create_test_repo();
        let project = temp_dir.path().join("project");
        assert_eq!(current_branch(&project), Some(head_branch(&repo)));

        let plain = TempDir::new().unwrap();
        assert_eq!(current_branch(plain.path()), None);
    }

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("ticket/ENG-123"), "ticket/eng-123");
        assert_eq!(sanitize_branch_name("  Fix login: crash!! "), "fix-login-crash");
        assert_eq!(sanitize_branch_name("--"), "");
    }

    #[test]
    fn test_create_worktree_existing_branch() {
        let (temp_dir, repo) = create_test_repo();

        let head_commit = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("feature-branch", &head_commit, false)
            .expect("Failed to create branch");

        let worktree_path = temp_dir.path().join("worktrees").join("feature-branch");
        let info = create_worktree(&repo, &worktree_path, "feature-branch", None).unwrap();

        assert_eq!(info.branch, "feature-branch");
        assert!(worktree_path.exists());
    }

    #[test]
    fn test_create_worktree_from_base() {
        let (temp_dir, repo) = create_test_repo();
        let base = head_branch(&repo);

        let worktree_path = temp_dir.path().join("worktrees").join("new-work");
        let info = create_worktree(&repo, &worktree_path, "new-work", Some(&base)).unwrap();

        assert_eq!(info.branch, "new-work");
        assert!(repo.find_branch("new-work", BranchType::Local).is_ok());
    }

    #[test]
    fn test_create_worktree_branch_not_found() {
        let (temp_dir, repo) = create_test_repo();

        let worktree_path = temp_dir.path().join("worktrees").join("nonexistent");
        let result = create_worktree(&repo, &worktree_path, "nonexistent-branch", None);
        assert!(matches!(result, Err(GitError::BranchNotFound(_))));

        let result = create_worktree(&repo, &worktree_path, "other", Some("no-such-base"));
        assert!(matches!(result, Err(GitError::BranchNotFound(_))));
    }

    #[test]
    fn test_create_worktree_path_exists() {
        let (temp_dir, repo) = create_test_repo();

        let worktree_path = temp_dir.path().join("existing-dir");
        fs::create_dir_all(&worktree_path).unwrap();

        let result = create_worktree(&repo, &worktree_path, "main", None);
        assert!(matches!(result, Err(GitError::WorktreeExists(_))));
    }

    #[test]
    fn test_create_worktree_empty_path() {
        let (_temp_dir, repo) = create_test_repo();

        let result = create_worktree(&repo, Path::new(""), "main", None);
        assert!(matches!(result, Err(GitError::InvalidPath(_))));
    }

    #[test]
    fn test_prepare_worktree_reuses_existing() {
        let (temp_dir, repo) = create_test_repo();
        let project = temp_dir.path().join("project");
        let base = head_branch(&repo);

        let first = prepare_worktree(&project, "ticket/eng-1", &base).unwrap();
        assert!(first.path.ends_with("project-worktrees/ticket-eng-1"));
        assert!(first.path.exists());
        assert_eq!(current_branch(&first.path).as_deref(), Some("ticket/eng-1"));

        let second = prepare_worktree(&project, "ticket/eng-1", &base).unwrap();
        assert_eq!(first.path, second.path);
    }
}
