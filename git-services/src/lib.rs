//! Local Git helper for the review pipeline.
//!
//! Contract consumed by the core: `diff(base, head)` with triple-dot
//! semantics (merge base of the two refs against head), `checkout(ref)`,
//! and `list_changed_files(base, head)`. Invalid paths and missing refs
//! surface before the pipeline starts.

use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{Commit, DiffFormat, DiffOptions, Repository};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the git service layer.
#[derive(Debug, Error)]
pub enum GitServiceError {
    #[error("repository path does not exist or is not a directory")]
    NotADirectory,

    #[error("not a git repository")]
    NotARepository,

    #[error("unknown ref `{0}`")]
    MissingRef(String),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("diff output is not valid utf-8")]
    NonUtf8Diff,
}

pub type GitResult<T> = Result<T, GitServiceError>;

/// Handle on a local repository checkout.
pub struct GitRepo {
    repo: Repository,
    path: PathBuf,
}

impl GitRepo {
    /// Opens and validates a local repository.
    pub fn open(path: &Path) -> GitResult<GitRepo> {
        if !path.is_dir() {
            return Err(GitServiceError::NotADirectory);
        }
        let repo = Repository::open(path).map_err(|_| GitServiceError::NotARepository)?;
        Ok(GitRepo {
            repo,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force-checks out `refname` and detaches HEAD at it, so the tools
    /// read the head version of the working tree.
    pub fn checkout(&self, refname: &str) -> GitResult<()> {
        let commit = self.resolve_commit(refname)?;
        debug!(refname, id = %commit.id(), "git: checkout");
        let mut opts = CheckoutBuilder::new();
        opts.force();
        self.repo
            .checkout_tree(commit.as_object(), Some(&mut opts))?;
        self.repo.set_head_detached(commit.id())?;
        Ok(())
    }

    /// Unified diff of `base...head`: changes on head since the merge
    /// base, matching `git diff base...head`.
    pub fn diff(&self, base: &str, head: &str) -> GitResult<String> {
        let diff = self.build_diff(base, head)?;
        let mut out = String::new();
        let mut utf8_ok = true;
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            let origin = line.origin();
            if matches!(origin, '+' | '-' | ' ') {
                out.push(origin);
            }
            match std::str::from_utf8(line.content()) {
                Ok(s) => out.push_str(s),
                Err(_) => utf8_ok = false,
            }
            true
        })?;
        if !utf8_ok {
            return Err(GitServiceError::NonUtf8Diff);
        }
        info!(base, head, chars = out.len(), "git: diff built");
        Ok(out)
    }

    /// Paths changed between the merge base and head, repo-relative.
    pub fn list_changed_files(&self, base: &str, head: &str) -> GitResult<Vec<String>> {
        let diff = self.build_diff(base, head)?;
        let mut files = Vec::new();
        for delta in diff.deltas() {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path());
            if let Some(p) = path {
                files.push(p.to_string_lossy().replace('\\', "/"));
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn build_diff(&self, base: &str, head: &str) -> GitResult<git2::Diff<'_>> {
        let base_commit = self.resolve_commit(base)?;
        let head_commit = self.resolve_commit(head)?;
        let merge_base = self
            .repo
            .merge_base(base_commit.id(), head_commit.id())?;
        let merge_commit = self.repo.find_commit(merge_base)?;

        let mut opts = DiffOptions::new();
        opts.context_lines(3);
        let diff = self.repo.diff_tree_to_tree(
            Some(&merge_commit.tree()?),
            Some(&head_commit.tree()?),
            Some(&mut opts),
        )?;
        Ok(diff)
    }

    fn resolve_commit(&self, refname: &str) -> GitResult<Commit<'_>> {
        let obj = self
            .repo
            .revparse_single(refname)
            .map_err(|_| GitServiceError::MissingRef(refname.to_string()))?;
        obj.peel_to_commit()
            .map_err(|_| GitServiceError::MissingRef(refname.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::fs;

    fn sig() -> Signature<'static> {
        Signature::now("tester", "tester@example.com").unwrap()
    }

    fn commit_all(repo: &Repository, message: &str) -> git2::Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let parent = repo
            .head()
            .ok()
            .and_then(|h| h.target())
            .and_then(|id| repo.find_commit(id).ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig(), &sig(), message, &tree, &parents)
            .unwrap()
    }

    fn fixture_repo() -> (tempfile::TempDir, git2::Oid, git2::Oid) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let base = commit_all(&repo, "base");
        fs::write(dir.path().join("a.txt"), "one\nTWO\nthree\n").unwrap();
        fs::write(dir.path().join("b.txt"), "new file\n").unwrap();
        let head = commit_all(&repo, "head");
        (dir, base, head)
    }

    #[test]
    fn open_rejects_non_repos() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GitRepo::open(dir.path()),
            Err(GitServiceError::NotARepository)
        ));
        assert!(matches!(
            GitRepo::open(Path::new("/definitely/not/here")),
            Err(GitServiceError::NotADirectory)
        ));
    }

    #[test]
    fn diff_and_changed_files_between_commits() {
        let (dir, base, head) = fixture_repo();
        let repo = GitRepo::open(dir.path()).unwrap();

        let files = repo
            .list_changed_files(&base.to_string(), &head.to_string())
            .unwrap();
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);

        let diff = repo.diff(&base.to_string(), &head.to_string()).unwrap();
        assert!(diff.contains("diff --git a/a.txt b/a.txt"));
        assert!(diff.contains("+TWO"));
        assert!(diff.contains("+three"));
        assert!(diff.contains("+new file"));
    }

    #[test]
    fn missing_ref_is_reported() {
        let (dir, _base, _head) = fixture_repo();
        let repo = GitRepo::open(dir.path()).unwrap();
        assert!(matches!(
            repo.diff("no-such-branch", "HEAD"),
            Err(GitServiceError::MissingRef(_))
        ));
    }

    #[test]
    fn checkout_moves_working_tree() {
        let (dir, base, _head) = fixture_repo();
        let repo = GitRepo::open(dir.path()).unwrap();
        repo.checkout(&base.to_string()).unwrap();
        let content = fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "one\ntwo\n");
        assert!(!dir.path().join("b.txt").exists());
    }
}
