//! Git Runtime: bare mirror cache, worktree lifecycle, and per-operation
//! SSH key handling. Shells out to the system `git`, mirroring the
//! process-spawning style used elsewhere in this codebase rather than
//! linking a git library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::error::{GitError, GitResult};

/// Ephemeral SSH key file, scoped to a single git invocation. Mode 0600;
/// removed on drop regardless of whether the git call succeeded.
struct ScopedSshKey {
    path: PathBuf,
}

impl ScopedSshKey {
    async fn write(private_key: &str) -> GitResult<Self> {
        let mut file = tempfile::NamedTempFile::new().map_err(GitError::Io)?;
        use std::io::Write;
        file.write_all(private_key.as_bytes()).map_err(GitError::Io)?;
        file.flush().map_err(GitError::Io)?;

        #[cfg(unix)]
        {
            let mut perms = file.as_file().metadata().map_err(GitError::Io)?.permissions();
            perms.set_mode(0o600);
            file.as_file().set_permissions(perms).map_err(GitError::Io)?;
        }

        let (_file, path) = file.keep().map_err(|e| GitError::Io(e.error))?;
        Ok(Self { path })
    }

    fn ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o IdentityAgent=none -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null",
            self.path.display()
        )
    }
}

impl Drop for ScopedSshKey {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bare mirror cache + worktree lifecycle.
#[derive(Clone)]
pub struct GitRuntime {
    repos_root: PathBuf,
    mirror_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl GitRuntime {
    pub fn new(repos_root: PathBuf) -> Self {
        Self {
            repos_root,
            mirror_locks: Arc::new(DashMap::new()),
        }
    }

    fn mirror_hash(identity_id: &str, repo_url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(identity_id.as_bytes());
        hasher.update(b":");
        hasher.update(repo_url.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn mirror_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.mirror_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run_git(
        dir: Option<&Path>,
        args: &[&str],
        ssh_key: Option<&ScopedSshKey>,
    ) -> GitResult<String> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(args);
        if let Some(key) = ssh_key {
            cmd.env("GIT_SSH_COMMAND", key.ssh_command());
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");

        log::debug!("running git {:?}", args);
        let output = cmd.output().await.map_err(GitError::Io)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            log::warn!("git {:?} failed: {stderr}", args);
            return Err(GitError::Worktree(format!(
                "git {:?} failed: {stderr}",
                args
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Idempotent: clones `--bare` on first call, reuses the mirror for
    /// subsequent callers of the same `(repoUrl, identityId)`.
    pub async fn ensure_bare_clone(
        &self,
        repo_url: &str,
        identity_id: &str,
        ssh_private_key: &str,
    ) -> GitResult<PathBuf> {
        let hash = Self::mirror_hash(identity_id, repo_url);
        let bare_path = self.repos_root.join(&hash);
        let lock = self.mirror_lock(&hash);
        let _guard = lock.lock().await;

        if bare_path.join("HEAD").exists() {
            return Ok(bare_path);
        }

        tokio::fs::create_dir_all(&self.repos_root)
            .await
            .map_err(GitError::Io)?;

        let key = ScopedSshKey::write(ssh_private_key).await?;
        let result = Self::run_git(
            None,
            &[
                "clone",
                "--bare",
                repo_url,
                bare_path.to_str().unwrap_or_default(),
            ],
            Some(&key),
        )
        .await;
        drop(key);

        result
            .map(|_| bare_path)
            .map_err(|e| GitError::Clone(e.to_string()))
    }

    pub async fn fetch(&self, bare_repo_path: &Path, ssh_private_key: &str) -> GitResult<()> {
        let key = ScopedSshKey::write(ssh_private_key).await?;
        let result = Self::run_git(
            Some(bare_repo_path),
            &["fetch", "origin", "+refs/heads/*:refs/heads/*", "--prune"],
            Some(&key),
        )
        .await;
        drop(key);
        result.map(|_| ()).map_err(|e| GitError::Clone(e.to_string()))
    }

    /// Materializes a worktree checked out on a new branch from `base_ref`,
    /// with upstream configured so a later `push` targets `base_ref`.
    pub async fn create_worktree(
        &self,
        bare_repo_path: &Path,
        worktree_path: &Path,
        branch_name: &str,
        base_ref: &str,
    ) -> GitResult<()> {
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(GitError::Io)?;
        }

        Self::run_git(
            Some(bare_repo_path),
            &[
                "worktree",
                "add",
                "-b",
                branch_name,
                worktree_path.to_str().unwrap_or_default(),
                base_ref,
            ],
            None,
        )
        .await
        .map_err(|e| GitError::Worktree(e.to_string()))?;

        Self::run_git(
            Some(worktree_path),
            &["config", &format!("branch.{branch_name}.remote"), "origin"],
            None,
        )
        .await
        .map_err(|e| GitError::Worktree(e.to_string()))?;

        Self::run_git(
            Some(worktree_path),
            &[
                "config",
                &format!("branch.{branch_name}.merge"),
                &format!("refs/heads/{base_ref}"),
            ],
            None,
        )
        .await
        .map_err(|e| GitError::Worktree(e.to_string()))?;

        Ok(())
    }

    pub async fn remove_worktree(
        &self,
        bare_repo_path: &Path,
        worktree_path: &Path,
    ) -> GitResult<()> {
        let _ = Self::run_git(
            Some(bare_repo_path),
            &[
                "worktree",
                "remove",
                "--force",
                worktree_path.to_str().unwrap_or_default(),
            ],
            None,
        )
        .await;

        if worktree_path.exists() {
            tokio::fs::remove_dir_all(worktree_path)
                .await
                .map_err(GitError::Io)?;
        }
        let _ = Self::run_git(Some(bare_repo_path), &["worktree", "prune"], None).await;
        Ok(())
    }

    pub async fn has_uncommitted_changes(&self, worktree_path: &Path) -> GitResult<bool> {
        let out = Self::run_git(Some(worktree_path), &["status", "--porcelain"], None)
            .await
            .map_err(|e| GitError::Worktree(e.to_string()))?;
        Ok(!out.trim().is_empty())
    }

    pub async fn commit(
        &self,
        worktree_path: &Path,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> GitResult<String> {
        Self::run_git(Some(worktree_path), &["add", "-A"], None)
            .await
            .map_err(|e| GitError::Commit(e.to_string()))?;

        Self::run_git(
            Some(worktree_path),
            &[
                "-c",
                &format!("user.name={author_name}"),
                "-c",
                &format!("user.email={author_email}"),
                "commit",
                "--no-gpg-sign",
                "-m",
                message,
            ],
            None,
        )
        .await
        .map_err(|e| GitError::Commit(e.to_string()))?;

        self.get_head(worktree_path).await
    }

    pub async fn push(
        &self,
        worktree_path: &Path,
        branch: &str,
        ssh_private_key: &str,
    ) -> GitResult<()> {
        let key = ScopedSshKey::write(ssh_private_key).await?;
        let result = Self::run_git(
            Some(worktree_path),
            &[
                "push",
                "origin",
                &format!("HEAD:refs/heads/{branch}"),
            ],
            Some(&key),
        )
        .await;
        drop(key);
        result.map(|_| ()).map_err(|e| GitError::Push(e.to_string()))
    }

    pub async fn get_changed_files(
        &self,
        worktree_path: &Path,
        base_ref: &str,
        compare_ref: Option<&str>,
    ) -> GitResult<Vec<String>> {
        let range = format!("{base_ref}..{}", compare_ref.unwrap_or("HEAD"));
        let out = Self::run_git(Some(worktree_path), &["diff", "--name-only", &range], None)
            .await
            .map_err(|e| GitError::Diff(e.to_string()))?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub async fn get_diff(
        &self,
        worktree_path: &Path,
        base_ref: &str,
        compare_ref: Option<&str>,
        path: Option<&str>,
    ) -> GitResult<String> {
        let range = format!("{base_ref}..{}", compare_ref.unwrap_or("HEAD"));
        let mut args = vec!["diff", range.as_str()];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        Self::run_git(Some(worktree_path), &args, None)
            .await
            .map_err(|e| GitError::Diff(e.to_string()))
    }

    pub async fn get_file_hash(
        &self,
        worktree_path: &Path,
        file_path: &str,
        git_ref: Option<&str>,
    ) -> GitResult<Option<String>> {
        let spec = format!("{}:{file_path}", git_ref.unwrap_or("HEAD"));
        match Self::run_git(Some(worktree_path), &["rev-parse", &spec], None).await {
            Ok(sha) => Ok(Some(sha)),
            Err(_) => Ok(None),
        }
    }

    pub async fn get_file_content(
        &self,
        worktree_path: &Path,
        file_path: &str,
        git_ref: Option<&str>,
    ) -> GitResult<Option<String>> {
        let spec = format!("{}:{file_path}", git_ref.unwrap_or("HEAD"));
        match Self::run_git(Some(worktree_path), &["show", &spec], None).await {
            Ok(content) => Ok(Some(content)),
            Err(_) => Ok(None),
        }
    }

    pub async fn get_head(&self, worktree_path: &Path) -> GitResult<String> {
        Self::run_git(Some(worktree_path), &["rev-parse", "HEAD"], None)
            .await
            .map_err(|e| GitError::Worktree(e.to_string()))
    }

    pub async fn reset_hard(&self, worktree_path: &Path, git_ref: &str) -> GitResult<()> {
        Self::run_git(Some(worktree_path), &["reset", "--hard", git_ref], None)
            .await
            .map_err(|e| GitError::Worktree(e.to_string()))?;
        Ok(())
    }

    pub async fn list_branches(&self, bare_repo_path: &Path) -> GitResult<Vec<String>> {
        let out = Self::run_git(
            Some(bare_repo_path),
            &["branch", "--format=%(refname:short)"],
            None,
        )
        .await
        .map_err(|e| GitError::Worktree(e.to_string()))?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command as TokioCommand;

    async fn init_origin(dir: &Path) {
        TokioCommand::new("git")
            .args(["init", "--initial-branch=main"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        tokio::fs::write(dir.join("README.md"), "hello").await.unwrap();
        TokioCommand::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        TokioCommand::new("git")
            .args([
                "-c",
                "user.name=test",
                "-c",
                "user.email=test@example.com",
                "commit",
                "-m",
                "init",
            ])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clone_worktree_commit_revert_roundtrip() {
        let origin_dir = tempfile::tempdir().unwrap();
        init_origin(origin_dir.path()).await;

        let data_root = tempfile::tempdir().unwrap();
        let runtime = GitRuntime::new(data_root.path().join("repos"));

        let repo_url = origin_dir.path().to_str().unwrap().to_string();
        let bare_path = runtime
            .ensure_bare_clone(&repo_url, "identity1", "unused-in-local-test")
            .await
            .unwrap();
        assert!(bare_path.join("HEAD").exists());

        let worktree_path = data_root.path().join("worktrees").join("s1");
        runtime
            .create_worktree(&bare_path, &worktree_path, "session/s1", "main")
            .await
            .unwrap();

        assert!(!runtime.has_uncommitted_changes(&worktree_path).await.unwrap());

        tokio::fs::write(worktree_path.join("new.txt"), "content")
            .await
            .unwrap();
        assert!(runtime.has_uncommitted_changes(&worktree_path).await.unwrap());

        let sha = runtime
            .commit(&worktree_path, "[snapshot] pre-agent", "agent", "agent@example.com")
            .await
            .unwrap();
        assert_eq!(runtime.get_head(&worktree_path).await.unwrap(), sha);

        tokio::fs::write(worktree_path.join("new.txt"), "changed")
            .await
            .unwrap();
        runtime
            .commit(&worktree_path, "turn 2", "agent", "agent@example.com")
            .await
            .unwrap();

        runtime.reset_hard(&worktree_path, &sha).await.unwrap();
        assert_eq!(runtime.get_head(&worktree_path).await.unwrap(), sha);
    }
}
