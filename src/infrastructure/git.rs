//! Git subprocess client.
//!
//! Every git operation runs as an argument-array subprocess (never a
//! shell), with validated ref names and the `--` separator between options
//! and positional arguments to defeat flag injection. Subprocess calls are
//! bounded by a wall-clock timeout; a timeout is a hard failure for that
//! step.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::errors::{EngineError, EngineResult};

/// Outcome of a rebase.
#[derive(Debug, Clone)]
pub enum RebaseOutcome {
    Clean,
    /// Rebase stopped on conflicting paths; the rebase has been aborted.
    Conflict { files: Vec<String> },
}

/// Captured output of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Argv-array git client with ref validation.
#[derive(Debug, Clone)]
pub struct GitClient {
    timeout: Duration,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl GitClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a git subcommand in `repo`, enforcing the client timeout.
    pub async fn run(&self, repo: &Path, args: &[&str]) -> EngineResult<GitOutput> {
        validate_cwd(repo)?;

        debug!(repo = %repo.display(), args = ?args, "git");

        let child = Command::new("git")
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                EngineError::Git(format!(
                    "git {} timed out after {}s",
                    args.first().unwrap_or(&""),
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| EngineError::Git(format!("failed to spawn git: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            return Err(EngineError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(GitOutput { stdout, stderr })
    }

    /// Like [`run`](Self::run) but returns the failure output instead of an
    /// error, for commands whose non-zero exit is a state signal (rebase).
    async fn run_unchecked(&self, repo: &Path, args: &[&str]) -> EngineResult<(bool, GitOutput)> {
        validate_cwd(repo)?;

        let child = Command::new("git")
            .args(args)
            .current_dir(repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                EngineError::Git(format!(
                    "git {} timed out after {}s",
                    args.first().unwrap_or(&""),
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| EngineError::Git(format!("failed to spawn git: {e}")))?;

        Ok((
            output.status.success(),
            GitOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
        ))
    }

    pub async fn init(&self, repo: &Path) -> EngineResult<()> {
        self.run(repo, &["init", "--initial-branch=main"]).await?;
        Ok(())
    }

    pub async fn rev_parse_head(&self, repo: &Path) -> EngineResult<String> {
        let out = self.run(repo, &["rev-parse", "HEAD"]).await?;
        Ok(out.stdout.trim().to_string())
    }

    pub async fn rev_parse(&self, repo: &Path, refname: &str) -> EngineResult<String> {
        validate_ref(refname)?;
        let out = self.run(repo, &["rev-parse", refname]).await?;
        Ok(out.stdout.trim().to_string())
    }

    /// `git worktree add -b <branch> -- <path> <base>`
    pub async fn worktree_add(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch: &str,
        base: &str,
    ) -> EngineResult<()> {
        validate_ref(branch)?;
        validate_ref(base)?;
        let path = path_arg(worktree_path)?;
        self.run(
            repo,
            &["worktree", "add", "-b", branch, "--", path.as_str(), base],
        )
        .await?;
        Ok(())
    }

    pub async fn worktree_remove(
        &self,
        repo: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> EngineResult<()> {
        let path = path_arg(worktree_path)?;
        let result = if force {
            self.run(repo, &["worktree", "remove", "--force", "--", path.as_str()])
                .await
        } else {
            self.run(repo, &["worktree", "remove", "--", path.as_str()]).await
        };
        if let Err(e) = &result {
            warn!(path = %worktree_path.display(), error = %e, "worktree remove failed");
        }
        result.map(|_| ())
    }

    pub async fn delete_branch(&self, repo: &Path, branch: &str) -> EngineResult<()> {
        validate_ref(branch)?;
        self.run(repo, &["branch", "-D", "--", branch]).await?;
        Ok(())
    }

    /// `git fetch -- <from_repo> <refname>` run inside `worktree`.
    pub async fn fetch(
        &self,
        worktree: &Path,
        from_repo: &Path,
        refname: &str,
    ) -> EngineResult<()> {
        validate_ref(refname)?;
        let from = path_arg(from_repo)?;
        self.run(worktree, &["fetch", "--", from.as_str(), refname]).await?;
        Ok(())
    }

    /// `git rebase <refname>`; on conflict the rebase is aborted and the
    /// conflicting paths returned.
    pub async fn rebase(&self, worktree: &Path, refname: &str) -> EngineResult<RebaseOutcome> {
        validate_ref(refname)?;
        let (ok, _out) = self.run_unchecked(worktree, &["rebase", refname]).await?;
        if ok {
            return Ok(RebaseOutcome::Clean);
        }

        // Collect unmerged paths before aborting.
        let files = self
            .status_porcelain(worktree)
            .await
            .map(|entries| {
                entries
                    .into_iter()
                    .filter(|(code, _)| code.contains('U') || code == "AA" || code == "DD")
                    .map(|(_, path)| path)
                    .collect()
            })
            .unwrap_or_default();

        let (aborted, abort_out) = self
            .run_unchecked(worktree, &["rebase", "--abort"])
            .await?;
        if !aborted {
            warn!(
                stderr = %abort_out.stderr.trim(),
                "rebase --abort failed; worktree may need manual cleanup"
            );
        }

        Ok(RebaseOutcome::Conflict { files })
    }

    /// Fast-forward `repo`'s checked-out branch to `sha`. The only merge
    /// style the engine permits.
    pub async fn merge_ff_only(&self, repo: &Path, sha: &str) -> EngineResult<()> {
        validate_ref(sha)?;
        self.run(repo, &["merge", "--ff-only", "--", sha]).await?;
        Ok(())
    }

    /// Switch `repo` to `refname`. The ref is validated rather than
    /// `--`-separated because `checkout -- <ref>` would treat it as a
    /// pathspec.
    pub async fn switch(&self, repo: &Path, refname: &str) -> EngineResult<()> {
        validate_ref(refname)?;
        self.run(repo, &["checkout", refname]).await?;
        Ok(())
    }

    /// Detach HEAD in a worktree, releasing its branch lock.
    pub async fn detach(&self, worktree: &Path) -> EngineResult<()> {
        self.run(worktree, &["checkout", "--detach"]).await?;
        Ok(())
    }

    pub async fn stash_push(&self, repo: &Path, message: &str) -> EngineResult<()> {
        self.run(repo, &["stash", "push", "-u", "-m", message])
            .await?;
        Ok(())
    }

    pub async fn stash_pop(&self, repo: &Path) -> EngineResult<()> {
        self.run(repo, &["stash", "pop"]).await?;
        Ok(())
    }

    /// `git status --porcelain` parsed into (status code, path) pairs.
    pub async fn status_porcelain(&self, repo: &Path) -> EngineResult<Vec<(String, String)>> {
        let out = self.run(repo, &["status", "--porcelain"]).await?;
        Ok(out
            .stdout
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| {
                let (code, path) = line.split_at(2);
                (code.trim().to_string(), path.trim().to_string())
            })
            .collect())
    }

    /// Subjects of the most recent `n` commits.
    pub async fn log_subjects(&self, repo: &Path, n: usize) -> EngineResult<Vec<String>> {
        let count = n.to_string();
        let out = self
            .run(repo, &["log", "--format=%s", "-n", count.as_str()])
            .await?;
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// Stage everything and commit; returns the new sha.
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> EngineResult<String> {
        self.run(worktree, &["add", "-A"]).await?;
        self.run(worktree, &["commit", "-m", message]).await?;
        self.rev_parse_head(worktree).await
    }

    /// Paths changed on `worktree`'s HEAD relative to `base`.
    pub async fn changed_files(&self, worktree: &Path, base: &str) -> EngineResult<Vec<String>> {
        validate_ref(base)?;
        let range = format!("{base}...HEAD");
        let out = self
            .run(worktree, &["diff", "--name-only", range.as_str()])
            .await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn push(&self, repo: &Path, remote: &str, refname: &str) -> EngineResult<()> {
        validate_ref(remote)?;
        validate_ref(refname)?;
        self.run(repo, &["push", "--", remote, refname]).await?;
        Ok(())
    }
}

/// Validate a ref or sha argument: `[A-Za-z0-9._/-]+`, no `..`, no leading
/// `-`, no `.lock` suffix.
pub fn validate_ref(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::ValidationFailed(
            "Ref name cannot be empty".to_string(),
        ));
    }
    if name.starts_with('-') {
        return Err(EngineError::ValidationFailed(format!(
            "Invalid ref '{name}': must not start with '-'"
        )));
    }
    if name.contains("..") {
        return Err(EngineError::ValidationFailed(format!(
            "Invalid ref '{name}': must not contain '..'"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return Err(EngineError::ValidationFailed(format!(
            "Invalid ref '{name}': only [A-Za-z0-9._/-] permitted"
        )));
    }
    if name.ends_with(".lock") {
        return Err(EngineError::ValidationFailed(format!(
            "Invalid ref '{name}': must not end with '.lock'"
        )));
    }
    Ok(())
}

/// Working directories must exist and be directories.
fn validate_cwd(path: &Path) -> EngineResult<()> {
    if !path.is_dir() {
        return Err(EngineError::ValidationFailed(format!(
            "Not a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Positional path arguments must not look like flags.
fn path_arg(path: &Path) -> EngineResult<String> {
    let s = path.to_string_lossy().to_string();
    if s.starts_with('-') {
        return Err(EngineError::ValidationFailed(format!(
            "Invalid path argument '{s}': must not start with '-'"
        )));
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ref_accepts_valid_names() {
        assert!(validate_ref("main").is_ok());
        assert!(validate_ref("undercity/T1").is_ok());
        assert!(validate_ref("feature/my-feature").is_ok());
        assert!(validate_ref("v2.0.0").is_ok());
        assert!(validate_ref("abc123def456").is_ok());
    }

    #[test]
    fn test_validate_ref_rejects_flag_injection() {
        assert!(validate_ref("-Xours").is_err());
        assert!(validate_ref("--strategy=recursive").is_err());
        assert!(validate_ref("--allow-unrelated-histories").is_err());
    }

    #[test]
    fn test_validate_ref_rejects_double_dot() {
        assert!(validate_ref("main..evil").is_err());
        assert!(validate_ref("a..b").is_err());
    }

    #[test]
    fn test_validate_ref_rejects_disallowed_chars() {
        assert!(validate_ref("branch name").is_err());
        assert!(validate_ref("branch~1").is_err());
        assert!(validate_ref("branch^").is_err());
        assert!(validate_ref("branch:evil").is_err());
        assert!(validate_ref("branch*").is_err());
        assert!(validate_ref("branch\\evil").is_err());
        assert!(validate_ref("").is_err());
    }

    #[test]
    fn test_validate_ref_rejects_lock_suffix() {
        assert!(validate_ref("main.lock").is_err());
    }

    #[test]
    fn test_path_arg_rejects_flags() {
        assert!(path_arg(Path::new("-rf")).is_err());
        assert!(path_arg(Path::new("work/tree")).is_ok());
    }
}
