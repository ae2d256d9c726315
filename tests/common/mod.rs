//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// A scratch git repository with one commit on `main` and a gitignored
/// `.undercity/` state directory.
pub struct ScratchRepo {
    pub dir: TempDir,
}

impl ScratchRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path();

        git(path, &["init", "--initial-branch=main"]);
        git(path, &["config", "user.email", "tests@example.com"]);
        git(path, &["config", "user.name", "Tests"]);
        // Worktree setups inherit the repo config, but commits made by the
        // engine run with the repo as cwd, so this is enough.
        std::fs::write(path.join(".gitignore"), ".undercity/\n").unwrap();
        std::fs::write(path.join("README.md"), "# scratch\n").unwrap();
        git(path, &["add", "-A"]);
        git(path, &["commit", "-m", "initial commit"]);

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join(".undercity")
    }

    pub fn head(&self) -> String {
        git_stdout(self.path(), &["rev-parse", "HEAD"])
    }

    pub fn commit_file(&self, file: &str, content: &str, message: &str) -> String {
        std::fs::write(self.path().join(file), content).unwrap();
        git(self.path(), &["add", "-A"]);
        git(self.path(), &["commit", "-m", message]);
        self.head()
    }

    /// Create a branch from main with one committed file change, via a
    /// temporary worktree at the engine's conventional path.
    pub fn branch_with_change(&self, task_id: &str, file: &str, content: &str) -> String {
        let branch = format!("undercity/{task_id}");
        let worktree = self.state_dir().join("worktrees").join(format!("task-{task_id}"));
        std::fs::create_dir_all(worktree.parent().unwrap()).unwrap();

        git(
            self.path(),
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                worktree.to_str().unwrap(),
                "main",
            ],
        );
        std::fs::write(worktree.join(file), content).unwrap();
        git(&worktree, &["add", "-A"]);
        git(&worktree, &["commit", "-m", &format!("{task_id}: change {file}")]);
        branch
    }
}

pub fn git(cwd: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .status()
        .expect("spawn git");
    assert!(status.success(), "git {args:?} failed in {}", cwd.display());
}

pub fn git_stdout(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}
