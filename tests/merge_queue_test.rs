//! Merge queue integration tests against real git repositories.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{git_stdout, ScratchRepo};
use undercity::domain::models::MergeItemStatus;
use undercity::infrastructure::git::GitClient;
use undercity::services::merge_queue::{MergeQueue, MergeQueueConfig};
use undercity::services::verify::Verifier;

fn queue_for(repo: &ScratchRepo) -> MergeQueue {
    MergeQueue::new(
        Arc::new(GitClient::default()),
        Verifier::new(vec![], Duration::from_secs(30)),
        MergeQueueConfig {
            repo_path: repo.path().to_path_buf(),
            state_dir: repo.state_dir(),
            main_branch: "main".to_string(),
            max_retries: 3,
            max_merge_fix_attempts: 2,
        },
    )
}

#[tokio::test]
async fn test_clean_branch_fast_forwards_main() {
    let repo = ScratchRepo::new();
    let base = repo.head();
    let branch = repo.branch_with_change("T1", "feature.txt", "feature content\n");
    let queue = queue_for(&repo);

    queue
        .enqueue(&branch, "T1", "w1", vec!["feature.txt".to_string()])
        .await
        .unwrap();

    let item = queue.process_next().await.unwrap().unwrap();
    assert_eq!(item.status, MergeItemStatus::Complete);
    let merged_sha = item.merged_sha.unwrap();

    // Main advanced to exactly the branch head, fast-forward only.
    let head = repo.head();
    assert_eq!(head, merged_sha);
    assert_ne!(head, base);
    assert!(repo.path().join("feature.txt").exists());

    // Merge monotonicity: the old main sha is an ancestor of the new one.
    let merge_base = git_stdout(repo.path(), &["merge-base", &base, "HEAD"]);
    assert_eq!(merge_base, base);
}

#[tokio::test]
async fn test_conflicting_branch_is_marked_conflict() {
    // Seed scenario S4: two branches touch the same file, first one in
    // wins, the second conflicts on rebase and never fast-forwards.
    let repo = ScratchRepo::new();
    let branch1 = repo.branch_with_change("T1", "src_app.txt", "version one\n");
    let branch2 = repo.branch_with_change("T2", "src_app.txt", "version two\n");
    let queue = queue_for(&repo);

    queue
        .enqueue(&branch1, "T1", "w1", vec!["src_app.txt".to_string()])
        .await
        .unwrap();
    queue
        .enqueue(&branch2, "T2", "w2", vec!["src_app.txt".to_string()])
        .await
        .unwrap();

    // Pre-merge prediction sees the overlap.
    let predicted = queue.detect_queue_conflicts().await;
    assert_eq!(predicted.len(), 1);
    assert_eq!(predicted[0].overlapping_files, vec!["src_app.txt".to_string()]);

    let first = queue.process_next().await.unwrap().unwrap();
    assert_eq!(first.status, MergeItemStatus::Complete);
    let main_after_first = repo.head();

    let second = queue.process_next().await.unwrap().unwrap();
    assert_eq!(second.status, MergeItemStatus::Conflict);
    assert_eq!(second.retry_count, 1);
    assert!(second
        .last_error
        .as_deref()
        .unwrap()
        .contains("src_app.txt"));

    // No fast-forward happened for the conflicted branch.
    assert_eq!(repo.head(), main_after_first);
    assert_eq!(
        std::fs::read_to_string(repo.path().join("src_app.txt")).unwrap(),
        "version one\n"
    );

    // Main did not advance again, so nothing is processable.
    assert!(queue.process_next().await.unwrap().is_none());
    let stalled = queue.fail_stalled_conflicts().await;
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].task_id, "T2");
}

#[tokio::test]
async fn test_disjoint_branch_rebases_cleanly_after_main_advances() {
    // Invariant 4: a branch whose files do not intersect main's changes
    // since its base always rebases cleanly.
    let repo = ScratchRepo::new();
    let branch1 = repo.branch_with_change("T1", "one.txt", "one\n");
    let branch2 = repo.branch_with_change("T2", "two.txt", "two\n");
    let queue = queue_for(&repo);

    queue
        .enqueue(&branch1, "T1", "w1", vec!["one.txt".to_string()])
        .await
        .unwrap();
    queue
        .enqueue(&branch2, "T2", "w2", vec!["two.txt".to_string()])
        .await
        .unwrap();

    let first = queue.process_next().await.unwrap().unwrap();
    assert_eq!(first.status, MergeItemStatus::Complete);

    // T2's base is now behind main; the rebase must still be clean.
    let second = queue.process_next().await.unwrap().unwrap();
    assert_eq!(second.status, MergeItemStatus::Complete);

    assert!(repo.path().join("one.txt").exists());
    assert!(repo.path().join("two.txt").exists());
    assert_eq!(queue.history().await.len(), 2);
}

#[tokio::test]
async fn test_conflict_retries_after_main_advances() {
    let repo = ScratchRepo::new();
    let branch1 = repo.branch_with_change("T1", "shared.txt", "one\n");
    let branch2 = repo.branch_with_change("T2", "shared.txt", "two\n");
    let branch3 = repo.branch_with_change("T3", "other.txt", "three\n");
    let queue = queue_for(&repo);

    for (branch, task, file) in [
        (&branch1, "T1", "shared.txt"),
        (&branch2, "T2", "shared.txt"),
        (&branch3, "T3", "other.txt"),
    ] {
        queue
            .enqueue(branch, task, "w", vec![file.to_string()])
            .await
            .unwrap();
    }

    // T1 merges, T2 conflicts and waits, T3 merges — which re-arms T2.
    assert_eq!(
        queue.process_next().await.unwrap().unwrap().status,
        MergeItemStatus::Complete
    );
    assert_eq!(
        queue.process_next().await.unwrap().unwrap().status,
        MergeItemStatus::Conflict
    );
    assert_eq!(
        queue.process_next().await.unwrap().unwrap().status,
        MergeItemStatus::Complete
    );

    // The retry conflicts again (the same overlapping change).
    let retried = queue.process_next().await.unwrap().unwrap();
    assert_eq!(retried.task_id, "T2");
    assert_eq!(retried.status, MergeItemStatus::Conflict);
    assert_eq!(retried.retry_count, 2);
}

#[tokio::test]
async fn test_failing_verification_marks_test_failed() {
    let repo = ScratchRepo::new();
    let branch = repo.branch_with_change("T1", "broken.txt", "broken\n");

    let queue = MergeQueue::new(
        Arc::new(GitClient::default()),
        Verifier::new(vec!["false".to_string()], Duration::from_secs(30)),
        MergeQueueConfig {
            repo_path: repo.path().to_path_buf(),
            state_dir: repo.state_dir(),
            ..MergeQueueConfig::default()
        },
    );

    let base = repo.head();
    queue
        .enqueue(&branch, "T1", "w1", vec!["broken.txt".to_string()])
        .await
        .unwrap();

    let item = queue.process_next().await.unwrap().unwrap();
    assert_eq!(item.status, MergeItemStatus::TestFailed);
    assert_eq!(queue.get_failed().await.len(), 1);
    // Main untouched.
    assert_eq!(repo.head(), base);

    queue.clear_failed().await;
    assert!(queue.get_failed().await.is_empty());
}
