//! End-to-end grind session tests with the scripted mock agent.

mod common;

use std::sync::Arc;

use common::ScratchRepo;
use undercity::domain::models::{EngineConfig, ModelTier, Task, TaskStatus};
use undercity::infrastructure::agent::{MockAgentClient, MockOutcome};
use undercity::services::grind::GrindSession;

fn config_for(repo: &ScratchRepo) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.repo_path = repo.path().to_path_buf();
    config.state_dir = repo.state_dir();
    config.grind.parallelism = 2;
    config.grind.review_passes = 0;
    config
}

#[tokio::test]
async fn test_single_task_happy_path() {
    // Seed scenario S1: one pending task, one attempt, fast-forward merge,
    // complete status, one metrics record.
    let repo = ScratchRepo::new();
    let base = repo.head();

    let agent = Arc::new(MockAgentClient::new());
    agent
        .script(
            "T1",
            [MockOutcome::success_with_write(
                "helper added",
                "src/util.ts",
                "export const helper = () => 1;\n",
            )],
        )
        .await;

    let session = GrindSession::bootstrap(config_for(&repo), agent)
        .await
        .unwrap();
    session
        .store()
        .add(Task::new("T1", "add helper in src/util.ts").with_priority(500))
        .await
        .unwrap();

    let summary = session.run().await.unwrap();
    assert_eq!(summary.executed, 1);
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.failed, 0);

    // Task complete, main fast-forwarded past the old head.
    let task = session.store().get("T1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Complete);
    assert!(task.completed_at.is_some());
    assert_ne!(repo.head(), base);
    assert!(repo.path().join("src/util.ts").exists());

    // One metrics record with the expected shape.
    let jsonl = std::fs::read_to_string(repo.state_dir().join("metrics.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = jsonl
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["taskId"], "T1");
    assert_eq!(records[0]["success"], true);
    assert!(records[0]["totalTokens"].as_u64().unwrap() > 0);
    assert_eq!(records[0]["finalModel"], "T1");
}

#[tokio::test]
async fn test_disjoint_tasks_merge_in_one_session() {
    let repo = ScratchRepo::new();

    let agent = Arc::new(MockAgentClient::new());
    agent
        .script(
            "T1",
            [MockOutcome::success_with_write("one", "one.txt", "one\n")],
        )
        .await;
    agent
        .script(
            "T2",
            [MockOutcome::success_with_write("two", "two.txt", "two\n")],
        )
        .await;

    let session = GrindSession::bootstrap(config_for(&repo), agent)
        .await
        .unwrap();
    session
        .store()
        .add(Task::new("T1", "write one.txt").with_predicted_files(["one.txt"]))
        .await
        .unwrap();
    session
        .store()
        .add(Task::new("T2", "write two.txt").with_predicted_files(["two.txt"]))
        .await
        .unwrap();

    let summary = session.run().await.unwrap();
    assert_eq!(summary.executed, 2);
    assert_eq!(summary.merged, 2);

    assert!(repo.path().join("one.txt").exists());
    assert!(repo.path().join("two.txt").exists());
    assert_eq!(
        session.store().get("T1").await.unwrap().status,
        TaskStatus::Complete
    );
    assert_eq!(
        session.store().get("T2").await.unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn test_dependency_chain_completes_in_order() {
    let repo = ScratchRepo::new();

    let agent = Arc::new(MockAgentClient::new());
    agent
        .script(
            "T1",
            [MockOutcome::success_with_write("base", "base.txt", "base\n")],
        )
        .await;
    agent
        .script(
            "T2",
            [MockOutcome::success_with_write("top", "top.txt", "top\n")],
        )
        .await;

    let mut config = config_for(&repo);
    config.grind.continuous = false;
    let session = GrindSession::bootstrap(config, agent).await.unwrap();
    session
        .store()
        .add(Task::new("T1", "write base.txt"))
        .await
        .unwrap();
    session
        .store()
        .add(Task::new("T2", "write top.txt").with_dependency("T1"))
        .await
        .unwrap();

    let summary = session.run().await.unwrap();
    assert_eq!(summary.merged, 2);
    assert!(repo.path().join("base.txt").exists());
    assert!(repo.path().join("top.txt").exists());
}

#[tokio::test]
async fn test_failed_task_reports_in_summary() {
    let repo = ScratchRepo::new();

    let agent = Arc::new(MockAgentClient::new());
    agent
        .script("T1", [MockOutcome::error("model refused to cooperate")])
        .await;

    let mut config = config_for(&repo);
    config.grind.max_attempts = 1;
    let session = GrindSession::bootstrap(config, agent).await.unwrap();
    session
        .store()
        .add(Task::new("T1", "doomed task"))
        .await
        .unwrap();

    let summary = session.run().await.unwrap();
    assert_eq!(summary.executed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.merged, 0);

    let task = session.store().get("T1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());
}

#[tokio::test]
async fn test_max_count_stops_the_session() {
    let repo = ScratchRepo::new();

    let agent = Arc::new(MockAgentClient::new());
    for i in 1..=3 {
        agent
            .script(
                &format!("T{i}"),
                [MockOutcome::success_with_write(
                    "done",
                    format!("file{i}.txt"),
                    "x\n",
                )],
            )
            .await;
    }

    let mut config = config_for(&repo);
    config.grind.parallelism = 1;
    config.grind.max_count = Some(1);
    let session = GrindSession::bootstrap(config, agent).await.unwrap();
    for i in 1..=3 {
        session
            .store()
            .add(Task::new(format!("T{i}"), format!("write file{i}.txt")))
            .await
            .unwrap();
    }

    let summary = session.run().await.unwrap();
    assert_eq!(summary.executed, 1);

    let tasks = session.store().list().await;
    let pending = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count();
    assert_eq!(pending, 2);
}

#[tokio::test]
async fn test_recommended_t0_tier_is_used() {
    let repo = ScratchRepo::new();

    let agent = Arc::new(MockAgentClient::new());
    agent
        .script(
            "T1",
            [MockOutcome::success_with_write("done", "t0.txt", "x\n")],
        )
        .await;

    let session = GrindSession::bootstrap(config_for(&repo), agent)
        .await
        .unwrap();
    session
        .store()
        .add(Task::new("T1", "write t0.txt").with_recommended_model(ModelTier::T0))
        .await
        .unwrap();

    session.run().await.unwrap();

    let jsonl = std::fs::read_to_string(repo.state_dir().join("metrics.jsonl")).unwrap();
    let record: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
    assert_eq!(record["finalModel"], "T0");
}
