//! Property tests for batch compatibility and the opus budget.

use proptest::prelude::*;

use undercity::domain::models::{ModelTier, Task, TaskStatus};
use undercity::services::governor::GovernorVerdict;
use undercity::services::scheduler::{
    predicted_footprint, OpusBudget, Scheduler, SchedulerConfig,
};

fn arb_task(index: usize) -> impl Strategy<Value = Task> {
    let files = prop::collection::vec(
        prop::sample::select(vec![
            "src/app.ts",
            "src/util.ts",
            "src/http/router.ts",
            "docs/readme.md",
            "lib/core.rs",
            "web/index.html",
        ]),
        0..3,
    );
    let deps = prop::collection::vec(0..20usize, 0..2);
    (files, deps, 1..1000u32).prop_map(move |(files, deps, priority)| {
        let mut task = Task::new(format!("T{index}"), format!("work on item {index}"))
            .with_priority(priority)
            .with_predicted_files(files.iter().map(|f| (*f).to_string()));
        for dep in deps {
            if dep != index {
                task = task.with_dependency(format!("T{dep}"));
            }
        }
        task
    })
}

fn arb_backlog() -> impl Strategy<Value = Vec<Task>> {
    prop::collection::vec(prop::bool::ANY, 8..20).prop_flat_map(|complete_flags| {
        let strategies: Vec<_> = complete_flags
            .iter()
            .enumerate()
            .map(|(i, complete)| {
                let complete = *complete;
                arb_task(i).prop_map(move |mut task| {
                    if complete {
                        task.status = TaskStatus::Complete;
                    }
                    task
                })
            })
            .collect();
        strategies
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property 9: no two batch members share predicted files, and every
    /// member's dependencies are complete.
    #[test]
    fn batch_members_are_compatible(tasks in arb_backlog()) {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_concurrent: 4,
            starting_tier: ModelTier::T1,
        });
        let budget = OpusBudget::new(10.0);
        let batch = scheduler.select_batch(&tasks, &GovernorVerdict::Ok, &budget);

        prop_assert!(batch.len() <= 4);

        // Pairwise disjoint predicted footprints.
        for (i, (a, _)) in batch.iter().enumerate() {
            for (b, _) in batch.iter().skip(i + 1) {
                let fa = predicted_footprint(a);
                let fb = predicted_footprint(b);
                prop_assert!(
                    fa.is_disjoint(&fb),
                    "tasks {} and {} share predicted files",
                    a.id,
                    b.id
                );
            }
        }

        // All dependencies complete.
        for (task, _) in &batch {
            if let Some(deps) = &task.depends_on {
                for dep in deps {
                    let dep_task = tasks.iter().find(|t| t.id == *dep);
                    prop_assert!(
                        dep_task.is_some_and(|t| t.status == TaskStatus::Complete),
                        "task {} scheduled with incomplete dependency {}",
                        task.id,
                        dep
                    );
                }
            }
        }
    }

    /// Property 8: the T2 share never exceeds budget + 1/T over a session.
    #[test]
    fn opus_share_stays_within_budget(total in 10..60u32, percent in 1.0..30.0f64) {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_concurrent: 1,
            starting_tier: ModelTier::T1,
        });
        let budget = OpusBudget::new(percent);
        let mut t2_count = 0u32;

        for i in 0..total {
            let task = Task::new(format!("T{i}"), format!("independent item {i}"))
                .with_recommended_model(ModelTier::T2);
            let batch = scheduler.select_batch(&[task], &GovernorVerdict::Ok, &budget);
            prop_assert_eq!(batch.len(), 1);
            let tier = batch[0].1;
            if tier == ModelTier::T2 {
                t2_count += 1;
            }
            budget.record_dispatch(tier);
        }

        let share = f64::from(t2_count) / f64::from(total);
        prop_assert!(
            share <= percent / 100.0 + 1.0 / f64::from(total) + 1e-9,
            "share {} exceeded budget {}%",
            share,
            percent
        );
    }
}
