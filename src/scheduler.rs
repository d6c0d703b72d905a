//! Fan a task list out across targets, and within a target across tasks.
//!
//! Both levels are either sequential or concurrent, chosen independently by
//! [`Concurrency`]. Every unit that runs concurrently gets its own
//! [`Env::snapshot`], so a scope opened by one task never shows up in a
//! sibling.

use futures_util::future::join_all;
use tracing::{debug, error, info};

use crate::env::Env;
use crate::tasks::{Task, TaskRegistry};

/// The two independent concurrency knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Concurrency {
    /// Run the per-target work for all targets at once.
    pub parallel_targets: bool,
    /// Within one target, run all tasks at once.
    pub parallel_tasks: bool,
}

impl Concurrency {
    /// One target after another, one task after another.
    pub const SEQUENTIAL: Self = Self {
        parallel_targets: false,
        parallel_tasks: false,
    };

    /// Everything at once.
    pub const PARALLEL: Self = Self {
        parallel_targets: true,
        parallel_tasks: true,
    };
}

/// A task that returned an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    /// Task name.
    pub task: String,
    /// Error text.
    pub message: String,
}

/// Outcome of the task list on one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetReport {
    /// Connection string of the target.
    pub target: String,
    /// Tasks that finished without error.
    pub completed: usize,
    /// Tasks that returned an error.
    pub failures: Vec<TaskFailure>,
    /// Tasks never started because an earlier sequential task failed.
    pub skipped: usize,
}

impl TargetReport {
    /// Whether every task on this target succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}

/// Outcome of [`run_all`], one entry per target in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Per-target outcomes.
    pub targets: Vec<TargetReport>,
}

impl RunReport {
    /// Whether any target had a failed or skipped task.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.targets.iter().any(|target| !target.succeeded())
    }

    /// Targets with a failed or skipped task.
    pub fn failed_targets(&self) -> impl Iterator<Item = &str> {
        self.targets
            .iter()
            .filter(|target| !target.succeeded())
            .map(|target| target.target.as_str())
    }
}

/// Run `tasks` on every target in `targets`.
///
/// A failing task never stops other targets. With sequential tasks it skips
/// the remaining tasks of its own target.
pub async fn run_all(
    env: &Env,
    registry: &TaskRegistry,
    targets: &[String],
    tasks: &[Task],
    concurrency: Concurrency,
) -> RunReport {
    info!(
        targets = targets.len(),
        tasks = tasks.len(),
        parallel_targets = concurrency.parallel_targets,
        parallel_tasks = concurrency.parallel_tasks,
        "scheduling tasks"
    );

    let reports = if concurrency.parallel_targets {
        debug!("targets will be processed in parallel");
        let units = targets.iter().map(|target| {
            run_target(env.snapshot(), registry, target, tasks, concurrency.parallel_tasks)
        });
        join_all(units).await
    } else {
        debug!("targets will be processed one by one");
        let mut reports = Vec::with_capacity(targets.len());
        for target in targets {
            reports.push(
                run_target(env.snapshot(), registry, target, tasks, concurrency.parallel_tasks).await,
            );
        }
        reports
    };

    RunReport { targets: reports }
}

/// Open a target scope on `env` and run the task list inside it.
async fn run_target(
    mut env: Env,
    registry: &TaskRegistry,
    target: &str,
    tasks: &[Task],
    parallel_tasks: bool,
) -> TargetReport {
    let scope = env.scoped_target(target, "").await;
    let mut report = TargetReport {
        target: target.to_owned(),
        ..TargetReport::default()
    };

    if parallel_tasks {
        tokio::task::yield_now().await;
        let units = tasks.iter().map(|task| {
            let unit_env = scope.snapshot();
            async move { (task, registry.invoke(unit_env, task).await) }
        });
        for (task, outcome) in join_all(units).await {
            match outcome {
                Ok(()) => report.completed += 1,
                Err(err) => {
                    error!(host = target, task = %task.name, %err, "task failed");
                    report.failures.push(TaskFailure {
                        task: task.name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
    } else {
        for (index, task) in tasks.iter().enumerate() {
            debug!(host = target, task = %task.name, "running task");
            if let Err(err) = registry.invoke(scope.snapshot(), task).await {
                error!(host = target, task = %task.name, %err, "task failed, skipping the rest");
                report.failures.push(TaskFailure {
                    task: task.name.clone(),
                    message: err.to_string(),
                });
                report.skipped = tasks.len() - index - 1;
                break;
            }
            report.completed += 1;
        }
    }

    info!(
        host = target,
        completed = report.completed,
        failed = report.failures.len(),
        skipped = report.skipped,
        "target finished"
    );
    report
}
