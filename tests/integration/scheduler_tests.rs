//! Integration tests for the scheduler: ordering, isolation and failures.

use std::sync::{Arc, Mutex};

use hostfact::console::MemoryConsole;
use hostfact::env::Overrides;
use hostfact::operations::{run, RunOptions};
use hostfact::scheduler::{run_all, Concurrency};
use hostfact::tasks::{Kwargs, Task, TaskRegistry};
use hostfact::AppError;

use super::test_helpers::{interactive_env, out_lines, quiet_env};

fn targets(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_owned()).collect()
}

fn run_task(command: &str) -> Task {
    Task::new("run", vec![command.to_owned()])
}

#[tokio::test]
async fn parallel_tasks_interleave_on_one_target() {
    let console = Arc::new(MemoryConsole::new());
    let env = interactive_env(&console);
    let registry = TaskRegistry::with_builtins();
    let tasks = vec![run_task("sleep 1; echo B"), run_task("echo A")];

    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost"]),
        &tasks,
        Concurrency::PARALLEL,
    )
    .await;

    assert!(!report.failed());
    let outputs: Vec<_> = out_lines(&console)
        .into_iter()
        .filter(|line| line.contains(" out: "))
        .collect();
    assert_eq!(
        outputs,
        vec!["tester@localhost out: A", "tester@localhost out: B"]
    );
}

#[tokio::test]
async fn sequential_tasks_keep_their_order() {
    let console = Arc::new(MemoryConsole::new());
    let env = interactive_env(&console);
    let registry = TaskRegistry::with_builtins();
    let tasks = vec![run_task("sleep 0.3; echo B"), run_task("echo A")];

    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost"]),
        &tasks,
        Concurrency::SEQUENTIAL,
    )
    .await;

    assert_eq!(report.targets[0].completed, 2);
    let outputs: Vec<_> = out_lines(&console)
        .into_iter()
        .filter(|line| line.contains(" out: "))
        .collect();
    assert_eq!(
        outputs,
        vec!["tester@localhost out: B", "tester@localhost out: A"]
    );
}

fn output_lines(console: &MemoryConsole) -> Vec<String> {
    out_lines(console)
        .into_iter()
        .filter(|line| line.contains(" out: "))
        .collect()
}

#[tokio::test]
async fn parallel_targets_keep_task_order_per_target() {
    let console = Arc::new(MemoryConsole::new());
    let env = interactive_env(&console);
    let registry = TaskRegistry::with_builtins();
    let tasks = vec![run_task("sleep 0.5; echo first"), run_task("echo second")];

    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost", "127.0.0.1"]),
        &tasks,
        Concurrency {
            parallel_targets: true,
            parallel_tasks: false,
        },
    )
    .await;

    assert!(!report.failed());
    let mut outputs = output_lines(&console);
    assert_eq!(outputs.len(), 4);
    let mut seconds = outputs.split_off(2);
    outputs.sort();
    seconds.sort();
    assert_eq!(
        outputs,
        vec!["tester@127.0.0.1 out: first", "tester@localhost out: first"]
    );
    assert_eq!(
        seconds,
        vec!["tester@127.0.0.1 out: second", "tester@localhost out: second"]
    );
}

#[tokio::test]
async fn sequential_targets_with_parallel_tasks_finish_one_target_first() {
    let console = Arc::new(MemoryConsole::new());
    let env = interactive_env(&console);
    let registry = TaskRegistry::with_builtins();
    let tasks = vec![run_task("sleep 0.5; echo B"), run_task("echo A")];

    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost", "127.0.0.1"]),
        &tasks,
        Concurrency {
            parallel_targets: false,
            parallel_tasks: true,
        },
    )
    .await;

    assert!(!report.failed());
    assert_eq!(
        output_lines(&console),
        vec![
            "tester@localhost out: A",
            "tester@localhost out: B",
            "tester@127.0.0.1 out: A",
            "tester@127.0.0.1 out: B",
        ]
    );
}

#[tokio::test]
async fn every_target_runs_the_task_list() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = TaskRegistry::new();
    let record = Arc::clone(&seen);
    registry.register("record", move |env, _args, _kwargs| {
        let record = Arc::clone(&record);
        async move {
            let host = env.connection()?.host.clone();
            record.lock().unwrap().push(host);
            Ok(())
        }
    });

    let env = quiet_env();
    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost", "127.0.0.1"]),
        &[Task::new("record", vec![])],
        Concurrency::PARALLEL,
    )
    .await;

    assert_eq!(report.targets.len(), 2);
    assert_eq!(report.targets[0].target, "localhost");
    assert_eq!(report.targets[1].target, "127.0.0.1");
    let mut hosts = seen.lock().unwrap().clone();
    hosts.sort();
    assert_eq!(hosts, vec!["127.0.0.1", "localhost"]);
}

#[tokio::test]
async fn unknown_task_falls_back_to_run() {
    let calls: Arc<Mutex<Vec<(Vec<String>, Kwargs)>>> = Arc::default();
    let mut registry = TaskRegistry::new();
    let record = Arc::clone(&calls);
    registry.register("run", move |_env, args, kwargs| {
        let record = Arc::clone(&record);
        async move {
            record.lock().unwrap().push((args, kwargs));
            Ok(())
        }
    });

    let env = quiet_env();
    let task = Task::new("uname", vec!["-a".into()]).with_kwarg("freturn", "True");
    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost"]),
        &[task],
        Concurrency::SEQUENTIAL,
    )
    .await;

    assert!(!report.failed());
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, vec!["uname -a".to_owned()]);
    assert_eq!(calls[0].1.get("freturn").map(String::as_str), Some("True"));
}

#[tokio::test]
async fn sequential_failure_skips_the_rest_of_its_target_only() {
    let mut registry = TaskRegistry::new();
    registry.register("ok", |_env, _args, _kwargs| async { Ok(()) });
    registry.register("fail", |_env, _args, _kwargs| async {
        Err(AppError::Task("deliberate".into()))
    });

    let env = quiet_env();
    let tasks = vec![
        Task::new("ok", vec![]),
        Task::new("fail", vec![]),
        Task::new("ok", vec![]),
        Task::new("ok", vec![]),
    ];
    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost", "127.0.0.1"]),
        &tasks,
        Concurrency::SEQUENTIAL,
    )
    .await;

    assert!(report.failed());
    for target in &report.targets {
        assert_eq!(target.completed, 1);
        assert_eq!(target.skipped, 2);
        assert_eq!(target.failures.len(), 1);
        assert_eq!(target.failures[0].task, "fail");
        assert!(target.failures[0].message.contains("deliberate"));
    }
    assert_eq!(
        report.failed_targets().collect::<Vec<_>>(),
        vec!["localhost", "127.0.0.1"]
    );
}

#[tokio::test]
async fn parallel_failure_does_not_stop_siblings() {
    let mut registry = TaskRegistry::new();
    registry.register("ok", |_env, _args, _kwargs| async { Ok(()) });
    registry.register("fail", |_env, _args, _kwargs| async {
        Err(AppError::Task("deliberate".into()))
    });

    let env = quiet_env();
    let tasks = vec![
        Task::new("fail", vec![]),
        Task::new("ok", vec![]),
        Task::new("ok", vec![]),
    ];
    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost"]),
        &tasks,
        Concurrency::PARALLEL,
    )
    .await;

    let target = &report.targets[0];
    assert_eq!(target.completed, 2);
    assert_eq!(target.skipped, 0);
    assert_eq!(target.failures.len(), 1);
}

#[tokio::test]
async fn scopes_opened_by_one_task_stay_out_of_siblings() {
    let seen: Arc<Mutex<Vec<bool>>> = Arc::default();
    let mut registry = TaskRegistry::new();
    registry.register("quiet", |mut env, _args, _kwargs| async move {
        let scope = env.scoped(Overrides::quiet().set("marker", "quiet"))?;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!scope.common.interactive);
        Ok(())
    });
    let record = Arc::clone(&seen);
    registry.register("observe", move |env, _args, _kwargs| {
        let record = Arc::clone(&record);
        async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            record
                .lock()
                .unwrap()
                .push(env.common.interactive && !env.common.extra.contains_key("marker"));
            Ok(())
        }
    });

    let console = Arc::new(MemoryConsole::new());
    let env = interactive_env(&console);
    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost"]),
        &[Task::new("quiet", vec![]), Task::new("observe", vec![])],
        Concurrency::PARALLEL,
    )
    .await;

    assert!(!report.failed());
    assert_eq!(*seen.lock().unwrap(), vec![true]);
    assert!(env.common.interactive);
    assert_eq!(env.depth(), 0);
}

#[tokio::test]
async fn tasks_see_their_target_scope() {
    let mut registry = TaskRegistry::new();
    registry.register("echo_host", |env, _args, _kwargs| async move {
        let output = run(&env, "echo $((40 + 2))", &RunOptions::default()).await?;
        if output.stdout() == "42\n" {
            Ok(())
        } else {
            Err(AppError::Task(format!("unexpected output {:?}", output.stdout())))
        }
    });

    let env = quiet_env();
    let report = run_all(
        &env,
        &registry,
        &targets(&["localhost"]),
        &[Task::new("echo_host", vec![])],
        Concurrency::SEQUENTIAL,
    )
    .await;
    assert!(!report.failed(), "{report:?}");
}
