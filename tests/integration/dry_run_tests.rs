//! Integration tests for dry-run mode.

use std::fs;
use std::sync::Arc;

use hostfact::console::{Channel, MemoryConsole};
use hostfact::operations::{push, run, run_script, RunOptions, STATUS_NOT_FOUND};
use hostfact::{CommonConfig, Env};

use super::test_helpers::{out_lines, test_config, TEST_USER};

fn dry_env(console: &Arc<MemoryConsole>) -> Env {
    let config = CommonConfig {
        dry_run: true,
        interactive: true,
        which_binary: "command -v".into(),
        ..test_config()
    };
    Env::new(config).with_console(console.clone())
}

#[tokio::test]
async fn dry_run_looks_up_binaries_instead_of_running() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("created");
    let console = Arc::new(MemoryConsole::new());
    let mut env = dry_env(&console);
    let scope = env.scoped_target("localhost", "").await;

    let command = format!("touch {}", marker.display());
    let returned = run(&scope, &command, &RunOptions::full()).await.unwrap();

    assert!(!marker.exists());
    assert_eq!(returned.status(), Some(0));
    assert!(returned.stdout().contains("touch"));

    let name = format!("{TEST_USER}@localhost");
    let lines = out_lines(&console);
    assert_eq!(lines[0], format!("{name} dry-in: {command}"));
    assert_eq!(lines[1], format!("{name} in: command -v touch; "));
}

#[tokio::test]
async fn dry_run_reports_missing_binaries_through_the_status() {
    let console = Arc::new(MemoryConsole::new());
    let mut env = dry_env(&console);
    let scope = env.scoped_target("localhost", "").await;

    let returned = run(&scope, "no_such_binary_here --flag", &RunOptions::full())
        .await
        .unwrap();

    assert_ne!(returned.status(), Some(0));
}

#[tokio::test]
async fn dry_run_logs_the_shaped_command() {
    let console = Arc::new(MemoryConsole::new());
    let mut env = dry_env(&console);
    let scope = env.scoped_target("localhost", "").await;
    let options = RunOptions {
        user: "www-data".into(),
        ..RunOptions::default()
    };

    run(&scope, "ls /srv", &options).await.unwrap();

    let lines = out_lines(&console);
    assert!(lines[0].ends_with("dry-in: sudo -S -u www-data -s ls /srv"), "{lines:?}");
    assert!(lines[1].ends_with("in: command -v sudo; command -v ls; "), "{lines:?}");
    assert_eq!(console.text(Channel::Err), "");
}

#[tokio::test]
async fn dry_push_of_missing_source_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("missing.tar");
    let console = Arc::new(MemoryConsole::new());
    let mut env = dry_env(&console);
    let scope = env.scoped_target("localhost", "").await;

    let status = push(&scope, src.to_str().unwrap(), dir.path().to_str().unwrap())
        .await
        .unwrap();

    assert_eq!(status, STATUS_NOT_FOUND);
    let lines = out_lines(&console);
    assert!(lines
        .iter()
        .any(|line| line.ends_with(&format!("dry-out: path '{}' is not exists", src.display()))));
    assert!(lines
        .iter()
        .any(|line| line.ends_with(&format!("dry-out: directory '{}' is exists", dir.path().display()))));
}

#[tokio::test]
async fn dry_push_of_existing_file_copies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("app.tar");
    fs::write(&src, "payload").unwrap();
    let dst = dir.path().join("copy.tar");
    let console = Arc::new(MemoryConsole::new());
    let mut env = dry_env(&console);
    let scope = env.scoped_target("localhost", "").await;

    let status = push(&scope, src.to_str().unwrap(), dst.to_str().unwrap())
        .await
        .unwrap();

    assert_eq!(status, 0);
    assert!(!dst.exists());
    assert!(out_lines(&console)
        .iter()
        .any(|line| line.ends_with(&format!("dry-out: file '{}' is exists", src.display()))));
}

#[tokio::test]
async fn dry_script_run_with_missing_file_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("deploy.sh");
    let console = Arc::new(MemoryConsole::new());
    let mut env = dry_env(&console);
    let scope = env.scoped_target("localhost", "").await;

    let returned = run_script(&scope, script.to_str().unwrap(), None, &RunOptions::full())
        .await
        .unwrap();

    assert_eq!(returned.status(), Some(STATUS_NOT_FOUND));
    assert!(out_lines(&console)
        .iter()
        .any(|line| line.ends_with(&format!("dry-out: path '{}' is not exists", script.display()))));
}
