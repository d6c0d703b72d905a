//! Integration tests for forwarding operator input to running commands.

use std::sync::Arc;
use std::time::Duration;

use hostfact::console::MemoryConsole;
use hostfact::operations::{run, RunOptions};
use hostfact::stdin_queue::{self, StdinQueue};
use tokio_util::sync::CancellationToken;

use super::test_helpers::interactive_env;

#[tokio::test]
async fn one_input_line_reaches_every_live_session() {
    let console = Arc::new(MemoryConsole::new());
    let queue = StdinQueue::new();
    let mut env = interactive_env(&console).with_stdin(queue.clone());
    let scope = env.scoped_target("localhost", "").await;

    let options = RunOptions::default();
    let (first, second, ()) = tokio::join!(
        run(&scope, "head -n1", &options),
        run(&scope, "head -n1", &options),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            queue.append("hello\n");
        },
    );

    assert_eq!(first.unwrap().stdout(), "hello\n");
    assert_eq!(second.unwrap().stdout(), "hello\n");
}

#[tokio::test]
async fn new_session_replays_input_typed_before_it_started() {
    let console = Arc::new(MemoryConsole::new());
    let queue = StdinQueue::new();
    queue.append("early\n");
    let mut env = interactive_env(&console).with_stdin(queue.clone());
    let scope = env.scoped_target("localhost", "").await;

    let options = RunOptions::default();
    let (returned, ()) = tokio::join!(
        run(&scope, "head -n2", &options),
        async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            queue.append("late\n");
        },
    );

    assert_eq!(returned.unwrap().stdout(), "early\nlate\n");
}

#[tokio::test]
async fn initial_input_comes_before_operator_input() {
    let console = Arc::new(MemoryConsole::new());
    let queue = StdinQueue::new();
    queue.append("typed\n");
    let mut env = interactive_env(&console).with_stdin(queue.clone());
    let scope = env.scoped_target("localhost", "").await;
    let options = RunOptions {
        input: vec!["scripted".into()],
        ..RunOptions::default()
    };

    let returned = run(&scope, "head -n2", &options).await.unwrap();
    assert_eq!(returned.stdout(), "scripted\ntyped\n");
}

#[tokio::test]
async fn reader_feeds_sessions_from_an_input_stream() {
    let console = Arc::new(MemoryConsole::new());
    let queue = StdinQueue::new();
    let mut env = interactive_env(&console).with_stdin(queue.clone());
    let scope = env.scoped_target("localhost", "").await;

    let (mut writer, reader) = tokio::io::duplex(64);
    let cancel = CancellationToken::new();
    let handle = stdin_queue::spawn_reader(queue.clone(), reader, false, cancel.clone());

    let options = RunOptions::default();
    let (returned, ()) = tokio::join!(
        run(&scope, "read answer; echo \"answer=$answer\"", &options),
        async {
            use tokio::io::AsyncWriteExt;
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.write_all(b"yes\n").await.unwrap();
        },
    );

    assert_eq!(returned.unwrap().stdout(), "answer=yes\n");
    assert_eq!(queue.len(), 1);
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn finished_command_ignores_later_input() {
    let console = Arc::new(MemoryConsole::new());
    let queue = StdinQueue::new();
    let mut env = interactive_env(&console).with_stdin(queue.clone());
    let scope = env.scoped_target("localhost", "").await;

    let returned = run(&scope, "echo done", &RunOptions::full()).await.unwrap();
    queue.append("too late\n");

    assert_eq!(returned.status(), Some(0));
    assert_eq!(returned.stdout(), "done\n");
}
