//! Unit tests for the task mini-language.

use hostfact::tasks::{parse_tasks, Task, TaskRegistry};
use hostfact::CommonConfig;

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

fn parse(values: &[&str]) -> Vec<Task> {
    parse_tasks(&args(values), &TaskRegistry::with_builtins(), &CommonConfig::default())
}

#[test]
fn all_spellings_of_one_task_agree() {
    let expected = Task::new("run", args(&["echo 'hello world!'"])).with_kwarg("use_sudo", "True");

    assert_eq!(parse(&["run", "echo 'hello world!'", "use_sudo=True"]), vec![expected.clone()]);
    assert_eq!(parse(&["run:echo 'hello world!',use_sudo=True"]), vec![expected.clone()]);
    assert_eq!(parse(&["run:echo 'hello world!'", "use_sudo=True"]), vec![expected]);
}

#[test]
fn unknown_first_token_implies_run() {
    assert_eq!(parse(&["uname -a"]), vec![Task::new("run", args(&["uname -a"]))]);
    assert_eq!(
        parse(&["echo 'a:b'"]),
        vec![Task::new("run", args(&["echo 'a:b'"]))]
    );
}

#[test]
fn task_names_start_new_tasks() {
    let tasks = parse(&["push:./dist,/srv/app", "run", "systemctl restart app", "sudo", "uptime"]);
    assert_eq!(
        tasks,
        vec![
            Task::new("push", args(&["./dist", "/srv/app"])),
            Task::new("run", args(&["systemctl restart app"])),
            Task::new("sudo", args(&["uptime"])),
        ]
    );
}

#[test]
fn arithmetic_before_equals_is_an_argument() {
    let tasks = parse(&["run", "test 1 != 2", "x+=1"]);
    assert_eq!(tasks, vec![Task::new("run", args(&["test 1 != 2", "x+=1"]))]);
}

#[test]
fn only_trailing_assignments_become_kwargs() {
    let tasks = parse(&["run", "a=b", "echo hi", "freturn=True", "err_to_out=1"]);
    assert_eq!(
        tasks,
        vec![Task::new("run", args(&["a=b", "echo hi"]))
            .with_kwarg("freturn", "True")
            .with_kwarg("err_to_out", "1")]
    );
}

#[test]
fn kwarg_values_are_trimmed() {
    let tasks = parse(&["sudo", "whoami", "user= www "]);
    assert_eq!(
        tasks,
        vec![Task::new("sudo", args(&["whoami"])).with_kwarg("user", "www")]
    );
}

#[test]
fn custom_delimiters_are_honored() {
    let config = CommonConfig {
        split_function: "/".into(),
        split_args: ";".into(),
        ..CommonConfig::default()
    };
    let tasks = parse_tasks(
        &args(&["pull/logs/app.log;./app.log"]),
        &TaskRegistry::with_builtins(),
        &config,
    );
    assert_eq!(tasks, vec![Task::new("pull", args(&["logs/app.log", "./app.log"]))]);
}

#[test]
fn empty_command_line_has_no_tasks() {
    assert!(parse(&[]).is_empty());
}

#[test]
fn builtins_are_registered() {
    let registry = TaskRegistry::with_builtins();
    let names: Vec<_> = registry.names().collect();
    for name in [
        "check_is_root",
        "get",
        "local",
        "open_shell",
        "pull",
        "push",
        "put",
        "run",
        "run_script",
        "sudo",
    ] {
        assert!(names.contains(&name), "missing built-in {name}");
    }
}
