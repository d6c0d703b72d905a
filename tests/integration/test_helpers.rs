//! Shared helpers for integration tests that spawn real processes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hostfact::console::{Channel, MemoryConsole};
use hostfact::{CommonConfig, Env};

/// User every test target logs in as.
pub const TEST_USER: &str = "tester";

/// Configuration with a fixed user and no console echo.
pub fn test_config() -> CommonConfig {
    CommonConfig {
        user: TEST_USER.into(),
        interactive: false,
        ..CommonConfig::default()
    }
}

/// Non-interactive environment writing to a throwaway console.
pub fn quiet_env() -> Env {
    Env::new(test_config()).with_console(Arc::new(MemoryConsole::new()))
}

/// Interactive environment echoing into `console`.
pub fn interactive_env(console: &Arc<MemoryConsole>) -> Env {
    let config = CommonConfig {
        interactive: true,
        ..test_config()
    };
    Env::new(config).with_console(console.clone())
}

/// Lines the console received on stdout, in order.
pub fn out_lines(console: &MemoryConsole) -> Vec<String> {
    console
        .lines()
        .into_iter()
        .filter(|(channel, _)| *channel == Channel::Out)
        .map(|(_, line)| line)
        .collect()
}

/// Write an executable shell script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut permissions = std::fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).unwrap();
    path
}
