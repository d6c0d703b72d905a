//! Privilege prefixes for command strings (`sudo`, `-u user`, `-g group`).

/// Byte offset just past the first standalone `sudo` token of `command`.
///
/// Tokens are separated by any whitespace, tabs included.
fn sudo_token_end(command: &str) -> Option<usize> {
    let mut token_start = None;
    let ends = command.char_indices().chain(std::iter::once((command.len(), ' ')));
    for (at, ch) in ends {
        if ch.is_whitespace() {
            if let Some(start) = token_start.take() {
                if &command[start..at] == "sudo" {
                    return Some(at);
                }
            }
        } else if token_start.is_none() {
            token_start = Some(at);
        }
    }
    None
}

/// Whether `command` already contains a standalone `sudo` token.
fn has_sudo(command: &str) -> bool {
    sudo_token_end(command).is_some()
}

/// Insert `flag value` right after the first `sudo` token of `command`, or
/// prefix a fresh sudo invocation when there is none.
fn extend_sudo(command: &str, flag: &str, value: &str) -> String {
    match sudo_token_end(command) {
        Some(at) => format!("{} {flag} {value}{}", &command[..at], &command[at..]),
        None => format!("sudo -S {flag} {value} -s {command}"),
    }
}

/// Rewrite `command` to run with the requested privileges.
///
/// - `use_sudo` prefixes `sudo -S` unless the session is already
///   privileged or the command already invokes sudo.
/// - `user` / `group` either prefix `sudo -S -u <user> -s` (`-g <group>`)
///   or extend the sudo invocation already present.
///
/// With `use_sudo == false` and empty `user` and `group` the command is
/// returned unchanged.
#[must_use]
pub fn shape(command: &str, use_sudo: bool, user: &str, group: &str, is_root: bool) -> String {
    let mut command = command.to_owned();

    if use_sudo && !is_root && !has_sudo(&command) {
        command = format!("sudo -S {command}");
    }

    if !user.is_empty() {
        command = extend_sudo(&command, "-u", user);
    }

    if !group.is_empty() {
        command = extend_sudo(&command, "-g", group);
    }

    command
}
