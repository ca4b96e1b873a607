//! Shell command safety checks for the `exec_shell` tool.
//!
//! Catches the common footgun patterns an LLM might emit before they reach a
//! shell. This is not a sandbox — OS-level isolation is out of scope — but
//! it blocks the classes of commands that are unrecoverable when wrong.
//!
//! Decision order:
//!   1. Whitelist mode on → the command must match an allow pattern.
//!   2. Dangerous-command blocking on → denylist patterns (built-in plus
//!      user-configured) reject with a fixed reason string.
//!   3. Otherwise allowed.

use countbot_core::config::SecurityConfig;

/// `(substring_pattern, reason)` pairs, matched against the lowercased
/// trimmed command. First match wins.
const DENYLIST: &[(&str, &str)] = &[
    ("rm -rf /", "Destructive: recursive forced removal from root"),
    ("rm -rf /*", "Destructive: recursive forced removal of all root children"),
    ("rm -rf ~", "Destructive: recursive forced removal of the home directory"),
    (":(){ :|:& };:", "Fork bomb: will exhaust system resources"),
    ("| sh", "Unsafe: piping content directly into sh"),
    ("| bash", "Unsafe: piping content directly into bash"),
    ("|sh", "Unsafe: piping content directly into sh"),
    ("|bash", "Unsafe: piping content directly into bash"),
    ("dd if=", "Destructive: raw disk I/O via dd"),
    ("mkfs", "Destructive: creates a new filesystem, wiping existing data"),
    ("> /dev/sd", "Destructive: writes directly to a block device"),
    ("chmod 777 /", "Unsafe: world-writable permissions on the root filesystem"),
    ("chown -r /", "Unsafe: recursive chown from root"),
    ("shutdown", "Unsafe: shuts down the system"),
    ("reboot", "Unsafe: reboots the system"),
    ("halt", "Unsafe: halts the system"),
    ("poweroff", "Unsafe: powers off the system"),
    ("kill -9 1", "Unsafe: kills PID 1"),
    ("kill -9 -1", "Unsafe: sends SIGKILL to every process"),
    ("> /etc/", "Destructive: overwrites a file under /etc"),
    (">> /etc/", "Destructive: appends to a file under /etc"),
    ("sudo", "Blocked: privilege escalation is not permitted"),
];

/// The built-in dangerous patterns, for the settings API.
pub fn dangerous_patterns() -> Vec<&'static str> {
    DENYLIST.iter().map(|(p, _)| *p).collect()
}

/// Check whether `command` may be executed under `security`.
///
/// Returns `Err(reason)` when the command is rejected.
pub fn check_command(command: &str, security: &SecurityConfig) -> Result<(), String> {
    let trimmed = command.trim();
    let lower = trimmed.to_lowercase();

    if security.command_whitelist_enabled {
        let allowed = security
            .custom_allow_patterns
            .iter()
            .any(|p| !p.is_empty() && lower.starts_with(&p.to_lowercase()));
        if !allowed {
            return Err("命令不在白名单内，已拒绝执行".to_string());
        }
    }

    if security.dangerous_commands_blocked {
        for (pattern, reason) in DENYLIST {
            if lower.contains(pattern) {
                return Err(format!("{reason} (matched pattern: `{pattern}`)"));
            }
        }
        for pattern in &security.custom_deny_patterns {
            if !pattern.is_empty() && lower.contains(&pattern.to_lowercase()) {
                return Err(format!("Blocked by custom pattern: `{pattern}`"));
            }
        }
    }

    Ok(())
}
