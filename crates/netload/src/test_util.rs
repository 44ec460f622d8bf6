//! Helpers for tests that need external tools.

use std::process::Command;

/// Check whether `tool` can be found in `$PATH` through the shell. Returns
/// `false` if the test environment cannot run it, so process-level tests can
/// skip instead of failing.
pub fn have_cmd(tool: &str) -> bool {
    match Command::new("sh")
        .args(["-c", &format!("command -v {tool}")])
        .output()
    {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}
