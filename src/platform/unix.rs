use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::Platform;

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn shell_inline(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        // `sh -c <script> <argv0> <args...>`
        cmd.arg("-c").arg(command).arg("convoy");
        cmd
    }

    fn is_process_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let Ok(output) = signal_zero(pid).output() else {
            return false;
        };
        if output.status.success() {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        stderr.contains("not permitted")
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }
}

/// `kill -0 <pid>` with messages forced to the C locale, so the EPERM text
/// can be matched.
fn signal_zero(pid: u32) -> std::process::Command {
    let mut cmd = std::process::Command::new("kill");
    cmd.arg("-0")
        .arg(pid.to_string())
        .env("LC_ALL", "C")
        .env("LANG", "C")
        .env_remove("LANGUAGE");
    cmd
}
