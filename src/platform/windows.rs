use std::path::Path;

use super::Platform;

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn shell_inline(command: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c").arg(command).arg("convoy");
        cmd
    }

    fn is_process_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let Ok(output) = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
        else {
            return false;
        };
        let text = String::from_utf8_lossy(&output.stdout);
        text.split_whitespace().any(|field| field == pid.to_string())
    }

    fn restrict_dir_permissions(_path: &Path) {}
}
