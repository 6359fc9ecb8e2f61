/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Build a **tokio** `Command` that runs an inline shell string. Extra
    /// arguments appended by the caller become `$1`, `$2`, ... in the script.
    fn shell_inline(command: &str) -> tokio::process::Command;

    /// Whether a process with the given pid currently exists.
    fn is_process_alive(pid: u32) -> bool;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &std::path::Path);
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
