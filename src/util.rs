use std::env;
use std::path::Path;
use std::process::Command as ProcessCommand;

use chrono::Local;

/// Prints a timestamped line to the console, tagged with the emitting component.
pub(crate) fn log_line(component: &str, message: &str) {
    eprintln!(
        "{} [{component}] {message}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Composes the subprocess for a resolved shell line. The line always goes
/// through `sh -c`; when a privilege user is configured the whole invocation
/// is wrapped in `sudo -u <user>` so the operation runs as that account.
pub(crate) fn build_shell_command(privilege_user: &str, line: &str) -> ProcessCommand {
    let mut cmd = if privilege_user.is_empty() {
        let mut c = ProcessCommand::new("sh");
        c.arg("-c").arg(line);
        c
    } else {
        let mut c = ProcessCommand::new("sudo");
        c.arg("-u").arg(privilege_user).arg("sh").arg("-c").arg(line);
        c
    };

    // Each operation gets its own process group so stray children
    // never end up sharing the bot's.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Whether a path exists and carries an execute bit. Targets must point at
/// the LinuxGSM entry script, which is always executable.
pub(crate) fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(meta) => meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.exists()
    }
}
