//! Transfer task model: a shell script plus its source and target endpoints.

use std::fs;
use std::io;
use std::process::Command;

use crate::filesystem::Data;

/// Exit code of a task attempt.
///
/// Zero is success. Negative sentinels are reserved for outcomes the script
/// itself cannot report: verification failures and forcible termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

/// Recorded when the copied data's size does not match the source.
pub const MISMATCHED_SIZE: ExitCode = ExitCode(-1);

/// Recorded when the copied data's checksum does not match the source.
pub const MISMATCHED_CHECKSUM: ExitCode = ExitCode(-2);

/// Recorded against in-flight attempts when a crashed job is forcibly resumed.
pub const FORCIBLY_TERMINATED: ExitCode = ExitCode(-3);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);

    pub fn success(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single transfer step: the rendered script that moves `source` to
/// `target`. The script does the bytes; the engine never copies data
/// in-process.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub script: String,
    pub source: Data,
    pub target: Data,
}

impl Task {
    pub fn new(script: impl Into<String>, source: Data, target: Data) -> Self {
        Task {
            script: script.into(),
            source,
            target,
        }
    }

    /// Execute the task script.
    ///
    /// The script is written to a fresh temporary directory, marked
    /// executable, and run with that directory as its working directory. The
    /// directory is released on every exit path.
    pub fn execute(&self) -> io::Result<ExitCode> {
        let scratch = tempfile::tempdir()?;
        let script = scratch.path().join("task");

        fs::write(&script, &self.script)?;
        set_executable(&script)?;

        let status = Command::new(&script)
            .current_dir(scratch.path())
            .status()?;

        Ok(ExitCode(exit_code_of(status)))
    }
}

#[cfg(unix)]
fn set_executable(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_executable(_path: &std::path::Path) -> io::Result<()> {
    Ok(())
}

/// A signal-terminated process reports the negated signal number.
#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(1))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::tests::mock_data;

    #[test]
    fn exit_code_truthiness() {
        assert!(ExitCode::SUCCESS.success());
        assert!(!ExitCode(1).success());
        assert!(!MISMATCHED_SIZE.success());
        assert!(!MISMATCHED_CHECKSUM.success());
        assert!(!FORCIBLY_TERMINATED.success());
    }

    #[test]
    fn sentinels_are_distinct() {
        assert_ne!(MISMATCHED_SIZE, MISMATCHED_CHECKSUM);
        assert_ne!(MISMATCHED_CHECKSUM, FORCIBLY_TERMINATED);
    }

    #[test]
    #[cfg(unix)]
    fn execute_reports_the_script_exit_code() {
        let task = Task::new(
            "#!/bin/sh\nexit 0\n",
            mock_data("a", "/in"),
            mock_data("b", "/out"),
        );
        assert_eq!(task.execute().unwrap(), ExitCode::SUCCESS);

        let task = Task::new(
            "#!/bin/sh\nexit 42\n",
            mock_data("a", "/in"),
            mock_data("b", "/out"),
        );
        assert_eq!(task.execute().unwrap(), ExitCode(42));
    }

    #[test]
    #[cfg(unix)]
    fn execute_runs_from_a_scratch_directory() {
        let task = Task::new(
            "#!/bin/sh\ntest -f task\n",
            mock_data("a", "/in"),
            mock_data("b", "/out"),
        );
        assert_eq!(task.execute().unwrap(), ExitCode::SUCCESS);
    }
}
