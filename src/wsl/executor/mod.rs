//! WSL command executor - anti-corruption layer over the wsl.exe CLI
//!
//! All WSL invocations go through the `WslCommandExecutor` trait so the image
//! manager can be exercised against an in-memory mock. Arguments are always
//! passed as argv arrays; no shell string is ever assembled on the host side.

pub mod mock;
mod real;

pub use mock::MockWslExecutor;
pub use real::{exec_powershell, exec_system, RealWslExecutor};

use crate::error::{classify_wsl_failure, Result};

/// Decoded output of one WSL CLI invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// The argv the command ran with (`wsl` excluded), kept for diagnostics.
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Classify a failed invocation into the error taxonomy, or hand back the
    /// output unchanged on success.
    pub fn into_result(self) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            // WSL writes some errors to stdout; fold both streams in.
            let stderr = if self.stderr.trim().is_empty() {
                self.stdout.clone()
            } else {
                self.stderr.clone()
            };
            Err(classify_wsl_failure("wsl", &self.argv, self.exit_code, &stderr))
        }
    }
}

/// Abstraction over WSL command execution.
pub trait WslCommandExecutor: Send + Sync {
    /// Raw argv passthrough: `wsl <argv...>` with the default timeout.
    fn exec_wsl(&self, argv: &[String]) -> Result<CommandOutput>;

    /// `wsl --list --verbose`
    fn list_verbose(&self) -> Result<CommandOutput>;

    /// `wsl --list --online`
    fn list_online(&self) -> Result<CommandOutput>;

    /// `wsl --version`
    fn version(&self) -> Result<CommandOutput>;

    /// `wsl --import <name> <location> <tarball> [--version N]`
    /// (extended timeout)
    fn import(
        &self,
        name: &str,
        location: &str,
        tarball: &str,
        version: Option<u8>,
    ) -> Result<CommandOutput>;

    /// `wsl --export <name> <file>` (extended timeout)
    fn export(&self, name: &str, file: &str) -> Result<CommandOutput>;

    /// `wsl --unregister <name>`
    fn unregister(&self, name: &str) -> Result<CommandOutput>;

    /// `wsl --terminate <name>`
    fn terminate(&self, name: &str) -> Result<CommandOutput>;

    /// Run `command` inside an image via `sh -c`, optionally as a given user:
    /// `wsl -d <name> [-u user] -- sh -c <command>`
    fn exec_in(&self, name: &str, user: Option<&str>, command: &str) -> Result<CommandOutput>;

    /// Like `exec_in`, but with bytes piped to the command's stdin. Used to
    /// write files inside an image without host-path translation.
    fn exec_in_with_stdin(
        &self,
        name: &str,
        user: Option<&str>,
        command: &str,
        stdin: &[u8],
    ) -> Result<CommandOutput>;
}
