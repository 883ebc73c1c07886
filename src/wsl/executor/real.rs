//! Real executors - spawn wsl.exe (and, where needed, other host programs)

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::time::Duration;

use log::{debug, error};
use wsl_core::decode_console_output;

use super::{CommandOutput, WslCommandExecutor};
use crate::constants::{DEFAULT_COMMAND_TIMEOUT, IMPORT_EXPORT_TIMEOUT};
use crate::error::{Error, Result};

/// Windows flag preventing a console window from flashing for every
/// background invocation.
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

fn hidden_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

/// Spawn an arbitrary host program with an argv array, a timeout, and
/// optional stdin bytes. The console output is decoded with the UTF-16
/// sniff, since wsl.exe (the main customer) emits UTF-16LE on some paths.
///
/// A non-zero exit is not an error here; callers classify it.
pub fn exec_system(
    program: &str,
    argv: &[String],
    timeout: Duration,
    stdin: Option<&[u8]>,
) -> Result<CommandOutput> {
    debug!("exec: {program} {argv:?}");

    let mut child = hidden_command(program)
        .args(argv)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("failed to spawn {program}: {e}");
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::HostSubsystemMissing(format!("'{program}' not found on PATH"))
            } else {
                Error::Internal(format!("spawn {program}: {e}"))
            }
        })?;

    if let Some(bytes) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(bytes)?;
            // Closing the pipe lets `cat`-style readers terminate.
        }
    }

    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stdout_bytes = Vec::new();
                let mut stderr_bytes = Vec::new();
                if let Some(mut out) = child.stdout.take() {
                    let _ = out.read_to_end(&mut stdout_bytes);
                }
                if let Some(mut err) = child.stderr.take() {
                    let _ = err.read_to_end(&mut stderr_bytes);
                }

                return Ok(CommandOutput {
                    argv: argv.to_vec(),
                    stdout: decode_console_output(&stdout_bytes),
                    stderr: decode_console_output(&stderr_bytes),
                    exit_code: status.code(),
                });
            }
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    error!("{program} {argv:?} timed out after {timeout:?}");
                    return Err(Error::Timeout(format!(
                        "{program} {} did not finish within {timeout:?}",
                        argv.first().map(String::as_str).unwrap_or("")
                    )));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                error!("waiting for {program}: {e}");
                return Err(Error::Internal(format!("wait: {e}")));
            }
        }
    }
}

/// Run a PowerShell script on the host.
pub fn exec_powershell(script: &str) -> Result<CommandOutput> {
    let argv: Vec<String> = [
        "-NoProfile",
        "-ExecutionPolicy",
        "Bypass",
        "-Command",
        script,
    ]
    .map(String::from)
    .to_vec();
    exec_system("powershell.exe", &argv, DEFAULT_COMMAND_TIMEOUT, None)
}

/// Executor that calls the actual `wsl` binary.
pub struct RealWslExecutor {
    program: String,
}

impl RealWslExecutor {
    pub fn new() -> Self {
        Self {
            program: "wsl".to_string(),
        }
    }

    fn run(&self, argv: &[String], timeout: Duration, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        exec_system(&self.program, argv, timeout, stdin)
    }

    fn run_default(&self, argv: &[&str]) -> Result<CommandOutput> {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        self.run(&argv, DEFAULT_COMMAND_TIMEOUT, None)
    }

    fn exec_argv(name: &str, user: Option<&str>, command: &str) -> Vec<String> {
        let mut argv = vec!["-d".to_string(), name.to_string()];
        if let Some(user) = user {
            argv.push("-u".to_string());
            argv.push(user.to_string());
        }
        argv.extend(["--", "sh", "-c", command].map(String::from));
        argv
    }
}

impl Default for RealWslExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl WslCommandExecutor for RealWslExecutor {
    fn exec_wsl(&self, argv: &[String]) -> Result<CommandOutput> {
        self.run(argv, DEFAULT_COMMAND_TIMEOUT, None)
    }

    fn list_verbose(&self) -> Result<CommandOutput> {
        self.run_default(&["--list", "--verbose"])
    }

    fn list_online(&self) -> Result<CommandOutput> {
        self.run_default(&["--list", "--online"])
    }

    fn version(&self) -> Result<CommandOutput> {
        self.run_default(&["--version"])
    }

    fn import(
        &self,
        name: &str,
        location: &str,
        tarball: &str,
        version: Option<u8>,
    ) -> Result<CommandOutput> {
        let mut argv: Vec<String> =
            ["--import", name, location, tarball].map(String::from).to_vec();
        if let Some(v) = version {
            argv.push("--version".to_string());
            argv.push(v.to_string());
        }
        self.run(&argv, IMPORT_EXPORT_TIMEOUT, None)
    }

    fn export(&self, name: &str, file: &str) -> Result<CommandOutput> {
        let argv: Vec<String> = ["--export", name, file].map(String::from).to_vec();
        self.run(&argv, IMPORT_EXPORT_TIMEOUT, None)
    }

    fn unregister(&self, name: &str) -> Result<CommandOutput> {
        self.run_default(&["--unregister", name])
    }

    fn terminate(&self, name: &str) -> Result<CommandOutput> {
        self.run_default(&["--terminate", name])
    }

    fn exec_in(&self, name: &str, user: Option<&str>, command: &str) -> Result<CommandOutput> {
        self.run(&Self::exec_argv(name, user, command), DEFAULT_COMMAND_TIMEOUT, None)
    }

    fn exec_in_with_stdin(
        &self,
        name: &str,
        user: Option<&str>,
        command: &str,
        stdin: &[u8],
    ) -> Result<CommandOutput> {
        self.run(
            &Self::exec_argv(name, user, command),
            DEFAULT_COMMAND_TIMEOUT,
            Some(stdin),
        )
    }
}
