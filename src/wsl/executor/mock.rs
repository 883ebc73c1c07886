//! Mock WSL executor for tests
//!
//! Holds an in-memory registration set and a per-image guest filesystem, and
//! renders output strings in the same shape the real CLI produces so the
//! parsing path is exercised end to end. Single failures can be injected per
//! operation to test compensation paths.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{CommandOutput, WslCommandExecutor};
use crate::error::Result;

#[derive(Debug, Clone)]
struct MockRegistration {
    name: String,
    version: u8,
    running: bool,
}

#[derive(Debug, Default)]
struct MockState {
    registrations: Vec<MockRegistration>,
    /// (image name, absolute guest path) -> file bytes
    guest_files: HashMap<(String, String), Vec<u8>>,
    /// operation -> stderr for a single injected failure
    fail_next: HashMap<String, String>,
    calls: Vec<String>,
}

/// In-memory stand-in for `wsl.exe`.
#[derive(Default)]
pub struct MockWslExecutor {
    state: Mutex<MockState>,
}

impl MockWslExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registrations(names: &[(&str, u8)]) -> Self {
        let mock = Self::new();
        {
            let mut state = mock.state.lock().unwrap();
            for (name, version) in names {
                state.registrations.push(MockRegistration {
                    name: name.to_string(),
                    version: *version,
                    running: false,
                });
            }
        }
        mock
    }

    pub fn registered(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .registrations
            .iter()
            .any(|r| r.name == name)
    }

    pub fn registration_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .registrations
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Register a distribution behind the manager's back (simulates an
    /// external `wsl --import` or a stray registration after a crash).
    pub fn register_externally(&self, name: &str, version: u8) {
        self.state.lock().unwrap().registrations.push(MockRegistration {
            name: name.to_string(),
            version,
            running: false,
        });
    }

    /// Unregister behind the manager's back (simulates an external
    /// `wsl --unregister`).
    pub fn unregister_externally(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.registrations.retain(|r| r.name != name);
        state.guest_files.retain(|(image, _), _| image != name);
    }

    pub fn guest_file(&self, image: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .guest_files
            .get(&(image.to_string(), path.to_string()))
            .cloned()
    }

    pub fn put_guest_file(&self, image: &str, path: &str, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .guest_files
            .insert((image.to_string(), path.to_string()), bytes.to_vec());
    }

    /// Make the next call of `operation` ("import", "export", "unregister",
    /// "exec", "list") fail with the given stderr.
    pub fn fail_once(&self, operation: &str, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_next
            .insert(operation.to_string(), stderr.to_string());
    }

    /// Number of CLI invocations the manager has made.
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn injected_failure(&self, operation: &str, argv: Vec<String>) -> Option<CommandOutput> {
        let stderr = self.state.lock().unwrap().fail_next.remove(operation)?;
        Some(CommandOutput {
            argv,
            stdout: String::new(),
            stderr,
            exit_code: Some(1),
        })
    }

    fn ok(argv: Vec<String>, stdout: impl Into<String>) -> CommandOutput {
        CommandOutput {
            argv,
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    fn not_found(argv: Vec<String>) -> CommandOutput {
        CommandOutput {
            argv,
            stdout: String::new(),
            stderr: "There is no distribution with the supplied name. Distribution not found."
                .to_string(),
            exit_code: Some(1),
        }
    }
}

/// Strip one level of single quotes from a shell word.
fn unquote(word: &str) -> &str {
    word.trim_matches('\'')
}

impl WslCommandExecutor for MockWslExecutor {
    fn exec_wsl(&self, argv: &[String]) -> Result<CommandOutput> {
        self.record(format!("exec_wsl {argv:?}"));
        match argv.first().map(String::as_str) {
            Some("--list") => self.list_verbose(),
            Some("--version") => self.version(),
            _ => Ok(Self::ok(argv.to_vec(), "")),
        }
    }

    fn list_verbose(&self) -> Result<CommandOutput> {
        self.record("list_verbose".to_string());
        let argv = vec!["--list".to_string(), "--verbose".to_string()];
        if let Some(failure) = self.injected_failure("list", argv.clone()) {
            return Ok(failure);
        }

        let state = self.state.lock().unwrap();
        if state.registrations.is_empty() {
            return Ok(Self::ok(
                argv,
                "Windows Subsystem for Linux has no installed distributions.\n",
            ));
        }

        let mut out = String::from("  NAME                   STATE           VERSION\n");
        for (i, reg) in state.registrations.iter().enumerate() {
            let marker = if i == 0 { '*' } else { ' ' };
            let status = if reg.running { "Running" } else { "Stopped" };
            out.push_str(&format!(
                "{marker} {:<22} {:<15} {}\n",
                reg.name, status, reg.version
            ));
        }
        Ok(Self::ok(argv, out))
    }

    fn list_online(&self) -> Result<CommandOutput> {
        self.record("list_online".to_string());
        let argv = vec!["--list".to_string(), "--online".to_string()];
        Ok(Self::ok(
            argv,
            "NAME                            FRIENDLY NAME\nUbuntu                          Ubuntu\nDebian                          Debian GNU/Linux\n",
        ))
    }

    fn version(&self) -> Result<CommandOutput> {
        self.record("version".to_string());
        let argv = vec!["--version".to_string()];
        Ok(Self::ok(
            argv,
            "WSL version: 2.3.26.0\nKernel version: 5.15.167.4-1\n",
        ))
    }

    fn import(
        &self,
        name: &str,
        location: &str,
        tarball: &str,
        version: Option<u8>,
    ) -> Result<CommandOutput> {
        self.record(format!("import {name}"));
        let argv: Vec<String> = ["--import", name, location, tarball]
            .map(String::from)
            .to_vec();
        if let Some(failure) = self.injected_failure("import", argv.clone()) {
            return Ok(failure);
        }

        let mut state = self.state.lock().unwrap();
        if state.registrations.iter().any(|r| r.name == name) {
            return Ok(CommandOutput {
                argv,
                stdout: String::new(),
                stderr: "A distribution with the supplied name already exists.".to_string(),
                exit_code: Some(1),
            });
        }
        if !std::path::Path::new(tarball).is_file() {
            return Ok(CommandOutput {
                argv,
                stdout: String::new(),
                stderr: format!("The system cannot find the file specified: {tarball}"),
                exit_code: Some(1),
            });
        }

        state.registrations.push(MockRegistration {
            name: name.to_string(),
            version: version.unwrap_or(2),
            running: false,
        });
        Ok(Self::ok(argv, "The operation completed successfully.\n"))
    }

    fn export(&self, name: &str, file: &str) -> Result<CommandOutput> {
        self.record(format!("export {name}"));
        let argv: Vec<String> = ["--export", name, file].map(String::from).to_vec();
        if let Some(failure) = self.injected_failure("export", argv.clone()) {
            return Ok(failure);
        }

        let state = self.state.lock().unwrap();
        if !state.registrations.iter().any(|r| r.name == name) {
            return Ok(Self::not_found(argv));
        }
        if let Err(e) = std::fs::write(file, b"mock exported rootfs tar") {
            return Ok(CommandOutput {
                argv,
                stdout: String::new(),
                stderr: format!("cannot write export file: {e}"),
                exit_code: Some(1),
            });
        }
        Ok(Self::ok(argv, "The operation completed successfully.\n"))
    }

    fn unregister(&self, name: &str) -> Result<CommandOutput> {
        self.record(format!("unregister {name}"));
        let argv: Vec<String> = ["--unregister", name].map(String::from).to_vec();
        if let Some(failure) = self.injected_failure("unregister", argv.clone()) {
            return Ok(failure);
        }

        let mut state = self.state.lock().unwrap();
        if !state.registrations.iter().any(|r| r.name == name) {
            return Ok(Self::not_found(argv));
        }
        state.registrations.retain(|r| r.name != name);
        state.guest_files.retain(|(image, _), _| image != name);
        Ok(Self::ok(argv, "The operation completed successfully.\n"))
    }

    fn terminate(&self, name: &str) -> Result<CommandOutput> {
        self.record(format!("terminate {name}"));
        let argv: Vec<String> = ["--terminate", name].map(String::from).to_vec();
        let mut state = self.state.lock().unwrap();
        match state.registrations.iter_mut().find(|r| r.name == name) {
            Some(reg) => {
                reg.running = false;
                Ok(Self::ok(argv, ""))
            }
            None => Ok(Self::not_found(argv)),
        }
    }

    fn exec_in(&self, name: &str, user: Option<&str>, command: &str) -> Result<CommandOutput> {
        self.exec_in_with_stdin(name, user, command, &[])
    }

    fn exec_in_with_stdin(
        &self,
        name: &str,
        _user: Option<&str>,
        command: &str,
        stdin: &[u8],
    ) -> Result<CommandOutput> {
        self.record(format!("exec {name}: {command}"));
        let argv: Vec<String> = ["-d", name, "--", "sh", "-c", command]
            .map(String::from)
            .to_vec();
        if let Some(failure) = self.injected_failure("exec", argv.clone()) {
            return Ok(failure);
        }

        let mut state = self.state.lock().unwrap();
        if !state.registrations.iter().any(|r| r.name == name) {
            return Ok(Self::not_found(argv));
        }

        // Interpret the handful of command shapes the manager issues.
        let trimmed = command.trim();
        if let Some(rest) = trimmed.strip_prefix("test -f ") {
            let path = unquote(rest.split_whitespace().next().unwrap_or(""));
            let exists = state
                .guest_files
                .contains_key(&(name.to_string(), path.to_string()));
            let sentinel = if exists { "EXISTS" } else { "NOT_FOUND" };
            return Ok(Self::ok(argv, format!("{sentinel}\n")));
        }
        if let Some(rest) = trimmed.strip_prefix("cat > ") {
            let path = unquote(rest.trim());
            state
                .guest_files
                .insert((name.to_string(), path.to_string()), stdin.to_vec());
            return Ok(Self::ok(argv, ""));
        }
        if let Some(rest) = trimmed.strip_prefix("cat ") {
            let path = unquote(rest.trim());
            return match state.guest_files.get(&(name.to_string(), path.to_string())) {
                Some(bytes) if path != "/etc/os-release" => {
                    Ok(Self::ok(argv, String::from_utf8_lossy(bytes).into_owned()))
                }
                _ if path == "/etc/os-release" => Ok(Self::ok(
                    argv,
                    "PRETTY_NAME=\"Alpine Linux v3.20\"\nNAME=\"Alpine Linux\"\nID=alpine\n",
                )),
                _ => Ok(CommandOutput {
                    argv,
                    stdout: String::new(),
                    stderr: format!("cat: {path}: No such file or directory"),
                    exit_code: Some(1),
                }),
            };
        }
        if trimmed == "uname -r" {
            return Ok(Self::ok(argv, "5.15.167.4-microsoft-standard-WSL2\n"));
        }
        if trimmed == "free -h" {
            return Ok(Self::ok(
                argv,
                "               total        used        free\nMem:            15Gi       1.2Gi        13Gi\nSwap:          4.0Gi          0B       4.0Gi\n",
            ));
        }

        // Arbitrary provisioning commands succeed silently.
        Ok(Self::ok(argv, ""))
    }
}
