//! WSL subsystem integration
//!
//! Everything that talks to `wsl.exe` lives behind the executor trait in
//! `executor`; image lifecycle logic sits on top of it and never constructs
//! a shell command string from untrusted input.

pub mod executor;

pub use executor::{CommandOutput, MockWslExecutor, RealWslExecutor, WslCommandExecutor};
