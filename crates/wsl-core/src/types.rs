use serde::{Deserialize, Serialize};

/// A WSL registration as reported by `wsl --list --verbose`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    /// Registration name, unique per host.
    pub name: String,
    pub state: RegistrationState,
    /// WSL version (1 or 2).
    pub version: u8,
    /// Marked with `*` in the listing.
    pub is_default: bool,
}

/// State column of the `wsl --list --verbose` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationState {
    Running,
    Stopped,
    Installing,
    Converting,
    Unknown,
}

impl From<&str> for RegistrationState {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "running" => RegistrationState::Running,
            "stopped" => RegistrationState::Stopped,
            "installing" => RegistrationState::Installing,
            "converting" => RegistrationState::Converting,
            _ => RegistrationState::Unknown,
        }
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistrationState::Running => "Running",
            RegistrationState::Stopped => "Stopped",
            RegistrationState::Installing => "Installing",
            RegistrationState::Converting => "Converting",
            RegistrationState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}
