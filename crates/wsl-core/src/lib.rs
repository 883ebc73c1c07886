//! WSL CLI output handling
//!
//! Pure decoding and parsing of `wsl.exe` console output, separated from the
//! process-spawning layer so it can be tested without a WSL host. The Windows
//! WSL CLI emits UTF-16LE on some code paths and UTF-8 on others; everything
//! downstream operates on the decoded string, never the raw bytes.

mod decode;
mod list;
mod types;

pub use decode::decode_console_output;
pub use list::parse_list_verbose;
pub use types::{Registration, RegistrationState};
