use super::types::{Registration, RegistrationState};

/// Parse the decoded output of `wsl --list --verbose`.
///
/// ```text
///   NAME                   STATE           VERSION
/// * base                   Running         2
///   proj1                  Stopped         2
/// ```
///
/// Lines that do not fit the three-column shape (headers, banner text, the
/// "no installed distributions" message) are skipped; registration names may
/// contain spaces.
pub fn parse_list_verbose(output: &str) -> Vec<Registration> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Registration> {
    if line.trim().is_empty() {
        return None;
    }

    let is_default = line.trim_start().starts_with('*');
    let normalized = line.replace('*', " ");
    let columns: Vec<&str> = normalized.split_whitespace().collect();

    if columns.len() < 3 {
        return None;
    }

    let version: u8 = columns.last()?.parse().ok()?;
    let state = RegistrationState::from(*columns.get(columns.len() - 2)?);
    let name = columns[..columns.len() - 2].join(" ");

    if name.eq_ignore_ascii_case("NAME") {
        return None;
    }

    Some(Registration {
        name,
        state,
        version,
        is_default,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_row() {
        let reg = parse_line("  alpine-base           Stopped         2").unwrap();
        assert_eq!(reg.name, "alpine-base");
        assert_eq!(reg.state, RegistrationState::Stopped);
        assert_eq!(reg.version, 2);
        assert!(!reg.is_default);
    }

    #[test]
    fn default_marker_variants() {
        assert!(parse_line("* base  Running  2").unwrap().is_default);
        assert!(parse_line(" * base  Running  2").unwrap().is_default);
        assert!(!parse_line("  base  Running  2").unwrap().is_default);
    }

    #[test]
    fn header_and_blank_lines_are_skipped() {
        assert!(parse_line("  NAME                   STATE           VERSION").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn names_with_spaces_survive() {
        let reg = parse_line("  Ubuntu 22.04 LTS       Running         2").unwrap();
        assert_eq!(reg.name, "Ubuntu 22.04 LTS");
    }

    #[test]
    fn non_numeric_version_is_rejected() {
        assert!(parse_line("  base  Running  two").is_none());
        assert!(parse_line("  base  Running").is_none());
    }

    #[test]
    fn all_known_states_map() {
        for (word, state) in [
            ("Running", RegistrationState::Running),
            ("Stopped", RegistrationState::Stopped),
            ("Installing", RegistrationState::Installing),
            ("Converting", RegistrationState::Converting),
            ("Hibernating", RegistrationState::Unknown),
        ] {
            let line = format!("  d  {word}  2");
            assert_eq!(parse_line(&line).unwrap().state, state, "{word}");
        }
    }

    #[test]
    fn full_listing_with_banner_text() {
        let output = "Windows Subsystem for Linux Distributions:\n  NAME      STATE           VERSION\n* base      Running         2\n  proj1     Stopped         2\n  proj2     Stopped         1\n";
        let regs = parse_list_verbose(output);
        assert_eq!(regs.len(), 3);
        assert_eq!(regs[0].name, "base");
        assert!(regs[0].is_default);
        assert_eq!(regs[2].version, 1);
    }

    #[test]
    fn no_distributions_message_yields_empty() {
        let output = "Windows Subsystem for Linux has no installed distributions.\n";
        assert!(parse_list_verbose(output).is_empty());
    }

    #[test]
    fn empty_output_yields_empty() {
        assert!(parse_list_verbose("").is_empty());
    }
}
