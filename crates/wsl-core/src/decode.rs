/// Decode raw console bytes from the WSL CLI.
///
/// The Windows host CLI writes UTF-16LE on some code paths (notably `--list`)
/// and UTF-8 on others. Detection: a UTF-16LE byte-order mark, or alternating
/// NUL bytes within the first 16 bytes. Anything else is treated as UTF-8.
pub fn decode_console_output(bytes: &[u8]) -> String {
    if looks_like_utf16le(bytes) {
        let units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));

        let decoded: String = char::decode_utf16(units)
            .filter_map(|r| r.ok())
            .filter(|&c| c != '\u{FEFF}')
            .collect();

        if !decoded.is_empty() {
            return decoded;
        }
    }

    String::from_utf8_lossy(bytes).into_owned()
}

/// UTF-16LE sniff over at most the first 16 bytes.
fn looks_like_utf16le(bytes: &[u8]) -> bool {
    if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] == 0xFE {
        return true;
    }

    if bytes.len() < 4 {
        return false;
    }

    let window = &bytes[..bytes.len().min(16)];
    let pairs = window.len() / 2;
    let nul_high_bytes = window
        .iter()
        .skip(1)
        .step_by(2)
        .filter(|&&b| b == 0)
        .count();

    nul_high_bytes * 2 > pairs
}
