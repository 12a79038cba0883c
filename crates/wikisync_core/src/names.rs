use sha2::{Digest, Sha256};

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\', '/'];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Map one page-name segment to a filesystem-safe folder or file name.
///
/// Lossy: `"A B"` and `"A_B"` both become `"A_B"`. The original name is kept
/// in the folder's memo and reverse lookups must go through it.
pub fn sanitize(segment: &str) -> String {
    let mut output = String::with_capacity(segment.len());
    let mut in_whitespace = false;
    for ch in segment.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                output.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        if ILLEGAL_CHARS.contains(&ch) || ch.is_control() {
            continue;
        }
        output.push(ch);
    }

    let trimmed = output.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return format!("_{}", short_hash(segment));
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED_DEVICE_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}

/// Split a remote page name into its path segments, dropping empty ones.
pub fn split_page_name(name: &str) -> Vec<String> {
    name.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Best-effort human title for a sanitized segment that has no memo.
pub fn display_name(segment: &str) -> String {
    segment.replace('_', " ")
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut output = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
