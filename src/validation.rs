//! Input validation and sanitization for everything that arrives over the
//! radio: usernames, board names, callsigns, and message content.
//!
//! Validators return the normalized value so callers store exactly what was
//! checked. Usernames, board names, and callsigns are case-insensitive and
//! normalized to lowercase (callsigns to uppercase, matching the on-air
//! convention).

use anyhow::{anyhow, Result};

pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 16;
pub const MAX_CALLSIGN_LEN: usize = 8;

/// Validate and normalize a username. Lowercase alphanumerics, `_` and `-`,
/// must start with a letter.
pub fn validate_username(raw: &str) -> Result<String> {
    let name = raw.trim().to_lowercase();
    if name.len() < MIN_NAME_LEN || name.len() > MAX_NAME_LEN {
        return Err(anyhow!(
            "username must be {}-{} characters",
            MIN_NAME_LEN,
            MAX_NAME_LEN
        ));
    }
    if !name.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        return Err(anyhow!("username must start with a letter"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!("username may only contain letters, digits, _ and -"));
    }
    Ok(name)
}

/// Validate and normalize a board name. Same alphabet as usernames.
pub fn validate_board_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_lowercase();
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(anyhow!("board name must be 1-{} characters", MAX_NAME_LEN));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(anyhow!("board name may only contain letters, digits, _ and -"));
    }
    Ok(name)
}

/// Validate and normalize a BBS callsign (uppercase, short, alphanumeric).
pub fn validate_callsign(raw: &str) -> Result<String> {
    let cs = raw.trim().to_uppercase();
    if cs.is_empty() || cs.len() > MAX_CALLSIGN_LEN {
        return Err(anyhow!("callsign must be 1-{} characters", MAX_CALLSIGN_LEN));
    }
    if !cs.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(anyhow!("callsign must be alphanumeric"));
    }
    Ok(cs)
}

/// Strip control characters from message content and cap it at `max_bytes`
/// on a char boundary. Returns an error for empty results.
pub fn sanitize_content(raw: &str, max_bytes: usize) -> Result<String> {
    let mut out: String = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    let out_trimmed = out.trim();
    if out_trimmed.is_empty() {
        return Err(anyhow!("empty message"));
    }
    out = out_trimmed.to_string();
    if out.len() > max_bytes {
        out.truncate(max_bytes);
        while !out.is_char_boundary(out.len()) {
            out.pop();
        }
    }
    Ok(out)
}

/// Replace pipe characters so content cannot break the pipe-delimited wire
/// framing. The broken bar is visually close and never appears in frames.
pub fn escape_pipes(s: &str) -> String {
    s.replace('|', "¦")
}

/// Truncate a string to at most `max_bytes` bytes on a char boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
