//! Session id validation

use anyhow::{Result, bail};

const MAX_SESSION_ID_LEN: usize = 128;

/// Generate a new ULID session id for callers that do not bring their own.
pub fn new_session_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Validate a caller-supplied session id.
///
/// Ids double as directory names in the file store, so only
/// `[A-Za-z0-9._-]` is accepted and `.`/`..` are rejected.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("Invalid session ID: empty");
    }
    if id.len() > MAX_SESSION_ID_LEN {
        let prefix: String = id.chars().take(16).collect();
        bail!(
            "Invalid session ID '{}…': longer than {} characters",
            prefix,
            MAX_SESSION_ID_LEN
        );
    }
    if id == "." || id == ".." {
        bail!("Invalid session ID '{}'", id);
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        bail!("Invalid session ID '{}': unexpected character {:?}", id, bad);
    }
    Ok(())
}
