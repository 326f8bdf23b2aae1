//! Validation for ids that end up in file paths and checkpoints.

use anyhow::{Result, anyhow};

/// Validate that a phase or run id is safe to use as a path component.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}
