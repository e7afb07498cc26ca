use chrono::Utc;

use crate::error::{LeaseError, Result};

/// Longest name the runtime accepts for an instance (hostname label limit).
pub const MAX_INSTANCE_NAME_LEN: usize = 63;

pub fn now_ts() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

/// Check that `value` is usable as part of a runtime instance name: ASCII
/// alphanumerics and `-` only. Input is rejected rather than rewritten.
pub fn validate_name(value: &str, field_name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LeaseError::Validation(format!("{field_name} is required")));
    }
    if value.len() > MAX_INSTANCE_NAME_LEN {
        return Err(LeaseError::Validation(format!(
            "{field_name} exceeds {MAX_INSTANCE_NAME_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    {
        return Err(LeaseError::Validation(format!(
            "{field_name} may only contain ASCII letters, digits and '-'"
        )));
    }
    Ok(())
}

/// Check an owner id: a valid name part without `-`. Instance names end in
/// `-{owner}`, so the last `-` separates the owner and no two owners can map
/// onto the same instance name.
pub fn validate_owner(value: &str) -> Result<()> {
    validate_name(value, "owner id")?;
    if value.contains('-') {
        return Err(LeaseError::Validation(
            "owner id may only contain ASCII letters and digits".to_string(),
        ));
    }
    Ok(())
}

/// Check a complete instance name: a valid name part that also starts with a
/// letter and does not end with `-`.
pub fn validate_instance_name(name: &str) -> Result<()> {
    validate_name(name, "instance name")?;
    let starts_with_letter = name.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic());
    if !starts_with_letter || name.ends_with('-') {
        return Err(LeaseError::Validation(format!(
            "instance name '{name}' must start with a letter and not end with '-'"
        )));
    }
    Ok(())
}

/// Parse a comma separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
