use crate::error::{AppError, Result};

/// Instance ids are slugs: `[A-Za-z0-9_-]+`.
pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    let is_safe = !instance_id.is_empty()
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));

    if !is_safe {
        return Err(AppError::invalid_id(instance_id));
    }

    Ok(())
}
