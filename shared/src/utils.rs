//! Small utility functions shared by the server and agent crates

/// Validates that a task-group or agent name is a reasonable registry key:
/// non-empty, alphanumeric plus `-`/`_`/`.`, and not absurdly long.
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::CoreError::Validation("name cannot be empty".to_string()).into());
    }
    if name.len() > 128 {
        return Err(
            crate::CoreError::Validation("name cannot be longer than 128 characters".to_string())
                .into(),
        );
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(crate::CoreError::Validation(
            "name can only contain alphanumeric characters, '-', '_' and '.'".to_string(),
        )
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_empty_and_weird_chars() {
        assert!(validate_name("").is_err());
        assert!(validate_name("demo group").is_err());
        assert!(validate_name("demo-group_1.0").is_ok());
    }
}
