use crate::StoreError;

pub const MAX_NAME_BYTES: usize = 128;

/// Names double as file names, so anything that could escape the store root
/// or collide with temporary files is refused.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let reason = if name.trim().is_empty() {
        Some("name must not be empty")
    } else if name.len() > MAX_NAME_BYTES {
        Some("name is too long")
    } else if name.starts_with('.') {
        Some("name must not start with '.'")
    } else if name.contains('/') || name.contains('\\') {
        Some("name must not contain path separators")
    } else if name.chars().any(char::is_control) {
        Some("name must not contain control characters")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StoreError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
