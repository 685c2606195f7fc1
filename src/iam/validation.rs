use regex::Regex;

use super::IamError;

const MAX_NAME_LEN: usize = 64;

fn check_len(kind: &str, name: &str) -> Result<(), IamError> {
    if name.len() > MAX_NAME_LEN {
        return Err(IamError::Invalid(format!(
            "{kind} name longer than {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// # Errors
/// Returns `IamError::Invalid` unless the name matches `^[a-zA-Z0-9_-]+$`.
pub fn validate_role_name(name: &str) -> Result<(), IamError> {
    check_len("role", name)?;
    // No colons: those namespace permission names.
    if !Regex::new(r"^[a-zA-Z0-9_-]+$").is_ok_and(|re| re.is_match(name)) {
        return Err(IamError::Invalid(format!("invalid role name: {name:?}")));
    }
    Ok(())
}

/// # Errors
/// Returns `IamError::Invalid` unless the name matches `^[a-zA-Z0-9_:]+$`.
pub fn validate_permission_name(name: &str) -> Result<(), IamError> {
    check_len("permission", name)?;
    if !Regex::new(r"^[a-zA-Z0-9_:]+$").is_ok_and(|re| re.is_match(name)) {
        return Err(IamError::Invalid(format!("invalid permission name: {name:?}")));
    }
    Ok(())
}

pub(crate) fn valid_email(email: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(email))
}
