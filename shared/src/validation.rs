use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

pub const MIN_PASSWORD_LENGTH: usize = 6;

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles");
    static ref PHONE_RE: Regex =
        Regex::new(r"^\+?[\d\s\-\(\)]{8,15}$").expect("phone pattern compiles");
}

/// Local input checks; a failing form never reaches the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} is not a valid email address")]
    InvalidEmail { field: &'static str },

    #[error("{field} is not a valid phone number")]
    InvalidPhone { field: &'static str },

    #[error("personal and parental email addresses must be different")]
    EmailsMustDiffer,

    #[error("passwords do not match")]
    PasswordMismatch,

    #[error("password must contain at least {min} characters")]
    PasswordTooShort { min: usize },

    #[error("{field} has an unsupported format")]
    UnsupportedFormat { field: &'static str },

    #[error("{field} exceeds {max} bytes")]
    TooLarge { field: &'static str, max: usize },

    #[error("nothing to update")]
    EmptyUpdate,
}

impl ValidationError {
    pub fn field(&self) -> Option<&'static str> {
        match self {
            ValidationError::Required { field }
            | ValidationError::InvalidEmail { field }
            | ValidationError::InvalidPhone { field }
            | ValidationError::UnsupportedFormat { field }
            | ValidationError::TooLarge { field, .. } => Some(*field),
            ValidationError::EmailsMustDiffer => Some("parentalEmail"),
            ValidationError::PasswordMismatch => Some("confirmPassword"),
            ValidationError::PasswordTooShort { .. } => Some("password"),
            ValidationError::EmptyUpdate => None,
        }
    }
}

pub fn is_valid_email(value: &str) -> bool {
    EMAIL_RE.is_match(value)
}

pub fn is_valid_phone(value: &str) -> bool {
    PHONE_RE.is_match(value)
}

pub fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required { field });
    }
    Ok(())
}

pub fn validate_email(field: &'static str, value: &str) -> Result<(), ValidationError> {
    require(field, value)?;
    if !is_valid_email(value.trim()) {
        return Err(ValidationError::InvalidEmail { field });
    }
    Ok(())
}

pub fn validate_phone(field: &'static str, value: &str) -> Result<(), ValidationError> {
    require(field, value)?;
    if !is_valid_phone(value.trim()) {
        return Err(ValidationError::InvalidPhone { field });
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::Required { field: "password" });
    }
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooShort {
            min: MIN_PASSWORD_LENGTH,
        });
    }
    Ok(())
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_pattern() {
        assert!(is_valid_email("amina@leoni.com"));
        assert!(is_valid_email("a.b+c@sub.domain.tn"));
        assert!(!is_valid_email("amina@leoni"));
        assert!(!is_valid_email("amina leoni@x.com"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email(""));
    }

    #[test]
    fn test_phone_pattern() {
        assert!(is_valid_phone("+216 22 333 444"));
        assert!(is_valid_phone("(71) 123-456"));
        assert!(is_valid_phone("12345678"));
        assert!(!is_valid_phone("1234567"));
        assert!(!is_valid_phone("+216 22 333 444 555 6"));
        assert!(!is_valid_phone("22-ABC-444"));
    }

    #[test]
    fn test_required_fields() {
        assert_eq!(
            validate_email("email", "   "),
            Err(ValidationError::Required { field: "email" })
        );
        assert_eq!(
            validate_phone("phoneNumber", "abc"),
            Err(ValidationError::InvalidPhone {
                field: "phoneNumber"
            })
        );
    }

    #[test]
    fn test_password_rules() {
        assert!(validate_password("secret").is_ok());
        assert_eq!(
            validate_password("abc"),
            Err(ValidationError::PasswordTooShort { min: 6 })
        );
        assert_eq!(
            validate_password(""),
            Err(ValidationError::Required { field: "password" })
        );
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Amina@Leoni.COM "), "amina@leoni.com");
    }
}
