use crate::ConfigResult;

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    /// Validate that a timeout is reasonable
    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        if timeout_seconds == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if timeout_seconds > 86_400 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to 86400"
            )));
        }
        Ok(())
    }

    /// Validate that a count lies in `1..=max`
    pub fn validate_count(count: usize, field_name: &str, max: usize) -> ConfigResult<()> {
        if count == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if count > max {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    /// Validate that a URL has a protocol
    pub fn validate_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.contains("://") {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        }
        Ok(())
    }

    /// Validate `min <= max` for a pair of millisecond bounds
    pub fn validate_range_ms(min: u64, max: u64, field_name: &str) -> ConfigResult<()> {
        if min == 0 {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} lower bound must be greater than 0"
            )));
        }
        if max < min {
            return Err(crate::ConfigError::Validation(format!(
                "{field_name} upper bound ({max}) must not be below lower bound ({min})"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_not_empty() {
        assert!(ValidationUtils::validate_not_empty("test", "field").is_ok());
        assert!(ValidationUtils::validate_not_empty("", "field").is_err());
        assert!(ValidationUtils::validate_not_empty("   ", "field").is_err());
    }

    #[test]
    fn test_validate_timeout_seconds() {
        assert!(ValidationUtils::validate_timeout_seconds(30, "t").is_ok());
        assert!(ValidationUtils::validate_timeout_seconds(0, "t").is_err());
        assert!(ValidationUtils::validate_timeout_seconds(86_401, "t").is_err());
    }

    #[test]
    fn test_validate_count() {
        assert!(ValidationUtils::validate_count(10, "c", 100).is_ok());
        assert!(ValidationUtils::validate_count(0, "c", 100).is_err());
        assert!(ValidationUtils::validate_count(101, "c", 100).is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(ValidationUtils::validate_url("redis://localhost:6379", "url").is_ok());
        assert!(ValidationUtils::validate_url("localhost:6379", "url").is_err());
        assert!(ValidationUtils::validate_url("", "url").is_err());
    }

    #[test]
    fn test_validate_range_ms() {
        assert!(ValidationUtils::validate_range_ms(10, 100, "r").is_ok());
        assert!(ValidationUtils::validate_range_ms(10, 10, "r").is_ok());
        assert!(ValidationUtils::validate_range_ms(0, 100, "r").is_err());
        assert!(ValidationUtils::validate_range_ms(100, 10, "r").is_err());
    }
}
