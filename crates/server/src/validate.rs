//! Input validation and sanitization for upload metadata.
//!
//! Everything here is terminal: a validation failure is returned before any
//! side effect runs. Handlers pass raw client strings in and get sanitized
//! values out; the engine never sees unvalidated input.

use depot_core::config::ValidationConfig;

use crate::error::{ApiError, ApiResult};

/// Validator over the configured limits.
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Sanitize a client-supplied filename: strip path components and null
    /// bytes, trim dot/space padding, enforce length.
    pub fn sanitize_filename(&self, filename: &str) -> ApiResult<String> {
        let cleaned: String = filename
            .chars()
            .filter(|c| *c != '\0')
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let cleaned = cleaned.trim_matches([' ', '.']).to_string();

        if cleaned.is_empty() {
            return Err(ApiError::Validation("filename is empty".to_string()));
        }
        if cleaned.len() > self.config.max_filename_length {
            return Err(ApiError::Validation(format!(
                "filename too long ({} > {} characters)",
                cleaned.len(),
                self.config.max_filename_length
            )));
        }
        Ok(cleaned)
    }

    /// Validate an entity type against the configured allowlist.
    pub fn validate_entity_type(&self, entity_type: &str) -> ApiResult<String> {
        let lowered = entity_type.trim().to_ascii_lowercase();
        if !self.config.allowed_entity_types.contains(&lowered) {
            return Err(ApiError::Validation(format!(
                "unknown entity type: {entity_type}"
            )));
        }
        Ok(lowered)
    }

    /// Validate an entity id: non-empty, bounded, safe charset.
    pub fn validate_entity_id(&self, entity_id: &str) -> ApiResult<String> {
        let trimmed = entity_id.trim();
        if trimmed.is_empty() {
            return Err(ApiError::Validation("entity_id is empty".to_string()));
        }
        if trimmed.len() > self.config.max_entity_id_length {
            return Err(ApiError::Validation(format!(
                "entity_id too long ({} > {} characters)",
                trimmed.len(),
                self.config.max_entity_id_length
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(ApiError::Validation(format!(
                "entity_id contains invalid characters: {trimmed}"
            )));
        }
        Ok(trimmed.to_string())
    }

    /// Validate an optional description.
    pub fn validate_description(&self, description: Option<&str>) -> ApiResult<Option<String>> {
        match description {
            None => Ok(None),
            Some(d) => {
                let trimmed = d.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                if trimmed.len() > self.config.max_description_length {
                    return Err(ApiError::Validation(format!(
                        "description too long ({} > {} characters)",
                        trimmed.len(),
                        self.config.max_description_length
                    )));
                }
                Ok(Some(trimmed.to_string()))
            }
        }
    }

    /// Validate and normalize tags: lowercase, deduplicated, bounded.
    pub fn validate_tags(&self, tags: &[String]) -> ApiResult<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        for tag in tags {
            let tag = tag.trim().to_ascii_lowercase();
            if tag.is_empty() {
                continue;
            }
            if tag.len() > self.config.max_tag_length {
                return Err(ApiError::Validation(format!(
                    "tag too long ({} > {} characters)",
                    tag.len(),
                    self.config.max_tag_length
                )));
            }
            if !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
            {
                return Err(ApiError::Validation(format!(
                    "tag contains invalid characters: {tag}"
                )));
            }
            if !out.contains(&tag) {
                out.push(tag);
            }
        }
        if out.len() > self.config.max_tags {
            return Err(ApiError::Validation(format!(
                "too many tags ({} > {})",
                out.len(),
                self.config.max_tags
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::new(ValidationConfig::default())
    }

    #[test]
    fn test_filename_sanitization() {
        let v = validator();
        assert_eq!(
            v.sanitize_filename("../../etc/passwd").unwrap(),
            "_.._etc_passwd"
        );
        assert_eq!(v.sanitize_filename("report.pdf").unwrap(), "report.pdf");
        assert_eq!(
            v.sanitize_filename("  spaced name.txt  ").unwrap(),
            "spaced name.txt"
        );
        assert!(v.sanitize_filename("...").is_err());
        assert!(v.sanitize_filename(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_entity_type_allowlist() {
        let v = validator();
        assert_eq!(v.validate_entity_type("Ticket").unwrap(), "ticket");
        assert!(v.validate_entity_type("spaceship").is_err());
    }

    #[test]
    fn test_entity_id_charset() {
        let v = validator();
        assert_eq!(v.validate_entity_id("TICKET-123").unwrap(), "TICKET-123");
        assert!(v.validate_entity_id("").is_err());
        assert!(v.validate_entity_id("id with spaces").is_err());
        assert!(v.validate_entity_id("drop;table").is_err());
    }

    #[test]
    fn test_description_limits() {
        let v = validator();
        assert_eq!(v.validate_description(None).unwrap(), None);
        assert_eq!(v.validate_description(Some("  ")).unwrap(), None);
        assert_eq!(
            v.validate_description(Some("fine")).unwrap().as_deref(),
            Some("fine")
        );
        assert!(v.validate_description(Some(&"x".repeat(2000))).is_err());
    }

    #[test]
    fn test_tags_normalized_and_deduplicated() {
        let v = validator();
        let tags = v
            .validate_tags(&[
                "Bug".to_string(),
                "bug".to_string(),
                " ui ".to_string(),
                "".to_string(),
            ])
            .unwrap();
        assert_eq!(tags, vec!["bug", "ui"]);

        assert!(v.validate_tags(&["bad tag!".to_string()]).is_err());
        let too_many: Vec<String> = (0..25).map(|i| format!("t{i}")).collect();
        assert!(v.validate_tags(&too_many).is_err());
    }
}
