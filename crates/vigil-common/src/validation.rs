//! Input validation for service and configuration value payloads

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;

pub const MAX_SERVICE_ID_LEN: usize = 65;
pub const MIN_HEARTBEAT_TIMEOUT: u32 = 3;
pub const MAX_HEARTBEAT_TIMEOUT: u32 = 120;
pub const MAX_TAGS: usize = 10;
pub const MAX_TAG_LEN: usize = 55;
pub const MAX_METADATA_ENTRIES: usize = 20;
pub const MAX_METADATA_LEN: usize = 255;
pub const MIN_CONFIGURATION_ID_LEN: usize = 3;
pub const MAX_CONFIGURATION_ID_LEN: usize = 500;
pub const MAX_CONFIGURATION_VALUE_LEN: usize = 1024;

static CONFIGURATION_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(/[a-z0-9_\-]{3,50}/?){0,10}([a-z0-9_\-.]{3,170})?$")
        .expect("valid configuration id regex")
});

/// Service ids are storage keys: any non-empty string without `/` or control
/// characters. Stricter naming rules belong to the request boundary.
pub fn validate_service_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty()
        || id.chars().count() > MAX_SERVICE_ID_LEN
        || id.chars().any(|c| c == '/' || c.is_control())
    {
        return Err(ValidationError::new(
            "id",
            format!("must be 1 to {MAX_SERVICE_ID_LEN} characters without '/' or control characters"),
        ));
    }
    Ok(())
}

pub fn validate_heartbeat_timeout(timeout: u32) -> Result<(), ValidationError> {
    if (MIN_HEARTBEAT_TIMEOUT..=MAX_HEARTBEAT_TIMEOUT).contains(&timeout) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "heartbeat_timeout",
            format!("must be between {MIN_HEARTBEAT_TIMEOUT} and {MAX_HEARTBEAT_TIMEOUT}"),
        ))
    }
}

pub fn validate_tags(tags: &[String]) -> Result<(), ValidationError> {
    if tags.len() > MAX_TAGS {
        return Err(ValidationError::new(
            "tags",
            format!("at most {MAX_TAGS} tags are allowed"),
        ));
    }
    if let Some(tag) = tags
        .iter()
        .find(|t| t.is_empty() || t.chars().count() > MAX_TAG_LEN)
    {
        return Err(ValidationError::new(
            "tags",
            format!("tag '{tag}' must be 1 to {MAX_TAG_LEN} characters"),
        ));
    }
    Ok(())
}

pub fn validate_metadata(metadata: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(ValidationError::new(
            "metadata",
            format!("at most {MAX_METADATA_ENTRIES} entries are allowed"),
        ));
    }
    let bad = |s: &str| s.is_empty() || s.chars().count() > MAX_METADATA_LEN;
    if let Some((k, _)) = metadata.iter().find(|(k, v)| bad(k) || bad(v)) {
        return Err(ValidationError::new(
            "metadata",
            format!("entry '{k}' must have keys and values of 1 to {MAX_METADATA_LEN} characters"),
        ));
    }
    Ok(())
}

pub fn validate_configuration_id(id: &str) -> Result<(), ValidationError> {
    let len = id.chars().count();
    if !(MIN_CONFIGURATION_ID_LEN..=MAX_CONFIGURATION_ID_LEN).contains(&len)
        || !CONFIGURATION_ID_REGEX.is_match(id)
    {
        return Err(ValidationError::new(
            "id",
            "must be a slash separated path of [a-z0-9_-.] segments",
        ));
    }
    Ok(())
}

pub fn validate_configuration_value(value: &str) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len == 0 || len > MAX_CONFIGURATION_VALUE_LEN {
        return Err(ValidationError::new(
            "value",
            format!("must be 1 to {MAX_CONFIGURATION_VALUE_LEN} characters"),
        ));
    }
    Ok(())
}

/// Split a configuration path into `(namespace, key)`.
///
/// A trailing slash means the whole path is a namespace:
/// `/production/cassandra/` gives `("/production/cassandra", None)` while
/// `/production/cassandra` gives `("/production", Some("cassandra"))`.
pub fn split_namespace(path: &str) -> (String, Option<String>) {
    if let Some(ns) = path.strip_suffix('/') {
        let ns = if ns.is_empty() { "/" } else { ns };
        return (ns.to_string(), None);
    }
    match path.rfind('/') {
        Some(0) => ("/".to_string(), Some(path[1..].to_string())),
        Some(idx) => (path[..idx].to_string(), Some(path[idx + 1..].to_string())),
        None => ("/".to_string(), Some(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_id() {
        assert!(validate_service_id("api-server.1").is_ok());
        assert!(validate_service_id("API_Server").is_ok());
        assert!(validate_service_id("S").is_ok());
        assert!(validate_service_id("ab").is_ok());
        assert!(validate_service_id("").is_err());
        assert!(validate_service_id("a/b").is_err());
        assert!(validate_service_id("a\0b").is_err());
        assert!(validate_service_id(&"a".repeat(66)).is_err());
    }

    #[test]
    fn test_heartbeat_timeout_bounds() {
        assert!(validate_heartbeat_timeout(2).is_err());
        assert!(validate_heartbeat_timeout(3).is_ok());
        assert!(validate_heartbeat_timeout(120).is_ok());
        assert!(validate_heartbeat_timeout(121).is_err());
    }

    #[test]
    fn test_tags() {
        assert!(validate_tags(&["db".to_string()]).is_ok());
        assert!(validate_tags(&[String::new()]).is_err());
        assert!(validate_tags(&vec!["t".to_string(); 11]).is_err());
        assert!(validate_tags(&["x".repeat(56)]).is_err());
    }

    #[test]
    fn test_metadata() {
        let mut md = BTreeMap::new();
        md.insert("region".to_string(), "dfw".to_string());
        assert!(validate_metadata(&md).is_ok());
        md.insert("empty".to_string(), String::new());
        assert!(validate_metadata(&md).is_err());
    }

    #[test]
    fn test_configuration_id() {
        assert!(validate_configuration_id("/production/cassandra/listen_ip").is_ok());
        assert!(validate_configuration_id("listen_ip").is_ok());
        assert!(validate_configuration_id("/a/b").is_err());
        assert!(validate_configuration_id("ab").is_err());
    }

    #[test]
    fn test_configuration_value() {
        assert!(validate_configuration_value("127.0.0.1").is_ok());
        assert!(validate_configuration_value("").is_err());
        assert!(validate_configuration_value(&"v".repeat(1025)).is_err());
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(
            split_namespace("/production/cassandra/"),
            ("/production/cassandra".to_string(), None)
        );
        assert_eq!(
            split_namespace("/production/cassandra"),
            ("/production".to_string(), Some("cassandra".to_string()))
        );
        assert_eq!(
            split_namespace("/cassandra"),
            ("/".to_string(), Some("cassandra".to_string()))
        );
    }
}
