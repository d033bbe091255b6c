//! Registry records and request types

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vigil_common::validation::{
    validate_heartbeat_timeout, validate_metadata, validate_service_id, validate_tags,
};
use vigil_common::{
    DEFAULT_CONFIGURATION_VALUES_LIMIT, DEFAULT_SERVICES_LIMIT, LIMIT_CONFIGURATION_VALUES,
    LIMIT_SERVICES, PAGINATION_DEFAULT_LIMIT, PAGINATION_MAX_LIMIT, Token, ValidationError,
};

/// Column families and fixed column names
pub mod schema {
    pub const ACCOUNTS: &str = "accounts";
    pub const METADATA: &str = "metadata";
    pub const SERVICES: &str = "services";
    pub const SERVICE_TAGS: &str = "service_tags";
    pub const SERVICE_MARKERS: &str = "service_markers";
    pub const HEARTBEAT_MARKERS: &str = "heartbeat_markers";
    pub const LAST_HEARTBEATS: &str = "last_service_heartbeats";
    pub const EVENTS: &str = "events";
    pub const CONFIGURATION_VALUES: &str = "configuration_values";
    pub const ACCOUNT_ACTIVITY: &str = "account_activity";
    pub const ACCOUNT_INDEX: &str = "account_index";

    pub const ACCOUNT_COLUMN: &str = "account";
    pub const LAST_RECTIFICATION_COLUMN: &str = "last_rectification";
    /// Single row of the account index, one column per account id
    pub const ACCOUNT_INDEX_ROW: &str = "all";

    pub fn tag_column(tag: &str, service_id: &str) -> String {
        format!("{tag}:{service_id}")
    }

    pub fn tag_prefix(tag: &str) -> String {
        format!("{tag}:")
    }
}

/// Tenant owning every other record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    #[serde(default)]
    pub limits: BTreeMap<String, u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Account {
    pub fn default_limits() -> BTreeMap<String, u64> {
        BTreeMap::from([
            (LIMIT_SERVICES.to_string(), DEFAULT_SERVICES_LIMIT),
            (
                LIMIT_CONFIGURATION_VALUES.to_string(),
                DEFAULT_CONFIGURATION_VALUES_LIMIT,
            ),
        ])
    }

    pub fn limit(&self, resource: &str) -> Option<u64> {
        self.limits.get(resource).copied()
    }
}

/// Partial account update; `None` leaves the field unchanged.
/// Limits are merged per resource, metadata is replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUpdate {
    pub limits: Option<BTreeMap<String, u64>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl AccountUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(metadata) = &self.metadata {
            validate_metadata(metadata)?;
        }
        Ok(())
    }
}

/// Per-account rectification state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMetadata {
    /// Everything at or before this token has been rectified
    pub last_rectification: Token,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub id: String,
    pub heartbeat_timeout: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>, heartbeat_timeout: u32) -> Self {
        Self {
            id: id.into(),
            heartbeat_timeout,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_service_id(&self.id)?;
        validate_heartbeat_timeout(self.heartbeat_timeout)?;
        validate_tags(&self.tags)?;
        validate_metadata(&self.metadata)
    }
}

/// Partial update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub heartbeat_timeout: Option<u32>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ServiceUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(timeout) = self.heartbeat_timeout {
            validate_heartbeat_timeout(timeout)?;
        }
        if let Some(tags) = &self.tags {
            validate_tags(tags)?;
        }
        if let Some(metadata) = &self.metadata {
            validate_metadata(metadata)?;
        }
        Ok(())
    }
}

/// Stored form of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub heartbeat_timeout: u32,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl From<ServiceSpec> for ServiceRecord {
    fn from(spec: ServiceSpec) -> Self {
        Self {
            id: spec.id,
            heartbeat_timeout: spec.heartbeat_timeout,
            tags: spec.tags,
            metadata: spec.metadata,
        }
    }
}

impl ServiceRecord {
    pub fn timeout_millis(&self) -> i64 {
        i64::from(self.heartbeat_timeout) * 1000
    }

    pub fn apply(&mut self, update: ServiceUpdate) {
        if let Some(timeout) = update.heartbeat_timeout {
            self.heartbeat_timeout = timeout;
        }
        if let Some(tags) = update.tags {
            self.tags = tags;
        }
        if let Some(metadata) = update.metadata {
            self.metadata = metadata;
        }
    }

    /// Payload carried by service events
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "heartbeat_timeout": self.heartbeat_timeout,
            "tags": self.tags,
            "metadata": self.metadata,
        })
    }
}

/// A service as returned to callers, with `last_seen` joined in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub heartbeat_timeout: u32,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    /// Epoch milliseconds of the last accepted heartbeat
    pub last_seen: Option<i64>,
}

impl Service {
    pub fn from_record(record: ServiceRecord, last_seen: Option<i64>) -> Self {
        Self {
            id: record.id,
            heartbeat_timeout: record.heartbeat_timeout,
            tags: record.tags,
            metadata: record.metadata,
            last_seen,
        }
    }
}

/// Value stored under a heartbeat marker token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMarker {
    pub service_id: String,
}

/// Value stored in the tag index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagEntry {
    pub tag: String,
    pub service_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "service.join")]
    ServiceJoin,
    #[serde(rename = "service.timeout")]
    ServiceTimeout,
    #[serde(rename = "service.remove")]
    ServiceRemove,
    #[serde(rename = "configuration_value.update")]
    ConfigurationValueUpdate,
    #[serde(rename = "configuration_value.remove")]
    ConfigurationValueRemove,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ServiceJoin => "service.join",
            EventType::ServiceTimeout => "service.timeout",
            EventType::ServiceRemove => "service.remove",
            EventType::ConfigurationValueUpdate => "configuration_value.update",
            EventType::ConfigurationValueRemove => "configuration_value.remove",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service.join" => Ok(EventType::ServiceJoin),
            "service.timeout" => Ok(EventType::ServiceTimeout),
            "service.remove" => Ok(EventType::ServiceRemove),
            "configuration_value.update" => Ok(EventType::ConfigurationValueUpdate),
            "configuration_value.remove" => Ok(EventType::ConfigurationValueRemove),
            other => Err(ValidationError::new(
                "type",
                format!("unknown event type '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Token,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationValue {
    pub id: String,
    pub value: String,
    /// Epoch milliseconds
    pub last_modified: i64,
}

/// Liveness of a service, derived from its marker and the watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    /// Deadline passed, no sweep has covered it yet
    Overdue,
    /// At or below the watermark, or no marker at all
    Reaped,
}

impl Liveness {
    pub fn derive(marker: Option<Token>, now_millis: i64, watermark: Token) -> Self {
        match marker {
            None => Liveness::Reaped,
            Some(token) if token <= watermark => Liveness::Reaped,
            Some(token) if token.timestamp_millis() <= now_millis => Liveness::Overdue,
            Some(_) => Liveness::Alive,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub rectify: bool,
}

impl ReadOptions {
    pub fn rectified() -> Self {
        Self { rectify: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    /// Last key of the previous page; the page starts after it
    pub marker: Option<String>,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            marker: None,
            limit: PAGINATION_DEFAULT_LIMIT,
        }
    }
}

impl Pagination {
    pub fn new(marker: Option<String>, limit: Option<usize>) -> Self {
        Self {
            marker,
            limit: limit
                .unwrap_or(PAGINATION_DEFAULT_LIMIT)
                .clamp(1, PAGINATION_MAX_LIMIT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub count: usize,
    pub limit: usize,
    pub marker: Option<String>,
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub values: Vec<T>,
    pub metadata: PageMetadata,
}

impl<T> Page<T> {
    /// Build a page from up to `limit + 1` ordered items keyed by `key`
    pub fn from_overfetch(mut items: Vec<T>, pagination: &Pagination, key: impl Fn(&T) -> String) -> Self {
        let has_more = items.len() > pagination.limit;
        items.truncate(pagination.limit);
        let next_marker = if has_more { items.last().map(&key) } else { None };
        Self {
            metadata: PageMetadata {
                count: items.len(),
                limit: pagination.limit,
                marker: pagination.marker.clone(),
                next_marker,
            },
            values: items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness() {
        let watermark = Token::high(1_000);
        assert_eq!(Liveness::derive(None, 5_000, watermark), Liveness::Reaped);
        assert_eq!(
            Liveness::derive(Some(Token::new(900)), 5_000, watermark),
            Liveness::Reaped
        );
        assert_eq!(
            Liveness::derive(Some(Token::new(4_000)), 5_000, watermark),
            Liveness::Overdue
        );
        assert_eq!(
            Liveness::derive(Some(Token::new(6_000)), 5_000, watermark),
            Liveness::Alive
        );
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&EventType::ServiceTimeout).unwrap();
        assert_eq!(json, "\"service.timeout\"");
        assert_eq!(
            "configuration_value.remove".parse::<EventType>().unwrap(),
            EventType::ConfigurationValueRemove
        );
        assert!("service.unknown".parse::<EventType>().is_err());
    }

    #[test]
    fn test_spec_validation() {
        assert!(ServiceSpec::new("api", 30).validate().is_ok());
        assert!(ServiceSpec::new("api", 2).validate().is_err());
        assert!(ServiceSpec::new("a", 30).validate().is_err());
        assert!(
            ServiceUpdate {
                tags: Some(vec![String::new()]),
                ..Default::default()
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn test_record_apply_update() {
        let mut record = ServiceRecord::from(ServiceSpec::new("api", 30).with_tags(["db"]));
        record.apply(ServiceUpdate {
            heartbeat_timeout: Some(60),
            ..Default::default()
        });
        assert_eq!(record.heartbeat_timeout, 60);
        assert_eq!(record.tags, vec!["db"]);
        assert_eq!(record.snapshot()["heartbeat_timeout"], 60);
    }

    #[test]
    fn test_pagination_clamps() {
        assert_eq!(Pagination::new(None, Some(5000)).limit, PAGINATION_MAX_LIMIT);
        assert_eq!(Pagination::new(None, Some(0)).limit, 1);
        assert_eq!(Pagination::new(None, None).limit, PAGINATION_DEFAULT_LIMIT);
    }

    #[test]
    fn test_page_from_overfetch() {
        let pagination = Pagination::new(None, Some(2));
        let page = Page::from_overfetch(vec![1, 2, 3], &pagination, |v| v.to_string());
        assert_eq!(page.values, vec![1, 2]);
        assert_eq!(page.metadata.next_marker.as_deref(), Some("2"));

        let page = Page::from_overfetch(vec![1], &pagination, |v| v.to_string());
        assert_eq!(page.metadata.next_marker, None);
        assert_eq!(page.metadata.count, 1);
    }
}
