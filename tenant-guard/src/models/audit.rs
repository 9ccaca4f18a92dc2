//! Audit model - write intents, persisted rows and query filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Actions whose records are flushed immediately instead of batched.
pub const CRITICAL_ACTIONS: &[&str] = &[
    "organization.deleted",
    "member.removed",
    "auth.login_failed",
    "security.breach_detected",
    "billing.payment_failed",
    "data.deleted",
];

pub fn is_critical_action(action: &str) -> bool {
    CRITICAL_ACTIONS.contains(&action)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
    Partial,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
            AuditResult::Partial => "partial",
        }
    }
}

impl FromStr for AuditResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditResult::Success),
            "failure" => Ok(AuditResult::Failure),
            "partial" => Ok(AuditResult::Partial),
            _ => Err(format!("Invalid audit result: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    ApiKey,
    System,
    Anonymous,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::ApiKey => "api_key",
            ActorType::System => "system",
            ActorType::Anonymous => "anonymous",
        }
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorType::User),
            "api_key" => Ok(ActorType::ApiKey),
            "system" => Ok(ActorType::System),
            "anonymous" => Ok(ActorType::Anonymous),
            _ => Err(format!("Invalid actor type: {}", s)),
        }
    }
}

/// Who did it and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditActor {
    pub organization_id: Option<String>,
    pub actor_id: Option<String>,
    pub actor_type: Option<ActorType>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditActor {
    pub fn user(organization_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            organization_id: Some(organization_id.into()),
            actor_id: Some(user_id.into()),
            actor_type: Some(ActorType::User),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn system(organization_id: Option<String>) -> Self {
        Self {
            organization_id,
            actor_id: None,
            actor_type: Some(ActorType::System),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn with_client(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

/// What happened. Enriched into an [`AuditLog`] when queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub changes: Option<Value>,
    pub metadata: Option<Value>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: None,
            resource_name: None,
            changes: None,
            metadata: None,
        }
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_resource_name(mut self, resource_name: impl Into<String>) -> Self {
        self.resource_name = Some(resource_name.into());
        self
    }

    pub fn with_changes(mut self, changes: Value) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_critical(&self) -> bool {
        is_critical_action(&self.action)
    }
}

/// Persisted, append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub organization_id: Option<String>,
    pub actor_id: Option<String>,
    pub actor_type: ActorType,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub changes: Option<Value>,
    pub metadata: Option<Value>,
    pub result: AuditResult,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLog {
    pub fn from_event(
        actor: &AuditActor,
        event: AuditEvent,
        result: AuditResult,
        error_message: Option<String>,
    ) -> Self {
        let actor_type = actor.actor_type.unwrap_or(if actor.actor_id.is_some() {
            ActorType::User
        } else {
            ActorType::Anonymous
        });

        Self {
            id: Uuid::new_v4(),
            organization_id: actor.organization_id.clone(),
            actor_id: actor.actor_id.clone(),
            actor_type,
            action: event.action,
            resource_type: event.resource_type,
            resource_id: event.resource_id,
            resource_name: event.resource_name,
            changes: event.changes,
            metadata: event.metadata,
            result,
            error_message,
            ip_address: actor.ip_address.clone(),
            user_agent: actor.user_agent.clone(),
            created_at: Utc::now(),
        }
    }
}

/// One action or several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionFilter {
    One(String),
    Many(Vec<String>),
}

impl ActionFilter {
    pub fn matches(&self, action: &str) -> bool {
        match self {
            ActionFilter::One(a) => a == action,
            ActionFilter::Many(list) => list.iter().any(|a| a == action),
        }
    }

    pub fn as_slice(&self) -> &[String] {
        match self {
            ActionFilter::One(a) => std::slice::from_ref(a),
            ActionFilter::Many(list) => list,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

impl Default for AuditFilters {
    fn default() -> Self {
        Self {
            organization_id: None,
            actor_id: None,
            action: None,
            resource_type: None,
            from: None,
            to: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl AuditFilters {
    pub fn for_organization(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: Some(organization_id.into()),
            ..Self::default()
        }
    }

    /// Clamp pagination to sane bounds.
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, 1000);
        self.offset = self.offset.max(0);
        self
    }

    pub fn matches(&self, log: &AuditLog) -> bool {
        if let Some(org) = &self.organization_id {
            if log.organization_id.as_deref() != Some(org.as_str()) {
                return false;
            }
        }
        if let Some(actor) = &self.actor_id {
            if log.actor_id.as_deref() != Some(actor.as_str()) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if !action.matches(&log.action) {
                return false;
            }
        }
        if let Some(resource_type) = &self.resource_type {
            if &log.resource_type != resource_type {
                return false;
            }
        }
        if let Some(from) = self.from {
            if log.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if log.created_at > to {
                return false;
            }
        }
        true
    }
}

/// A newest-first page of audit rows.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub logs: Vec<AuditLog>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(format!("Unsupported export format: {}", s)),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => f.write_str("json"),
            ExportFormat::Csv => f.write_str("csv"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn log(action: &str, org: &str) -> AuditLog {
        AuditLog::from_event(
            &AuditActor::user(org, "user-1"),
            AuditEvent::new(action, "project"),
            AuditResult::Success,
            None,
        )
    }

    #[test]
    fn test_critical_actions() {
        assert!(AuditEvent::new("member.removed", "member").is_critical());
        assert!(!AuditEvent::new("project.created", "project").is_critical());
    }

    #[test]
    fn test_filters_match_action_list() {
        let filters = AuditFilters {
            action: Some(ActionFilter::Many(vec![
                "project.created".into(),
                "project.deleted".into(),
            ])),
            ..AuditFilters::for_organization("org-a")
        };
        assert!(filters.matches(&log("project.deleted", "org-a")));
        assert!(!filters.matches(&log("project.updated", "org-a")));
        assert!(!filters.matches(&log("project.deleted", "org-b")));
    }

    #[test]
    fn test_filters_date_range() {
        let entry = log("project.created", "org-a");
        let filters = AuditFilters {
            from: Some(entry.created_at - Duration::minutes(1)),
            to: Some(entry.created_at + Duration::minutes(1)),
            ..AuditFilters::default()
        };
        assert!(filters.matches(&entry));

        let filters = AuditFilters {
            from: Some(entry.created_at + Duration::minutes(1)),
            ..AuditFilters::default()
        };
        assert!(!filters.matches(&entry));
    }

    #[test]
    fn test_anonymous_actor_when_unknown() {
        let entry = AuditLog::from_event(
            &AuditActor::default(),
            AuditEvent::new("workspace.view", "workspace"),
            AuditResult::Failure,
            Some("Invalid tenant context".into()),
        );
        assert_eq!(entry.actor_type, ActorType::Anonymous);
        assert_eq!(entry.result, AuditResult::Failure);
    }

    #[test]
    fn test_action_filter_deserializes_single_or_list() {
        let one: ActionFilter = serde_json::from_str(r#""member.removed""#).unwrap();
        assert_eq!(one, ActionFilter::One("member.removed".into()));
        let many: ActionFilter = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(many.as_slice().len(), 2);
    }
}
