//! Directory records the validator reads: users, organizations, resources, API keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub email: String,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    pub banned_until: Option<DateTime<Utc>>,
}

impl UserAccount {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            email_confirmed_at: Some(Utc::now()),
            banned_until: None,
        }
    }

    pub fn is_banned_at(&self, now: DateTime<Utc>) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }

    pub fn is_confirmed(&self) -> bool {
        self.email_confirmed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Active,
    Suspended,
    Archived,
}

impl OrganizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationStatus::Active => "active",
            OrganizationStatus::Suspended => "suspended",
            OrganizationStatus::Archived => "archived",
        }
    }
}

impl FromStr for OrganizationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OrganizationStatus::Active),
            "suspended" => Ok(OrganizationStatus::Suspended),
            "archived" => Ok(OrganizationStatus::Archived),
            _ => Err(format!("Invalid organization status: {}", s)),
        }
    }
}

impl fmt::Display for OrganizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
}

impl FromStr for BillingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(BillingStatus::Active),
            "trialing" => Ok(BillingStatus::Trialing),
            "past_due" => Ok(BillingStatus::PastDue),
            "canceled" => Ok(BillingStatus::Canceled),
            "unpaid" => Ok(BillingStatus::Unpaid),
            _ => Err(format!("Invalid billing status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub status: OrganizationStatus,
    pub billing_status: Option<BillingStatus>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Organization {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: OrganizationStatus::Active,
            billing_status: Some(BillingStatus::Active),
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_past_due(&self) -> bool {
        matches!(
            self.billing_status,
            Some(BillingStatus::PastDue) | Some(BillingStatus::Unpaid)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub organization_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub organization_id: String,
    pub workspace_id: String,
    pub name: String,
}

/// Stored API key. Only the SHA-256 hash of the secret is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub key_hash: String,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Recent activity counters for one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecuritySignals {
    pub failed_logins_24h: u32,
    pub distinct_ips_1h: u32,
    pub permission_denials_1h: u32,
}

/// Tables covered by the isolation canaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolatedTable {
    Organizations,
    Workspaces,
    Members,
    AuditLogs,
    Billing,
}

impl IsolatedTable {
    /// Tables that must show zero cross-tenant rows.
    pub const CANARY_TABLES: [IsolatedTable; 4] = [
        IsolatedTable::Workspaces,
        IsolatedTable::Members,
        IsolatedTable::AuditLogs,
        IsolatedTable::Billing,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            IsolatedTable::Organizations => "organizations",
            IsolatedTable::Workspaces => "workspaces",
            IsolatedTable::Members => "organization_members",
            IsolatedTable::AuditLogs => "audit_logs",
            IsolatedTable::Billing => "billing_subscriptions",
        }
    }
}

impl fmt::Display for IsolatedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}
