//! Membership model - binds a user to an organization with a role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Organization-level role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    Viewer,
    Guest,
}

const OWNER_PERMISSIONS: &[&str] = &["*"];

const ADMIN_PERMISSIONS: &[&str] = &[
    "organization:*",
    "member:*",
    "workspace:*",
    "project:*",
    "item:*",
    "api:*",
];

const MEMBER_PERMISSIONS: &[&str] = &[
    "workspace:view",
    "workspace:create",
    "project:view",
    "project:create",
    "item:view",
    "item:create",
    "api:access",
];

const VIEWER_PERMISSIONS: &[&str] = &["workspace:view", "project:view", "item:view"];

const GUEST_PERMISSIONS: &[&str] = &["workspace:view", "project:view", "item:view"];

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
            MemberRole::Viewer => "viewer",
            MemberRole::Guest => "guest",
        }
    }

    /// Static role-to-permission defaults.
    pub fn default_permissions(&self) -> &'static [&'static str] {
        match self {
            MemberRole::Owner => OWNER_PERMISSIONS,
            MemberRole::Admin => ADMIN_PERMISSIONS,
            MemberRole::Member => MEMBER_PERMISSIONS,
            MemberRole::Viewer => VIEWER_PERMISSIONS,
            MemberRole::Guest => GUEST_PERMISSIONS,
        }
    }

    /// Owners and admins bypass resource-level membership checks.
    pub fn is_admin_or_owner(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "owner" => Ok(MemberRole::Owner),
            "admin" => Ok(MemberRole::Admin),
            "member" => Ok(MemberRole::Member),
            "viewer" => Ok(MemberRole::Viewer),
            "guest" => Ok(MemberRole::Guest),
            _ => Err(format!("Invalid member role: {}", s)),
        }
    }
}

/// Membership lifecycle. Removal is a status transition, never a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Pending,
    Suspended,
    Removed,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Pending => "pending",
            MembershipStatus::Suspended => "suspended",
            MembershipStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(MembershipStatus::Active),
            "pending" => Ok(MembershipStatus::Pending),
            "suspended" => Ok(MembershipStatus::Suspended),
            "removed" => Ok(MembershipStatus::Removed),
            _ => Err(format!("Invalid membership status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: String,
    pub organization_id: String,
    pub role: MemberRole,
    pub status: MembershipStatus,
    /// Explicit grants on top of the role defaults, in assignment order.
    pub permissions: Vec<String>,
    /// Per-member overrides managed by organization admins.
    pub custom_permissions: Vec<String>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            organization_id: organization_id.into(),
            role,
            status: MembershipStatus::Active,
            permissions: Vec::new(),
            custom_permissions: Vec::new(),
            joined_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: MembershipStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_permissions(mut self, permissions: Vec<String>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }

    /// Role defaults followed by explicit and custom grants, deduplicated in order.
    pub fn effective_permissions(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let grants = self
            .role
            .default_permissions()
            .iter()
            .map(|p| p.to_string())
            .chain(self.permissions.iter().cloned())
            .chain(self.custom_permissions.iter().cloned());
        for grant in grants {
            if !out.contains(&grant) {
                out.push(grant);
            }
        }
        out
    }
}
