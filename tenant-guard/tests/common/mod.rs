#![allow(dead_code)]

use axum::http::{request::Parts, Request};
use serde_json::json;
use std::sync::Arc;
use tenant_guard::{
    config::TenancyConfig,
    models::{
        MemberRole, Membership, MembershipStatus, Organization, Project, UserAccount, Workspace,
    },
    services::MockDatastore,
    Collaborators, TenantGuard,
};

pub const ORG_A: &str = "org-a";
pub const ORG_B: &str = "org-b";

pub struct TestEnv {
    pub store: Arc<MockDatastore>,
    pub guard: Arc<TenantGuard>,
}

pub fn test_config() -> TenancyConfig {
    let mut config = TenancyConfig::default();
    config.jwt.secret = "test-secret-key-that-is-long-enough-123".to_string();
    config.audit.flush_interval_ms = 60_000;
    config
}

/// Two organizations with a handful of members:
///
/// - alice: owner of org-a
/// - bob: member of org-a with explicit `workspace:view` and `project:*`
/// - vic: viewer of org-a
/// - sam: suspended member of org-a
/// - dave: member of org-b
pub fn seeded_store() -> Arc<MockDatastore> {
    let store = Arc::new(MockDatastore::new());

    store.add_organization(Organization::new(ORG_A, "Acme"));
    store.add_organization(Organization::new(ORG_B, "Globex"));

    for user in ["alice", "bob", "vic", "sam", "dave"] {
        store.add_user(UserAccount::new(user, format!("{}@example.com", user)));
        store.add_token(&format!("token-{}", user), user);
    }

    store.add_membership(Membership::new("alice", ORG_A, MemberRole::Owner));
    store.add_membership(
        Membership::new("bob", ORG_A, MemberRole::Member)
            .with_permissions(vec!["workspace:view".to_string(), "project:*".to_string()]),
    );
    store.add_membership(Membership::new("vic", ORG_A, MemberRole::Viewer));
    store.add_membership(
        Membership::new("sam", ORG_A, MemberRole::Member).with_status(MembershipStatus::Suspended),
    );
    store.add_membership(Membership::new("dave", ORG_B, MemberRole::Member));

    store.add_conditions(
        ORG_A,
        "bob",
        "invoice:approve",
        vec![json!({ "field": "request.amount", "operator": "lte", "value": 1000 })],
    );

    store.add_workspace(
        Workspace {
            id: "ws-a".to_string(),
            organization_id: ORG_A.to_string(),
            name: "Acme Main".to_string(),
        },
        &["bob"],
    );
    store.add_workspace(
        Workspace {
            id: "ws-b".to_string(),
            organization_id: ORG_B.to_string(),
            name: "Globex Main".to_string(),
        },
        &["dave"],
    );
    store.add_project(
        Project {
            id: "p-a".to_string(),
            organization_id: ORG_A.to_string(),
            workspace_id: "ws-a".to_string(),
            name: "Rocket".to_string(),
        },
        &["bob"],
    );
    store.add_project(
        Project {
            id: "p-b".to_string(),
            organization_id: ORG_B.to_string(),
            workspace_id: "ws-b".to_string(),
            name: "Widget".to_string(),
        },
        &["dave"],
    );

    store.add_billing_rows(ORG_A, 2);
    store.add_billing_rows(ORG_B, 4);
    store
}

pub fn setup_with(config: TenancyConfig) -> TestEnv {
    let store = seeded_store();
    let guard = Arc::new(TenantGuard::new(
        config,
        Collaborators::from_mock(store.clone()),
    ));
    TestEnv { store, guard }
}

pub fn setup() -> TestEnv {
    setup_with(test_config())
}

pub fn request(method: &str, uri: &str, user: Option<&str>) -> Parts {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("authorization", format!("Bearer token-{}", user));
    }
    builder.body(()).unwrap().into_parts().0
}
