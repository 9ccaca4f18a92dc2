mod common;

use common::{setup, ORG_A, ORG_B};
use std::sync::Arc;
use tenant_guard::{
    models::{
        AuditActor, AuditEvent, AuditFilters, AuditResult, ExportFormat, MemberRole,
        PermissionSet, TenantContext, TenantScope,
    },
    services::{TenancyError, TenantConnection},
};

fn context(org: &str, user: &str, role: MemberRole) -> TenantContext {
    TenantContext::new(org, user, role, Arc::new(PermissionSet::default()))
}

#[tokio::test]
async fn test_cross_tenant_workspace_and_project_are_not_found() {
    let env = setup();
    let bob = context(ORG_A, "bob", MemberRole::Member);
    let validator = env.guard.validator();

    let ws = validator.validate_workspace_access(&bob, "ws-a").await.unwrap();
    assert_eq!(ws.organization_id, ORG_A);

    let err = validator
        .validate_workspace_access(&bob, "ws-b")
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AccessDenied(ref msg) if msg == "Workspace not found"));

    let err = validator
        .validate_project_access(&bob, "p-b", None)
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AccessDenied(ref msg) if msg == "Project not found"));

    let err = validator
        .validate_project_access(&bob, "p-a", Some("ws-other"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::AccessDenied(_)));
}

#[tokio::test]
async fn test_sessions_see_only_their_own_organization() {
    let env = setup();
    let isolation = env.guard.isolation();

    assert!(isolation.validate_policies("bob", ORG_A).await);
    assert!(isolation.validate_policies("dave", ORG_B).await);

    let report = isolation
        .test_data_isolation(&context(ORG_B, "dave", MemberRole::Member))
        .await;
    assert!(report.isolated, "unexpected issues: {:?}", report.issues);
}

#[tokio::test]
async fn test_leaking_policies_are_reported_as_breach() {
    let env = setup();
    env.store.set_leaking(true);

    let report = env
        .guard
        .isolation()
        .test_data_isolation(&context(ORG_A, "bob", MemberRole::Member))
        .await;
    assert!(!report.isolated);
    assert!(!report.issues.is_empty());

    env.guard.audit().flush().await.unwrap();
    let breach = env
        .store
        .audit_logs()
        .into_iter()
        .find(|l| l.action == "security.breach_detected")
        .expect("breach audited");
    assert_eq!(breach.result, AuditResult::Failure);
    assert_eq!(breach.organization_id.as_deref(), Some(ORG_A));
}

#[tokio::test]
async fn test_failed_flush_keeps_events_in_order() {
    let env = setup();
    let audit = env.guard.audit();
    let actor = AuditActor::user(ORG_A, "alice");

    for i in 0..3 {
        audit.log(&actor, AuditEvent::new(format!("project.step_{}", i), "project"));
    }

    env.store.fail_next_inserts(1);
    let err = audit.flush().await.unwrap_err();
    assert!(matches!(err, TenancyError::Durability(_)));
    assert_eq!(audit.pending(), 3);
    assert!(env.store.audit_logs().is_empty());

    assert_eq!(audit.flush().await.unwrap(), 3);
    let actions: Vec<String> = env
        .store
        .audit_logs()
        .into_iter()
        .map(|l| l.action)
        .collect();
    assert_eq!(
        actions,
        vec!["project.step_0", "project.step_1", "project.step_2"]
    );
    assert_eq!(audit.stats().failed_batches, 1);
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let env = setup();
    env.guard.start();

    let actor = AuditActor::user(ORG_A, "alice");
    for _ in 0..5 {
        env.guard
            .audit()
            .log(&actor, AuditEvent::new("workspace.view", "workspace"));
    }

    let flushed = env.guard.shutdown().await.unwrap();
    assert_eq!(flushed, 5);
    assert_eq!(env.guard.audit().pending(), 0);
    assert_eq!(env.store.audit_logs().len(), 5);
}

#[tokio::test]
async fn test_query_is_scoped_and_paginated() {
    let env = setup();
    let audit = env.guard.audit();

    for _ in 0..4 {
        audit.log(
            &AuditActor::user(ORG_A, "alice"),
            AuditEvent::new("project.view", "project"),
        );
    }
    audit.log(
        &AuditActor::user(ORG_B, "dave"),
        AuditEvent::new("project.view", "project"),
    );
    audit.flush().await.unwrap();

    let connection = TenantConnection::open(env.store.as_ref(), TenantScope::new("alice", ORG_A))
        .await
        .unwrap();
    let mut filters = AuditFilters::for_organization(ORG_A);
    filters.limit = 3;
    let page = audit.query(&connection, filters).await.unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.logs.len(), 3);
    assert!(page
        .logs
        .iter()
        .all(|l| l.organization_id.as_deref() == Some(ORG_A)));

    let foreign = audit
        .query(&connection, AuditFilters::for_organization(ORG_B))
        .await
        .unwrap();
    assert_eq!(foreign.total, 4);
    assert!(foreign
        .logs
        .iter()
        .all(|l| l.organization_id.as_deref() == Some(ORG_A)));
}

#[tokio::test]
async fn test_csv_export_escapes_fields() {
    let env = setup();
    let audit = env.guard.audit();

    audit.log_failure(
        &AuditActor::user(ORG_A, "alice"),
        AuditEvent::new("project.update", "project").with_resource_name("Rocket, \"v2\""),
        "line one\nline two",
    );
    audit.flush().await.unwrap();

    let connection = TenantConnection::open(env.store.as_ref(), TenantScope::new("alice", ORG_A))
        .await
        .unwrap();
    let csv = audit
        .export(&connection, ExportFormat::Csv, AuditFilters::for_organization(ORG_A))
        .await
        .unwrap();

    let mut reader = csv::Reader::from_reader(csv.as_bytes());
    let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0][8], "Rocket, \"v2\"");
    assert_eq!(&records[0][9], "failure");
    assert_eq!(&records[0][10], "line one\nline two");
}

#[tokio::test]
async fn test_api_key_access() {
    use chrono::{Duration, Utc};
    use service_core::utils::hashing::sha256_hex;
    use tenant_guard::models::ApiKey;

    let env = setup();
    let key = |id: &str, org: &str, raw: &str| ApiKey {
        id: id.to_string(),
        organization_id: org.to_string(),
        name: id.to_string(),
        key_hash: sha256_hex(raw),
        permissions: vec!["project:view".to_string()],
        expires_at: None,
        revoked_at: None,
        last_used_at: None,
    };
    env.store.add_api_key(key("k1", ORG_A, "raw-good"));
    let mut expired = key("k2", ORG_A, "raw-expired");
    expired.expires_at = Some(Utc::now() - Duration::hours(1));
    env.store.add_api_key(expired);

    let validator = env.guard.validator();
    let ok = validator
        .validate_api_key_access("raw-good", ORG_A, &["project:view"])
        .await
        .unwrap();
    assert_eq!(ok.id, "k1");

    for (raw, org) in [("raw-good", ORG_B), ("raw-expired", ORG_A), ("nope", ORG_A)] {
        let err = validator
            .validate_api_key_access(raw, org, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::Unauthorized));
    }

    let err = validator
        .validate_api_key_access("raw-good", ORG_A, &["project:delete"])
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::Forbidden { .. }));
}
