mod common;

use common::{request, setup, setup_with, test_config, ORG_A, ORG_B};
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tenant_guard::{
    middleware::{PipelineError, RequestStage, RouteGuard},
    models::{AuditLog, AuditResult, BillingStatus, Organization, TenantContext},
    services::{TenancyError, TenantConnection},
};

fn ok_handler(
    _ctx: TenantContext,
    _conn: TenantConnection,
) -> impl std::future::Future<Output = Result<&'static str, String>> + Send {
    async { Ok("done") }
}

fn outcomes_for(logs: &[AuditLog], action: &str) -> Vec<AuditLog> {
    logs.iter().filter(|l| l.action == action).cloned().collect()
}

#[tokio::test]
async fn test_member_with_resource_wildcard_is_allowed() {
    let env = setup();
    let route = RouteGuard::new("project", "delete");
    let parts = request("DELETE", "/organizations/org-a/projects/p-a", Some("bob"));

    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;

    assert_eq!(outcome.result.unwrap(), "done");
    assert_eq!(outcome.stage, RequestStage::Responded);
    assert!(outcome.diagnostics.isolation_enforced);
    assert_eq!(outcome.diagnostics.tenant_id.as_deref(), Some(ORG_A));

    let scopes = env.store.session_scopes();
    assert_eq!(scopes.last().unwrap().organization_id, ORG_A);
    assert_eq!(scopes.last().unwrap().user_id, "bob");

    env.guard.audit().flush().await.unwrap();
    let logs = env.store.audit_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].action, "project.delete");
    assert_eq!(logs[0].result, AuditResult::Success);
    assert_eq!(logs[0].actor_id.as_deref(), Some("bob"));
    assert_eq!(logs[0].organization_id.as_deref(), Some(ORG_A));
}

#[tokio::test]
async fn test_viewer_cannot_create_workspace() {
    let env = setup();
    let route = RouteGuard::new("workspace", "create");
    let parts = request("POST", "/organizations/org-a/workspaces", Some("vic"));

    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;

    match outcome.result {
        Err(PipelineError::Rejected(TenancyError::Forbidden { permission })) => {
            assert_eq!(permission, "workspace:create");
        }
        other => panic!("expected forbidden, got {:?}", other.map(|_| ()).err()),
    }

    env.guard.audit().flush().await.unwrap();
    let logs = env.store.audit_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].result, AuditResult::Failure);
    assert!(logs[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("workspace:create"));
}

#[tokio::test]
async fn test_suspended_member_gets_uniform_unauthorized() {
    let env = setup();
    let route = RouteGuard::new("workspace", "view");
    let parts = request("GET", "/organizations/org-a/workspaces", Some("sam"));

    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;

    assert!(matches!(
        outcome.result,
        Err(PipelineError::Rejected(TenancyError::Unauthorized))
    ));
    assert!(env.store.session_scopes().is_empty());

    env.guard.audit().flush().await.unwrap();
    let logs = env.store.audit_logs();
    assert_eq!(
        logs.iter().filter(|l| l.result == AuditResult::Success).count(),
        0
    );
    assert_eq!(
        logs.iter().filter(|l| l.result == AuditResult::Failure).count(),
        1
    );
    assert_eq!(logs[0].actor_id.as_deref(), Some("sam"));
    assert_eq!(logs[0].error_message.as_deref(), Some("Invalid tenant context"));
}

#[tokio::test]
async fn test_conditional_grant_follows_request_context() {
    let env = setup();
    let route = RouteGuard::new("invoice", "approve");
    let parts = request("POST", "/organizations/org-a/invoices/inv-1/approve", Some("bob"));

    let small = env
        .guard
        .pipeline()
        .run(
            &route,
            &parts,
            Some(json!({ "request": { "amount": 500 } })),
            ok_handler,
        )
        .await;
    assert!(small.result.is_ok());

    let large = env
        .guard
        .pipeline()
        .run(
            &route,
            &parts,
            Some(json!({ "request": { "amount": 5000 } })),
            ok_handler,
        )
        .await;
    assert!(matches!(
        large.result,
        Err(PipelineError::Rejected(TenancyError::Forbidden { .. }))
    ));

    let without_context = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
    assert!(without_context.result.is_err());
}

#[tokio::test]
async fn test_missing_credential_is_audited_anonymously() {
    let env = setup();
    let route = RouteGuard::new("workspace", "view");
    let parts = request("GET", "/organizations/org-a/workspaces", None);

    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
    assert!(matches!(
        outcome.result,
        Err(PipelineError::Rejected(TenancyError::Unauthorized))
    ));
    assert_eq!(outcome.stage, RequestStage::Responded);

    env.guard.audit().flush().await.unwrap();
    let logs = env.store.audit_logs();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].actor_id.is_none());
}

#[tokio::test]
async fn test_foreign_organization_is_unauthorized() {
    let env = setup();
    let route = RouteGuard::new("workspace", "view");
    let parts = request("GET", "/organizations/org-b/workspaces", Some("bob"));

    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
    assert!(matches!(
        outcome.result,
        Err(PipelineError::Rejected(TenancyError::Unauthorized))
    ));
    assert!(env
        .store
        .session_scopes()
        .iter()
        .all(|s| s.organization_id != ORG_B));
}

#[tokio::test]
async fn test_handler_failure_is_audited_and_returned() {
    let env = setup();
    let route = RouteGuard::new("project", "update");
    let parts = request("PATCH", "/organizations/org-a/projects/p-a", Some("bob"));

    let outcome = env
        .guard
        .pipeline()
        .run(&route, &parts, None, |_ctx, _conn| async {
            Err::<(), _>("upstream exploded".to_string())
        })
        .await;

    match outcome.result {
        Err(PipelineError::Handler(message)) => assert_eq!(message, "upstream exploded"),
        _ => panic!("handler error should pass through"),
    }
    assert_eq!(outcome.stage, RequestStage::Responded);

    env.guard.audit().flush().await.unwrap();
    let logs = env.store.audit_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].result, AuditResult::Failure);
    assert_eq!(logs[0].error_message.as_deref(), Some("upstream exploded"));
}

#[tokio::test]
async fn test_permissions_fetched_once_per_ttl() {
    let env = setup();
    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));

    for _ in 0..3 {
        let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
        assert!(outcome.result.is_ok());
    }
    assert_eq!(env.store.rpc_call_count(), 1);
}

#[tokio::test]
async fn test_past_due_billing_is_a_warning_by_default() {
    let env = setup();
    let mut org = Organization::new(ORG_A, "Acme");
    org.billing_status = Some(BillingStatus::PastDue);
    env.store.add_organization(org);

    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));
    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;

    assert!(outcome.result.is_ok());
    assert_eq!(outcome.diagnostics.warnings, vec!["Billing is past due".to_string()]);
}

#[tokio::test]
async fn test_promoted_past_due_billing_rejects() {
    let mut config = test_config();
    config.validation.promote_past_due_billing = true;
    let env = setup_with(config);
    let mut org = Organization::new(ORG_A, "Acme");
    org.billing_status = Some(BillingStatus::Unpaid);
    env.store.add_organization(org);

    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));
    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;

    match outcome.result {
        Err(PipelineError::Rejected(TenancyError::ContextInvalid { errors })) => {
            assert_eq!(errors, vec!["Billing is past due".to_string()]);
        }
        _ => panic!("expected context validation failure"),
    }
    assert!(env.store.session_scopes().is_empty());
}

#[tokio::test]
async fn test_disabled_isolation_stops_request() {
    let env = setup();
    env.store.set_isolation_enabled(false);

    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));
    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;

    assert!(matches!(
        outcome.result,
        Err(PipelineError::Rejected(TenancyError::IsolationDisabled))
    ));

    env.guard.audit().flush().await.unwrap();
    let logs = env.store.audit_logs();
    assert!(logs.iter().any(|l| l.action == "security.breach_detected"));
    assert!(logs
        .iter()
        .any(|l| l.action == "project.view" && l.result == AuditResult::Failure));
}

#[tokio::test]
async fn test_tenant_rate_limit() {
    let mut config = test_config();
    config.rate_limit.max_requests = 2;
    let env = setup_with(config);

    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));
    for _ in 0..2 {
        let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
        assert!(outcome.result.is_ok());
    }

    let limited = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
    match limited.result {
        Err(PipelineError::Rejected(TenancyError::RateLimited { retry_after_secs })) => {
            assert!(retry_after_secs >= 1);
        }
        _ => panic!("expected rate limit"),
    }

    // Other tenants keep their own window.
    let other = request("GET", "/organizations/org-b/projects", Some("dave"));
    let outcome = env.guard.pipeline().run(&route, &other, None, ok_handler).await;
    assert!(outcome.result.is_ok());
}

#[tokio::test]
async fn test_any_and_all_requirements() {
    let env = setup();
    let parts = request("GET", "/organizations/org-a/reports", Some("vic"));

    let any = RouteGuard::any_of("report", "view", &["report:view", "project:view"]);
    let outcome = env.guard.pipeline().run(&any, &parts, None, ok_handler).await;
    assert!(outcome.result.is_ok());

    let all = RouteGuard::all_of("report", "view", &["project:view", "project:update"]);
    let outcome = env.guard.pipeline().run(&all, &parts, None, ok_handler).await;
    match outcome.result {
        Err(PipelineError::Rejected(TenancyError::Forbidden { permission })) => {
            assert_eq!(permission, "project:update");
        }
        _ => panic!("expected forbidden"),
    }

    let open = RouteGuard::authenticated("profile", "view");
    let outcome = env.guard.pipeline().run(&open, &parts, None, ok_handler).await;
    assert!(outcome.result.is_ok());
}

#[tokio::test]
async fn test_handler_panic_is_audited_once_and_resumed() {
    let env = setup();
    let route = RouteGuard::new("project", "update");
    let parts = request("PATCH", "/organizations/org-a/projects/p-a", Some("bob"));

    let run = env
        .guard
        .pipeline()
        .run(&route, &parts, None, |_ctx, _conn| async {
            if parts.uri.path().starts_with("/organizations") {
                panic!("handler blew up");
            }
            Ok::<(), String>(())
        });
    let caught = AssertUnwindSafe(run).catch_unwind().await;
    assert!(caught.is_err());

    env.guard.audit().flush().await.unwrap();
    let logs = outcomes_for(&env.store.audit_logs(), "project.update");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].result, AuditResult::Failure);
    assert_eq!(logs[0].error_message.as_deref(), Some("Handler panicked"));
    assert_eq!(env.store.handles_released(), env.store.handles_opened());
}

#[tokio::test]
async fn test_cancelled_request_is_audited_once() {
    let env = setup();
    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));

    let run = env
        .guard
        .pipeline()
        .run(&route, &parts, None, |_ctx, _conn| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>("late")
        });
    let timed_out = tokio::time::timeout(Duration::from_millis(50), run).await;
    assert!(timed_out.is_err());

    env.guard.audit().flush().await.unwrap();
    let logs = outcomes_for(&env.store.audit_logs(), "project.view");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].result, AuditResult::Failure);
    assert_eq!(logs[0].error_message.as_deref(), Some("Request cancelled"));
    assert_eq!(logs[0].actor_id.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_completed_request_is_not_reported_cancelled() {
    let env = setup();
    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));

    let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
    assert!(outcome.result.is_ok());
    drop(outcome);

    env.guard.audit().flush().await.unwrap();
    let logs = outcomes_for(&env.store.audit_logs(), "project.view");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].result, AuditResult::Success);
}

#[tokio::test]
async fn test_handler_queries_share_the_isolated_connection() {
    let env = setup();
    let route = RouteGuard::new("member", "view");
    let parts = request("GET", "/organizations/org-a/members", Some("alice"));

    let outcome = env
        .guard
        .pipeline()
        .run(&route, &parts, None, |ctx, conn| async move {
            let members = conn.list_memberships().await.map_err(|e| e.to_string())?;
            let me = conn
                .find_membership(&ctx.user_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>((members.len(), me.is_some()))
        })
        .await;
    assert_eq!(outcome.result.unwrap(), (4, true));

    assert_eq!(env.store.handles_opened(), 1);
    assert_eq!(env.store.handles_released(), 1);
    let calls = env.store.scoped_calls();
    assert_eq!(
        calls,
        vec![(1, "list_memberships"), (1, "find_membership"), (1, "release")]
    );
}

#[tokio::test]
async fn test_connection_is_unusable_after_the_request() {
    let env = setup();
    let route = RouteGuard::new("member", "view");
    let parts = request("GET", "/organizations/org-a/members", Some("alice"));

    let outcome = env
        .guard
        .pipeline()
        .run(&route, &parts, None, |_ctx, conn| async move {
            Ok::<_, String>(conn)
        })
        .await;
    let leaked = outcome.result.unwrap();

    assert!(leaked.is_released().await);
    assert!(matches!(
        leaked.list_memberships().await,
        Err(TenancyError::IsolationFailure { .. })
    ));
}

#[tokio::test]
async fn test_any_requirement_uses_resolved_permissions() {
    let mut config = test_config();
    config.permissions.cache_ttl_seconds = 0;
    let env = setup_with(config);
    let parts = request("GET", "/organizations/org-a/reports", Some("vic"));

    let open = RouteGuard::authenticated("report", "view");
    let before = env.store.rpc_call_count();
    assert!(env
        .guard
        .pipeline()
        .run(&open, &parts, None, ok_handler)
        .await
        .result
        .is_ok());
    let per_request = env.store.rpc_call_count() - before;

    let any = RouteGuard::any_of("report", "view", &["report:view", "project:view"]);
    let before = env.store.rpc_call_count();
    assert!(env
        .guard
        .pipeline()
        .run(&any, &parts, None, ok_handler)
        .await
        .result
        .is_ok());
    assert_eq!(env.store.rpc_call_count() - before, per_request);
}

#[tokio::test]
async fn test_successful_requests_refund_only_their_own_window() {
    let mut config = test_config();
    config.rate_limit.max_requests = 1;
    config.rate_limit.skip_successful_requests = true;
    let env = setup_with(config);

    let route = RouteGuard::new("project", "view");
    let parts = request("GET", "/organizations/org-a/projects", Some("bob"));
    for _ in 0..3 {
        let outcome = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
        assert!(outcome.result.is_ok());
    }

    let failing = env
        .guard
        .pipeline()
        .run(&route, &parts, None, |_ctx, _conn| async {
            Err::<(), _>("boom".to_string())
        })
        .await;
    assert!(matches!(failing.result, Err(PipelineError::Handler(_))));

    let limited = env.guard.pipeline().run(&route, &parts, None, ok_handler).await;
    assert!(matches!(
        limited.result,
        Err(PipelineError::Rejected(TenancyError::RateLimited { .. }))
    ));
}
