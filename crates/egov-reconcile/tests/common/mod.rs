//! Shared fixtures for egov-reconcile integration tests.
//!
//! Every test runs the engine against a wiremock server standing in for
//! Microsoft Graph, with polling bounds shrunk to milliseconds.

#![allow(dead_code)]

use std::sync::Once;

use egov_reconcile::{Engine, EngineConfig, HandlerRegistry, Operation, ReconcileResult};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

static INIT: Once = Once::new();

/// Entitlement-management prefix as seen by the mock server.
pub const EM: &str = "/v1.0/identityGovernance/entitlementManagement";

/// PIM-for-groups prefix as seen by the mock server.
pub const PIM: &str = "/v1.0/identityGovernance/privilegedAccess/group";

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

/// Request envelope addressed at the mock server.
pub fn envelope(server: &MockServer, properties: Value) -> Value {
    json!({
        "properties": properties,
        "config": {
            "serviceEndpoint": format!("{}/v1.0", server.uri()),
            "bearerToken": "test-token"
        }
    })
}

/// Runs one operation through the default registry.
pub async fn run(
    server: &MockServer,
    resource_type: &str,
    operation: Operation,
    properties: Value,
) -> ReconcileResult<Value> {
    init_test_logging();
    let engine = Engine::new(EngineConfig::for_testing()).unwrap();
    HandlerRegistry::with_defaults()
        .dispatch(
            &engine,
            resource_type,
            operation,
            envelope(server, properties),
            CancellationToken::new(),
        )
        .await
}

/// OData collection page.
pub fn collection(items: Vec<Value>) -> Value {
    json!({ "value": items })
}

/// OData error body.
pub fn graph_error(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

/// Test data factory for entitlement-management catalogs.
pub fn catalog(id: &str, name: &str, description: &str) -> Value {
    json!({
        "id": id,
        "displayName": name,
        "description": description,
        "catalogType": "userManaged",
        "state": "published",
        "isExternallyVisible": false,
        "createdDateTime": "2024-03-01T10:00:00Z",
        "modifiedDateTime": "2024-03-01T10:00:00Z"
    })
}

/// Test data factory for security groups.
pub fn group(id: &str, unique_name: &str) -> Value {
    json!({
        "id": id,
        "uniqueName": unique_name,
        "displayName": format!("Group {unique_name}"),
        "mailNickname": unique_name.replace('-', ""),
        "createdDateTime": "2024-03-01T10:00:00Z"
    })
}
