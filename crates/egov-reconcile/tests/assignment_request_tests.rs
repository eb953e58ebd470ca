//! Assignment requests: parent resolution, submission and read-back.

mod common;

use common::{collection, run, EM};
use egov_reconcile::{Operation, ReconcileError};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(target: Value) -> Value {
    let mut properties = json!({
        "catalogName": "Sales",
        "accessPackageName": "Sales Reps",
        "assignmentPolicyName": "Employees",
        "justification": "onboarding"
    });
    if let (Some(properties), Some(target)) = (properties.as_object_mut(), target.as_object()) {
        properties.extend(target.clone());
    }
    properties
}

async fn mount_parents(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("{EM}/catalogs")))
        .and(query_param("$filter", "displayName eq 'Sales'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![json!({"id": "c-1"})])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/catalogs/c-1/accessPackages")))
        .and(query_param("$filter", "displayName eq 'Sales Reps'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![json!({"id": "ap-1"})])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentPolicies")))
        .and(query_param("$filter", "accessPackage/id eq 'ap-1'"))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![
            json!({"id": "p-1", "displayName": "Employees"}),
            json!({"id": "p-2", "displayName": "Contractors"}),
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_two_targets_rejected_before_any_call() {
    let server = MockServer::start().await;

    let err = run(
        &server,
        "AssignmentRequest",
        Operation::CreateOrUpdate,
        request(json!({"targetId": "u-1", "targetEmail": "ada@contoso.com"})),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ReconcileError::Validation(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_absent_assignment_is_requested_for_email_target() {
    let server = MockServer::start().await;
    mount_parents(&server).await;

    Mock::given(method("GET"))
        .and(path("/v1.0/users"))
        .and(query_param(
            "$filter",
            "mail eq 'ada@contoso.com' or userPrincipalName eq 'ada@contoso.com'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![json!({"id": "u-1"})])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignments")))
        .and(query_param(
            "$filter",
            "accessPackage/id eq 'ap-1' and target/objectId eq 'u-1'",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![
            // Same package, other policy: not ours.
            json!({
                "id": "as-0",
                "state": "delivered",
                "target": {"objectId": "u-1"},
                "assignmentPolicy": {"id": "p-2"}
            }),
        ])))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{EM}/assignmentRequests")))
        .and(body_partial_json(json!({
            "requestType": "adminAdd",
            "justification": "onboarding",
            "assignment": {"targetId": "u-1", "assignmentPolicyId": "p-1", "accessPackageId": "ap-1"}
        })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": "req-1", "state": "submitted", "status": "Accepted"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    // The assignment is attached to the request shortly after submission.
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "req-1", "state": "submitted", "status": "Accepted"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .and(query_param("$expand", "assignment"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "req-1",
            "state": "delivering",
            "status": "Delivering",
            "assignment": {
                "id": "as-1",
                "state": "delivering",
                "target": {"objectId": "u-1"}
            }
        })))
        .mount(&server)
        .await;

    let response = run(
        &server,
        "AssignmentRequest",
        Operation::CreateOrUpdate,
        request(json!({"targetEmail": "ada@contoso.com"})),
    )
    .await
    .unwrap();

    let properties = &response["properties"];
    assert_eq!(properties["id"], "as-1");
    assert_eq!(properties["requestId"], "req-1");
    assert_eq!(properties["requestState"], "delivering");
    assert_eq!(properties["targetObjectId"], "u-1");
    assert_eq!(properties["targetEmail"], "ada@contoso.com");
}

#[tokio::test]
async fn test_existing_assignment_is_left_alone() {
    let server = MockServer::start().await;
    mount_parents(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignments")))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![
            json!({
                "id": "as-old",
                "state": "expired",
                "target": {"objectId": "u-1"},
                "assignmentPolicy": {"id": "p-1"}
            }),
            json!({
                "id": "as-1",
                "state": "delivered",
                "target": {"objectId": "u-1"},
                "assignmentPolicy": {"id": "p-1"}
            }),
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let response = run(
        &server,
        "AssignmentRequest",
        Operation::CreateOrUpdate,
        request(json!({"targetId": "u-1"})),
    )
    .await
    .unwrap();
    assert_eq!(response["properties"]["id"], "as-1");
    assert_eq!(response["properties"]["state"], "delivered");
}

#[tokio::test]
async fn test_unknown_policy_name_is_parent_not_found() {
    let server = MockServer::start().await;
    mount_parents(&server).await;

    let mut properties = request(json!({"targetId": "u-1"}));
    properties["assignmentPolicyName"] = json!("Partners");
    let err = run(&server, "AssignmentRequest", Operation::CreateOrUpdate, properties)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::ParentNotFound { kind: "AssignmentPolicy", .. }
    ));
}

/// Parents, no live assignment and an accepted `adminAdd` request.
async fn mount_submitted_request(server: &MockServer) {
    mount_parents(server).await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignments")))
        .respond_with(ResponseTemplate::new(200).set_body_json(collection(vec![])))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{EM}/assignmentRequests")))
        .and(body_partial_json(json!({"requestType": "adminAdd"})))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(json!({"id": "req-1", "state": "submitted", "status": "Accepted"})),
        )
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_wait_for_delivery_polls_until_delivered() {
    let server = MockServer::start().await;
    mount_submitted_request(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .and(query_param_is_missing("$expand"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "req-1", "state": "delivering", "status": "Delivering"})),
        )
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .and(query_param_is_missing("$expand"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "req-1", "state": "delivered", "status": "Delivered"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .and(query_param("$expand", "assignment"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "req-1",
            "state": "delivered",
            "status": "Delivered",
            "assignment": {
                "id": "as-1",
                "state": "delivered",
                "target": {"objectId": "u-1"}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut properties = request(json!({"targetId": "u-1"}));
    properties["waitForDelivery"] = json!(true);
    let response = run(&server, "AssignmentRequest", Operation::CreateOrUpdate, properties)
        .await
        .unwrap();

    assert_eq!(response["properties"]["id"], "as-1");
    assert_eq!(response["properties"]["requestState"], "delivered");
    assert_eq!(response["properties"]["state"], "delivered");
}

#[tokio::test]
async fn test_denied_request_is_fatal_when_waiting() {
    let server = MockServer::start().await;
    mount_submitted_request(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .and(query_param_is_missing("$expand"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "req-1", "state": "denied", "status": "Denied"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{EM}/assignmentRequests/req-1")))
        .and(query_param("$expand", "assignment"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut properties = request(json!({"targetId": "u-1"}));
    properties["waitForDelivery"] = json!(true);
    let err = run(&server, "AssignmentRequest", Operation::CreateOrUpdate, properties)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "DeliveryFailed");
    match err {
        ReconcileError::DeliveryFailed {
            state, diagnostic, ..
        } => {
            assert_eq!(state, "denied");
            assert_eq!(diagnostic.as_deref(), Some("Denied"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
