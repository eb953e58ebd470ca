//! Access package assignments requested on behalf of a user.
//!
//! The live object is the resulting assignment; writes go through assignment
//! requests (`adminAdd` / `adminUpdate`). Delivery is asynchronous. By default
//! the state observed at submission is reported; with `waitForDelivery` the
//! request is polled to a terminal state first.

use async_trait::async_trait;
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::driver::{Patch, Reconcilable};
use crate::handlers::RequestStatus;
use crate::resolve::{self, non_empty, Identified, EM};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Declared and resolved assignment request properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequestProperties {
    pub catalog_name: String,
    pub access_package_name: String,
    pub assignment_policy_name: String,
    /// Object id of the target user. Exactly one of this and `targetEmail`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Mail or user principal name of the target user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    /// Schedule document (`startDateTime`, `expiration`), passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Value>,
    #[serde(default)]
    pub wait_for_delivery: bool,

    // Outputs
    /// Assignment id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_object_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentRecord {
    id: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    schedule: Option<Value>,
    #[serde(default)]
    target: Option<TargetRef>,
    #[serde(default)]
    assignment_policy: Option<Identified>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetRef {
    #[serde(default)]
    object_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestRecord {
    #[serde(flatten)]
    status: RequestStatus,
    #[serde(default)]
    assignment: Option<AssignmentRecord>,
}

/// Live assignment, optionally with the request that last touched it.
#[derive(Debug, Clone)]
pub struct AssignmentSnapshot {
    pub id: String,
    pub state: Option<String>,
    pub schedule: Option<Value>,
    pub target_object_id: Option<String>,
    pub request_id: Option<String>,
    pub request_state: Option<String>,
}

impl From<AssignmentRecord> for AssignmentSnapshot {
    fn from(record: AssignmentRecord) -> Self {
        Self {
            id: record.id,
            state: record.state,
            schedule: record.schedule,
            target_object_id: record.target.and_then(|t| t.object_id),
            request_id: None,
            request_state: None,
        }
    }
}

/// Assignment states that no longer grant access.
const INACTIVE_STATES: [&str; 2] = ["expired", "deliveryFailed"];

/// Assignments keyed by (access package, policy, target user).
#[derive(Debug, Default, Clone, Copy)]
pub struct AssignmentRequestHandler;

pub struct AssignmentScope {
    access_package_id: String,
    policy_id: String,
    target_id: String,
}

impl AssignmentRequestHandler {
    async fn submit(
        ctx: &ReconcileContext,
        desired: &AssignmentRequestProperties,
        body: Value,
    ) -> ReconcileResult<String> {
        let submitted: RequestStatus = ctx
            .graph
            .post(&format!("{EM}/assignmentRequests"), &body)
            .await?;
        info!(
            request_id = %submitted.id,
            state = %submitted.lifecycle(),
            "Assignment request submitted"
        );

        if desired.wait_for_delivery {
            let path = format!("{EM}/assignmentRequests/{}", submitted.id);
            let operation = format!("deliver assignment request {}", submitted.id);
            ctx.poll(&operation, |attempt| {
                let path = path.clone();
                async move {
                    let status: RequestStatus = ctx.graph.get(&path).await?;
                    debug!(attempt, state = %status.lifecycle(), "Assignment request status");
                    Ok(status.step())
                }
            })
            .await?;
        }
        Ok(submitted.id)
    }

    fn add_body(desired: &AssignmentRequestProperties, scope: &AssignmentScope) -> Value {
        let mut body = json!({
            "requestType": "adminAdd",
            "assignment": {
                "targetId": scope.target_id,
                "assignmentPolicyId": scope.policy_id,
                "accessPackageId": scope.access_package_id,
            },
        });
        Self::with_terms(&mut body, desired);
        body
    }

    fn update_body(desired: &AssignmentRequestProperties, assignment_id: &str) -> Value {
        let mut body = json!({
            "requestType": "adminUpdate",
            "assignment": { "id": assignment_id },
        });
        Self::with_terms(&mut body, desired);
        body
    }

    fn with_terms(body: &mut Value, desired: &AssignmentRequestProperties) {
        if let Some(justification) = &desired.justification {
            body["justification"] = json!(justification);
        }
        if let Some(schedule) = &desired.schedule {
            body["schedule"] = schedule.clone();
        }
    }
}

#[async_trait]
impl Reconcilable for AssignmentRequestHandler {
    type Desired = AssignmentRequestProperties;
    type Scope = AssignmentScope;
    type Snapshot = AssignmentSnapshot;

    const KIND: &'static str = "AssignmentRequest";

    fn validate(&self, desired: &AssignmentRequestProperties) -> ReconcileResult<()> {
        let by_id = non_empty(desired.target_id.as_deref()).is_some();
        let by_email = non_empty(desired.target_email.as_deref()).is_some();
        if by_id == by_email {
            return Err(ReconcileError::Validation(
                "exactly one of targetId or targetEmail must be set".to_string(),
            ));
        }
        for (field, value) in [
            ("catalogName", &desired.catalog_name),
            ("accessPackageName", &desired.access_package_name),
            ("assignmentPolicyName", &desired.assignment_policy_name),
        ] {
            if non_empty(Some(value.as_str())).is_none() {
                return Err(ReconcileError::Validation(format!(
                    "assignment request {field} is required"
                )));
            }
        }
        Ok(())
    }

    fn natural_key(&self, desired: &AssignmentRequestProperties) -> String {
        let target = desired
            .target_id
            .as_deref()
            .or(desired.target_email.as_deref())
            .unwrap_or_default();
        format!(
            "{}/{}/{target}",
            desired.access_package_name, desired.assignment_policy_name
        )
    }

    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &AssignmentRequestProperties,
    ) -> ReconcileResult<AssignmentScope> {
        let catalog_id = resolve::resolve_catalog(ctx, &desired.catalog_name).await?;
        let access_package_id =
            resolve::resolve_access_package(ctx, &catalog_id, &desired.access_package_name)
                .await?;
        let policy_id = resolve::resolve_assignment_policy(
            ctx,
            &access_package_id,
            &desired.assignment_policy_name,
        )
        .await?;
        let target_id = match non_empty(desired.target_id.as_deref()) {
            Some(id) => id.to_string(),
            None => {
                let email = non_empty(desired.target_email.as_deref()).unwrap_or_default();
                resolve::resolve_user(ctx, email).await?
            }
        };
        Ok(AssignmentScope {
            access_package_id,
            policy_id,
            target_id,
        })
    }

    #[instrument(skip_all, fields(access_package_id = %scope.access_package_id))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &AssignmentScope,
        _desired: &AssignmentRequestProperties,
    ) -> ReconcileResult<Vec<AssignmentSnapshot>> {
        let filter = format!(
            "{} and {}",
            odata::eq("accessPackage/id", &scope.access_package_id),
            odata::eq("target/objectId", &scope.target_id)
        );
        let path = odata::with_query(
            &format!("{EM}/assignments"),
            &[
                ("$filter", filter.as_str()),
                ("$expand", "target,assignmentPolicy"),
            ],
        );
        let records: Vec<AssignmentRecord> = ctx.graph.list(&path).await?;
        Ok(records
            .into_iter()
            .filter(|r| {
                r.assignment_policy
                    .as_ref()
                    .is_some_and(|p| p.id == scope.policy_id)
            })
            .filter(|r| {
                !r.state.as_deref().is_some_and(|state| {
                    INACTIVE_STATES
                        .iter()
                        .any(|inactive| inactive.eq_ignore_ascii_case(state))
                })
            })
            .map(AssignmentSnapshot::from)
            .collect())
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &AssignmentScope,
        desired: &AssignmentRequestProperties,
    ) -> ReconcileResult<String> {
        Self::submit(ctx, desired, Self::add_body(desired, scope)).await
    }

    async fn diff(
        &self,
        _ctx: &ReconcileContext,
        _scope: &AssignmentScope,
        desired: &AssignmentRequestProperties,
        existing: &AssignmentSnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch.document("schedule", desired.schedule.as_ref(), existing.schedule.as_ref());
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        _scope: &AssignmentScope,
        desired: &AssignmentRequestProperties,
        existing: &AssignmentSnapshot,
        _patch: &Patch,
    ) -> ReconcileResult<String> {
        Self::submit(ctx, desired, Self::update_body(desired, &existing.id)).await
    }

    /// Reads the request back; `None` until the service has attached the assignment.
    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        _scope: &AssignmentScope,
        _desired: &AssignmentRequestProperties,
        handle: &str,
    ) -> ReconcileResult<Option<AssignmentSnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/assignmentRequests/{handle}"),
            &[("$expand", "assignment")],
        );
        let Some(request) = ctx.graph.get_optional::<RequestRecord>(&path).await? else {
            return Ok(None);
        };
        Ok(request.assignment.map(|assignment| AssignmentSnapshot {
            request_id: Some(request.status.id.clone()),
            request_state: Some(request.status.lifecycle().to_string()),
            ..AssignmentSnapshot::from(assignment)
        }))
    }

    fn id_of(snapshot: &AssignmentSnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: AssignmentRequestProperties,
        live: &AssignmentSnapshot,
    ) -> AssignmentRequestProperties {
        AssignmentRequestProperties {
            schedule: live.schedule.clone().or(desired.schedule),
            id: Some(live.id.clone()),
            request_id: live.request_id.clone().or(desired.request_id),
            request_state: live.request_state.clone().or(desired.request_state),
            state: live.state.clone(),
            target_object_id: live.target_object_id.clone(),
            ..desired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(extra: Value) -> AssignmentRequestProperties {
        let mut value = json!({
            "catalogName": "Sales",
            "accessPackageName": "Sales Reps",
            "assignmentPolicyName": "Employees"
        });
        if let (Some(target), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_exactly_one_target() {
        let handler = AssignmentRequestHandler;
        assert!(handler.validate(&desired(json!({}))).is_err());
        assert!(handler
            .validate(&desired(json!({"targetId": "u-1", "targetEmail": "a@contoso.com"})))
            .is_err());
        assert!(handler.validate(&desired(json!({"targetId": "u-1"}))).is_ok());
        assert!(handler
            .validate(&desired(json!({"targetEmail": "a@contoso.com"})))
            .is_ok());
        assert!(handler
            .validate(&desired(json!({"targetId": " ", "targetEmail": "a@contoso.com"})))
            .is_ok());
    }

    #[test]
    fn test_wait_for_delivery_defaults_off() {
        assert!(!desired(json!({"targetId": "u-1"})).wait_for_delivery);
    }

    #[test]
    fn test_add_body() {
        let props = desired(json!({
            "targetId": "u-1",
            "justification": "onboarding",
            "schedule": {"expiration": {"type": "afterDuration", "duration": "P30D"}}
        }));
        let scope = AssignmentScope {
            access_package_id: "ap-1".into(),
            policy_id: "p-1".into(),
            target_id: "u-1".into(),
        };
        let body = AssignmentRequestHandler::add_body(&props, &scope);
        assert_eq!(body["requestType"], "adminAdd");
        assert_eq!(
            body["assignment"],
            json!({"targetId": "u-1", "assignmentPolicyId": "p-1", "accessPackageId": "ap-1"})
        );
        assert_eq!(body["justification"], "onboarding");
        assert_eq!(body["schedule"]["expiration"]["duration"], "P30D");
    }

    #[test]
    fn test_request_record_decoding() {
        let record: RequestRecord = serde_json::from_value(json!({
            "id": "req-1",
            "state": "delivered",
            "status": "Delivered",
            "assignment": {"id": "as-1", "state": "delivered"}
        }))
        .unwrap();
        assert_eq!(record.status.lifecycle(), "delivered");
        assert_eq!(record.assignment.unwrap().id, "as-1");
    }
}
