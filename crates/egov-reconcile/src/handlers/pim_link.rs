//! PIM-for-groups eligibility links.
//!
//! Members of an eligible group become eligible to activate membership (or
//! ownership) of an activated group. The service models this as a stream of
//! schedule requests, so the live eligibility schedule is always looked up
//! first and a request is only submitted when none exists or its terms differ.
//! The activation limits live on the activated group's role management policy
//! and are patched rule by rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::{odata, GraphError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::driver::{json_subset, single_match, Patch, Reconcilable};
use crate::handlers::RequestStatus;
use crate::resolve::{self, non_empty, GroupReference};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

const PIM_GROUP: &str = "identityGovernance/privilegedAccess/group";

/// Policy rule holding the maximum activation duration.
const ACTIVATION_EXPIRATION_RULE: &str = "Expiration_EndUser_Assignment";

/// Codes reported while a freshly created group is not yet known to PIM.
const NOT_READY_CODES: [&str; 2] = ["ResourceNotOnboarded", "GroupNotFound"];

/// Codes reported when an equivalent schedule or request already exists.
const EXISTING_REQUEST_CODES: [&str; 2] = ["RoleAssignmentExists", "PendingRoleAssignmentRequest"];

fn default_access_id() -> String {
    "member".to_string()
}

/// Declared and resolved eligibility link properties.
///
/// Each group is referenced either by object id or by unique name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPimEligibilityProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eligible_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_group_name: Option<String>,
    /// `member` or `owner`.
    #[serde(default = "default_access_id")]
    pub access_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    /// End of eligibility; no expiration when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date_time: Option<DateTime<Utc>>,
    /// ISO-8601 duration, e.g. `PT8H`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_activation_duration: Option<String>,
    /// Policy rule documents, each carrying its rule `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_policy: Option<Vec<Value>>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
}

impl GroupPimEligibilityProperties {
    fn eligible(&self) -> GroupReference {
        GroupReference {
            id: self.eligible_group_id.clone(),
            unique_name: self.eligible_group_name.clone(),
        }
    }

    fn activated(&self) -> GroupReference {
        GroupReference {
            id: self.activated_group_id.clone(),
            unique_name: self.activated_group_name.clone(),
        }
    }

    fn manages_policy(&self) -> bool {
        self.max_activation_duration.is_some() || self.activation_policy.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationPattern {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub end_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInfo {
    #[serde(default)]
    pub start_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration: Option<ExpirationPattern>,
}

/// Live eligibility schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilitySnapshot {
    pub id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub principal_id: Option<String>,
    #[serde(default)]
    pub access_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub schedule_info: Option<ScheduleInfo>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
}

impl EligibilitySnapshot {
    fn end_date_time(&self) -> Option<&DateTime<Utc>> {
        self.schedule_info
            .as_ref()
            .and_then(|s| s.expiration.as_ref())
            .and_then(|e| e.end_date_time.as_ref())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyAssignment {
    policy_id: String,
}

/// Eligibility links keyed by (eligible group, activated group, access id).
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupPimEligibilityHandler;

pub struct LinkScope {
    eligible_id: String,
    activated_id: String,
}

fn is_group_not_ready(error: &GraphError) -> bool {
    error.is_not_found() || error.code().is_some_and(|code| NOT_READY_CODES.contains(&code))
}

fn is_existing_request(error: &GraphError) -> bool {
    error
        .code()
        .is_some_and(|code| EXISTING_REQUEST_CODES.contains(&code))
}

impl GroupPimEligibilityHandler {
    fn request_body(
        action: &str,
        desired: &GroupPimEligibilityProperties,
        scope: &LinkScope,
        now: DateTime<Utc>,
    ) -> Value {
        let expiration = match desired.expiration_date_time {
            Some(end) => json!({ "type": "afterDateTime", "endDateTime": end }),
            None => json!({ "type": "noExpiration" }),
        };
        let mut body = json!({
            "action": action,
            "accessId": desired.access_id.to_ascii_lowercase(),
            "groupId": scope.activated_id,
            "principalId": scope.eligible_id,
            "scheduleInfo": {
                "startDateTime": now,
                "expiration": expiration,
            },
        });
        if let Some(justification) = &desired.justification {
            body["justification"] = json!(justification);
        }
        body
    }

    /// Submits a schedule request and waits until it is provisioned.
    ///
    /// Submission is retried while the activated group is not yet onboarded.
    /// A request the service reports as already existing is not polled.
    #[instrument(skip(ctx, body))]
    async fn submit(ctx: &ReconcileContext, action: &str, body: Value) -> ReconcileResult<()> {
        let path = format!("{PIM_GROUP}/eligibilityScheduleRequests");
        let body = &body;
        let path_ref = path.as_str();

        let submitted = ctx
            .await_visible("submit eligibility request", move || async move {
                match ctx.graph.post::<RequestStatus, _>(path_ref, body).await {
                    Ok(status) => Ok(Some(Some(status))),
                    Err(e) if is_existing_request(&e) => {
                        info!(code = ?e.code(), "Equivalent eligibility already requested");
                        Ok(Some(None))
                    }
                    Err(e) if is_group_not_ready(&e) => {
                        debug!(code = ?e.code(), "Group not yet visible to PIM");
                        Ok(None)
                    }
                    Err(e) => Err(ReconcileError::Remote(e)),
                }
            })
            .await?;

        let Some(submitted) = submitted else {
            return Ok(());
        };
        info!(request_id = %submitted.id, status = %submitted.lifecycle(), "Eligibility request submitted");

        let status_path = format!("{path}/{}", submitted.id);
        let operation = format!("{action} eligibility request {}", submitted.id);
        ctx.poll(&operation, |attempt| {
            let status_path = status_path.clone();
            async move {
                let status: RequestStatus = ctx.graph.get(&status_path).await?;
                debug!(attempt, status = %status.lifecycle(), "Eligibility request status");
                Ok(status.step())
            }
        })
        .await
    }

    async fn list_matching(
        ctx: &ReconcileContext,
        scope: &LinkScope,
        access_id: &str,
    ) -> ReconcileResult<Vec<EligibilitySnapshot>> {
        let filter = format!(
            "{} and {}",
            odata::eq("groupId", &scope.activated_id),
            odata::eq("principalId", &scope.eligible_id)
        );
        let path = odata::with_query(
            &format!("{PIM_GROUP}/eligibilitySchedules"),
            &[("$filter", filter.as_str())],
        );
        let schedules: Vec<EligibilitySnapshot> = ctx.graph.list(&path).await?;
        Ok(schedules
            .into_iter()
            .filter(|s| {
                s.access_id
                    .as_deref()
                    .is_some_and(|a| a.eq_ignore_ascii_case(access_id))
            })
            .collect())
    }

    /// Role management policy governing `access_id` on a group.
    async fn policy_id(
        ctx: &ReconcileContext,
        group_id: &str,
        access_id: &str,
    ) -> ReconcileResult<String> {
        let filter = format!(
            "{} and {} and {}",
            odata::eq("scopeId", group_id),
            odata::eq("scopeType", "Group"),
            odata::eq("roleDefinitionId", &access_id.to_ascii_lowercase())
        );
        let path = odata::with_query(
            "policies/roleManagementPolicyAssignments",
            &[("$filter", filter.as_str())],
        );
        let assignments: Vec<PolicyAssignment> = ctx.graph.list(&path).await?;
        let key = format!("{group_id}/{access_id}");
        single_match("RoleManagementPolicy", &key, assignments)?
            .map(|a| a.policy_id)
            .ok_or(ReconcileError::ParentNotFound {
                kind: "RoleManagementPolicy",
                key,
            })
    }

    /// Declared rule documents that differ from the live rules.
    fn drifted_rules(desired: &GroupPimEligibilityProperties, live: &[Value]) -> Vec<Value> {
        let find = |id: &str| live.iter().find(|rule| rule["id"].as_str() == Some(id));
        let mut drifted = Vec::new();

        if let Some(duration) = &desired.max_activation_duration {
            let current = find(ACTIVATION_EXPIRATION_RULE);
            let in_sync = current
                .and_then(|rule| rule["maximumDuration"].as_str())
                .is_some_and(|d| d.eq_ignore_ascii_case(duration));
            if !in_sync {
                let mut rule = current.cloned().unwrap_or_else(|| {
                    json!({
                        "@odata.type": "#microsoft.graph.unifiedRoleManagementPolicyExpirationRule",
                        "id": ACTIVATION_EXPIRATION_RULE,
                    })
                });
                rule["maximumDuration"] = json!(duration);
                drifted.push(rule);
            }
        }

        for document in desired.activation_policy.iter().flatten() {
            let Some(id) = document["id"].as_str() else {
                continue;
            };
            let in_sync = find(id).is_some_and(|rule| json_subset(document, rule));
            if !in_sync {
                drifted.push(document.clone());
            }
        }
        drifted
    }

    async fn policy_drift(
        ctx: &ReconcileContext,
        desired: &GroupPimEligibilityProperties,
        scope: &LinkScope,
    ) -> ReconcileResult<(String, Vec<Value>)> {
        let policy_id = Self::policy_id(ctx, &scope.activated_id, &desired.access_id).await?;
        let rules: Vec<Value> = ctx
            .graph
            .list(&format!("policies/roleManagementPolicies/{policy_id}/rules"))
            .await?;
        Ok((policy_id, Self::drifted_rules(desired, &rules)))
    }

    #[instrument(skip(ctx, desired, scope))]
    async fn apply_policy(
        ctx: &ReconcileContext,
        desired: &GroupPimEligibilityProperties,
        scope: &LinkScope,
    ) -> ReconcileResult<()> {
        let (policy_id, drifted) = Self::policy_drift(ctx, desired, scope).await?;
        for rule in &drifted {
            let rule_id = rule["id"].as_str().unwrap_or(ACTIVATION_EXPIRATION_RULE);
            info!(policy_id = %policy_id, rule_id, "Updating activation policy rule");
            ctx.graph
                .patch(
                    &format!("policies/roleManagementPolicies/{policy_id}/rules/{rule_id}"),
                    rule,
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcilable for GroupPimEligibilityHandler {
    type Desired = GroupPimEligibilityProperties;
    type Scope = LinkScope;
    type Snapshot = EligibilitySnapshot;

    const KIND: &'static str = "GroupPimEligibility";

    fn validate(&self, desired: &GroupPimEligibilityProperties) -> ReconcileResult<()> {
        if !desired.eligible().is_set() {
            return Err(ReconcileError::Validation(
                "eligibleGroupId or eligibleGroupName is required".to_string(),
            ));
        }
        if !desired.activated().is_set() {
            return Err(ReconcileError::Validation(
                "activatedGroupId or activatedGroupName is required".to_string(),
            ));
        }
        if !matches!(desired.access_id.to_ascii_lowercase().as_str(), "member" | "owner") {
            return Err(ReconcileError::Validation(format!(
                "accessId must be member or owner, got '{}'",
                desired.access_id
            )));
        }
        if let Some(duration) = &desired.max_activation_duration {
            if !(duration.len() > 1 && duration.starts_with('P')) {
                return Err(ReconcileError::Validation(format!(
                    "maxActivationDuration must be an ISO-8601 duration, got '{duration}'"
                )));
            }
        }
        for (index, document) in desired.activation_policy.iter().flatten().enumerate() {
            if non_empty(document["id"].as_str()).is_none() {
                return Err(ReconcileError::Validation(format!(
                    "activationPolicy rule {index} has no id"
                )));
            }
        }
        Ok(())
    }

    fn natural_key(&self, desired: &GroupPimEligibilityProperties) -> String {
        let name = |reference: GroupReference| {
            reference
                .id
                .or(reference.unique_name)
                .unwrap_or_default()
        };
        format!(
            "{}->{}/{}",
            name(desired.eligible()),
            name(desired.activated()),
            desired.access_id
        )
    }

    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &GroupPimEligibilityProperties,
    ) -> ReconcileResult<LinkScope> {
        let eligible_id = resolve::resolve_group(ctx, &desired.eligible()).await?;
        let activated_id = resolve::resolve_group(ctx, &desired.activated()).await?;
        Ok(LinkScope {
            eligible_id,
            activated_id,
        })
    }

    #[instrument(skip_all, fields(group_id = %scope.activated_id, principal_id = %scope.eligible_id))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &LinkScope,
        desired: &GroupPimEligibilityProperties,
    ) -> ReconcileResult<Vec<EligibilitySnapshot>> {
        Self::list_matching(ctx, scope, &desired.access_id).await
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &LinkScope,
        desired: &GroupPimEligibilityProperties,
    ) -> ReconcileResult<String> {
        let body = Self::request_body("adminAssign", desired, scope, Utc::now());
        Self::submit(ctx, "adminAssign", body).await?;
        if desired.manages_policy() {
            Self::apply_policy(ctx, desired, scope).await?;
        }
        Ok(format!("{}/{}", scope.activated_id, scope.eligible_id))
    }

    async fn diff(
        &self,
        ctx: &ReconcileContext,
        scope: &LinkScope,
        desired: &GroupPimEligibilityProperties,
        existing: &EligibilitySnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch.field(
            "expirationDateTime",
            desired.expiration_date_time.as_ref(),
            existing.end_date_time(),
        )?;

        if desired.manages_policy() {
            let (_, drifted) = Self::policy_drift(ctx, desired, scope).await?;
            if !drifted.is_empty() {
                patch.force("activationPolicy", Value::Array(drifted));
            }
        }
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        scope: &LinkScope,
        desired: &GroupPimEligibilityProperties,
        existing: &EligibilitySnapshot,
        patch: &Patch,
    ) -> ReconcileResult<String> {
        if patch.contains("expirationDateTime") {
            let body = Self::request_body("adminUpdate", desired, scope, Utc::now());
            Self::submit(ctx, "adminUpdate", body).await?;
        }
        if patch.contains("activationPolicy") {
            Self::apply_policy(ctx, desired, scope).await?;
        }
        Ok(existing.id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        scope: &LinkScope,
        desired: &GroupPimEligibilityProperties,
        handle: &str,
    ) -> ReconcileResult<Option<EligibilitySnapshot>> {
        let found = Self::list_matching(ctx, scope, &desired.access_id).await?;
        single_match(Self::KIND, handle, found)
    }

    fn id_of(snapshot: &EligibilitySnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: GroupPimEligibilityProperties,
        live: &EligibilitySnapshot,
    ) -> GroupPimEligibilityProperties {
        GroupPimEligibilityProperties {
            eligible_group_id: live.principal_id.clone().or(desired.eligible_group_id),
            activated_group_id: live.group_id.clone().or(desired.activated_group_id),
            access_id: live.access_id.clone().unwrap_or(desired.access_id),
            expiration_date_time: live.end_date_time().copied().or(desired.expiration_date_time),
            id: Some(live.id.clone()),
            status: live.status.clone(),
            created_date_time: live.created_date_time,
            ..desired
        }
    }
}
