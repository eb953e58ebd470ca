//! Assignment policies on an access package.
//!
//! The nested settings documents (requestor, approval, review, expiration) are
//! passed through to the service verbatim. Only their presence and the shape
//! the service cannot recover from (approval required without any stage or
//! approver) are checked locally.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::instrument;

use crate::driver::{Patch, Reconcilable};
use crate::resolve::{self, non_empty, Identified, EM};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Declared and resolved assignment policy properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPolicyProperties {
    pub display_name: String,
    pub catalog_name: String,
    pub access_package_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_target_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specific_allowed_targets: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestor_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_approval_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_request_settings: Option<Value>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_package_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date_time: Option<DateTime<Utc>>,
}

/// Live policy. Settings documents stay opaque.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentPolicySnapshot {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_target_scope: Option<Value>,
    #[serde(default)]
    pub specific_allowed_targets: Option<Value>,
    #[serde(default)]
    pub expiration: Option<Value>,
    #[serde(default)]
    pub requestor_settings: Option<Value>,
    #[serde(default)]
    pub request_approval_settings: Option<Value>,
    #[serde(default)]
    pub review_settings: Option<Value>,
    #[serde(default)]
    pub automatic_request_settings: Option<Value>,
    #[serde(default)]
    pub access_package: Option<Identified>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_date_time: Option<DateTime<Utc>>,
}

/// Policies keyed by (access package, display name).
#[derive(Debug, Default, Clone, Copy)]
pub struct AssignmentPolicyHandler;

pub struct PackageScope {
    access_package_id: String,
}

const DOCUMENTS: [&str; 7] = [
    "allowedTargetScope",
    "specificAllowedTargets",
    "expiration",
    "requestorSettings",
    "requestApprovalSettings",
    "reviewSettings",
    "automaticRequestSettings",
];

impl AssignmentPolicyHandler {
    fn declared_documents(desired: &AssignmentPolicyProperties) -> [Option<Value>; 7] {
        [
            desired.allowed_target_scope.clone().map(Value::String),
            desired.specific_allowed_targets.clone(),
            desired.expiration.clone(),
            desired.requestor_settings.clone(),
            desired.request_approval_settings.clone(),
            desired.review_settings.clone(),
            desired.automatic_request_settings.clone(),
        ]
    }

    fn live_documents(existing: &AssignmentPolicySnapshot) -> [Option<&Value>; 7] {
        [
            existing.allowed_target_scope.as_ref(),
            existing.specific_allowed_targets.as_ref(),
            existing.expiration.as_ref(),
            existing.requestor_settings.as_ref(),
            existing.request_approval_settings.as_ref(),
            existing.review_settings.as_ref(),
            existing.automatic_request_settings.as_ref(),
        ]
    }

    /// Full policy body; the service replaces policies as a whole.
    fn body(desired: &AssignmentPolicyProperties, access_package_id: &str) -> Value {
        let mut body = Map::new();
        body.insert("displayName".into(), json!(desired.display_name));
        body.insert(
            "description".into(),
            json!(desired
                .description
                .as_deref()
                .unwrap_or(desired.display_name.as_str())),
        );
        body.insert("accessPackage".into(), json!({ "id": access_package_id }));
        for (name, document) in DOCUMENTS.iter().zip(Self::declared_documents(desired)) {
            if let Some(document) = document {
                body.insert((*name).to_string(), document);
            }
        }
        Value::Object(body)
    }

    fn validate_approval(settings: &Value) -> ReconcileResult<()> {
        let required = settings
            .get("isApprovalRequiredForAdd")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !required {
            return Ok(());
        }

        let stages = settings
            .get("stages")
            .and_then(Value::as_array)
            .filter(|stages| !stages.is_empty())
            .ok_or_else(|| {
                ReconcileError::Validation(
                    "requestApprovalSettings requires at least one stage when approval is required"
                        .to_string(),
                )
            })?;

        for (index, stage) in stages.iter().enumerate() {
            let has_approvers = stage
                .get("primaryApprovers")
                .and_then(Value::as_array)
                .is_some_and(|approvers| !approvers.is_empty());
            if !has_approvers {
                return Err(ReconcileError::Validation(format!(
                    "approval stage {index} has no primaryApprovers"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcilable for AssignmentPolicyHandler {
    type Desired = AssignmentPolicyProperties;
    type Scope = PackageScope;
    type Snapshot = AssignmentPolicySnapshot;

    const KIND: &'static str = "AssignmentPolicy";

    fn validate(&self, desired: &AssignmentPolicyProperties) -> ReconcileResult<()> {
        for (field, value) in [
            ("displayName", &desired.display_name),
            ("catalogName", &desired.catalog_name),
            ("accessPackageName", &desired.access_package_name),
        ] {
            if non_empty(Some(value.as_str())).is_none() {
                return Err(ReconcileError::Validation(format!(
                    "assignment policy {field} is required"
                )));
            }
        }
        if let Some(settings) = &desired.request_approval_settings {
            Self::validate_approval(settings)?;
        }
        Ok(())
    }

    fn natural_key(&self, desired: &AssignmentPolicyProperties) -> String {
        format!(
            "{}/{}/{}",
            desired.catalog_name, desired.access_package_name, desired.display_name
        )
    }

    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &AssignmentPolicyProperties,
    ) -> ReconcileResult<PackageScope> {
        let catalog_id = resolve::resolve_catalog(ctx, &desired.catalog_name).await?;
        let access_package_id =
            resolve::resolve_access_package(ctx, &catalog_id, &desired.access_package_name)
                .await?;
        Ok(PackageScope { access_package_id })
    }

    #[instrument(skip_all, fields(access_package_id = %scope.access_package_id))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &PackageScope,
        desired: &AssignmentPolicyProperties,
    ) -> ReconcileResult<Vec<AssignmentPolicySnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/assignmentPolicies"),
            &[
                (
                    "$filter",
                    odata::eq("accessPackage/id", &scope.access_package_id).as_str(),
                ),
                ("$expand", "accessPackage"),
            ],
        );
        let policies: Vec<AssignmentPolicySnapshot> = ctx.graph.list(&path).await?;
        Ok(policies
            .into_iter()
            .filter(|p| p.display_name.as_deref() == Some(desired.display_name.as_str()))
            .collect())
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &PackageScope,
        desired: &AssignmentPolicyProperties,
    ) -> ReconcileResult<String> {
        let created: Identified = ctx
            .graph
            .post(
                &format!("{EM}/assignmentPolicies"),
                &Self::body(desired, &scope.access_package_id),
            )
            .await?;
        Ok(created.id)
    }

    async fn diff(
        &self,
        _ctx: &ReconcileContext,
        _scope: &PackageScope,
        desired: &AssignmentPolicyProperties,
        existing: &AssignmentPolicySnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch.field("description", desired.description.as_ref(), existing.description.as_ref())?;
        for ((name, declared), live) in DOCUMENTS
            .iter()
            .zip(Self::declared_documents(desired))
            .zip(Self::live_documents(existing))
        {
            patch.document(name, declared.as_ref(), live);
        }
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        scope: &PackageScope,
        desired: &AssignmentPolicyProperties,
        existing: &AssignmentPolicySnapshot,
        _patch: &Patch,
    ) -> ReconcileResult<String> {
        let mut body = Self::body(desired, &scope.access_package_id);
        body["id"] = json!(existing.id);
        ctx.graph
            .put(&format!("{EM}/assignmentPolicies/{}", existing.id), &body)
            .await?;
        Ok(existing.id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        _scope: &PackageScope,
        _desired: &AssignmentPolicyProperties,
        handle: &str,
    ) -> ReconcileResult<Option<AssignmentPolicySnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/assignmentPolicies/{handle}"),
            &[("$expand", "accessPackage")],
        );
        Ok(ctx.graph.get_optional(&path).await?)
    }

    fn id_of(snapshot: &AssignmentPolicySnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: AssignmentPolicyProperties,
        live: &AssignmentPolicySnapshot,
    ) -> AssignmentPolicyProperties {
        AssignmentPolicyProperties {
            display_name: live.display_name.clone().unwrap_or(desired.display_name),
            catalog_name: desired.catalog_name,
            access_package_name: desired.access_package_name,
            description: live.description.clone().or(desired.description),
            allowed_target_scope: live
                .allowed_target_scope
                .as_ref()
                .and_then(Value::as_str)
                .map(String::from)
                .or(desired.allowed_target_scope),
            specific_allowed_targets: live
                .specific_allowed_targets
                .clone()
                .or(desired.specific_allowed_targets),
            expiration: live.expiration.clone().or(desired.expiration),
            requestor_settings: live.requestor_settings.clone().or(desired.requestor_settings),
            request_approval_settings: live
                .request_approval_settings
                .clone()
                .or(desired.request_approval_settings),
            review_settings: live.review_settings.clone().or(desired.review_settings),
            automatic_request_settings: live
                .automatic_request_settings
                .clone()
                .or(desired.automatic_request_settings),
            id: Some(live.id.clone()),
            access_package_id: live
                .access_package
                .as_ref()
                .map(|p| p.id.clone())
                .or(desired.access_package_id),
            created_date_time: live.created_date_time,
            modified_date_time: live.modified_date_time,
        }
    }
}
