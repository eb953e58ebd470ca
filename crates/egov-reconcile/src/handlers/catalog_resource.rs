//! External objects (groups, applications, sites) registered in a catalog.
//!
//! Registration is asynchronous: an `adminAdd` resource request is submitted
//! and then polled until it is delivered. A group created moments earlier may
//! not yet be visible to the governance service, so the origin object is
//! awaited first, and lookups that report the origin as not found are retried
//! before the resource is considered absent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::driver::{single_match, Patch, Reconcilable};
use crate::handlers::RequestStatus;
use crate::resolve::{self, non_empty, Identified, EM};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

const AAD_GROUP: &str = "AadGroup";

fn default_origin_system() -> String {
    AAD_GROUP.to_string()
}

/// Declared and resolved catalog resource properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogResourceProperties {
    pub catalog_name: String,
    /// Object id of the registered group, application or site.
    pub origin_id: String,
    #[serde(default = "default_origin_system")]
    pub origin_system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
}

/// Live catalog resource.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogResourceSnapshot {
    pub id: String,
    #[serde(default)]
    pub origin_id: Option<String>,
    #[serde(default)]
    pub origin_system: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
}

/// Catalog resources keyed by (catalog, origin id).
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogResourceHandler;

pub struct CatalogScope {
    catalog_id: String,
}

impl CatalogResourceHandler {
    fn request_body(
        request_type: &str,
        desired: &CatalogResourceProperties,
        catalog_id: &str,
    ) -> Value {
        let mut resource = json!({
            "originId": desired.origin_id,
            "originSystem": desired.origin_system,
        });
        if let Some(display_name) = &desired.display_name {
            resource["displayName"] = json!(display_name);
        }
        if let Some(description) = &desired.description {
            resource["description"] = json!(description);
        }
        json!({
            "requestType": request_type,
            "resource": resource,
            "catalog": { "id": catalog_id },
        })
    }

    /// Submits a resource request and waits for it to be delivered.
    async fn submit(
        ctx: &ReconcileContext,
        request_type: &str,
        desired: &CatalogResourceProperties,
        catalog_id: &str,
    ) -> ReconcileResult<()> {
        let submitted: RequestStatus = ctx
            .graph
            .post(
                &format!("{EM}/resourceRequests"),
                &Self::request_body(request_type, desired, catalog_id),
            )
            .await?;
        info!(
            request_id = %submitted.id,
            state = %submitted.lifecycle(),
            request_type,
            "Resource request submitted"
        );

        let path = format!("{EM}/resourceRequests/{}", submitted.id);
        let operation = format!("{request_type} resource {}", desired.origin_id);
        ctx.poll(&operation, |attempt| {
            let path = path.clone();
            async move {
                let status: RequestStatus = ctx.graph.get(&path).await?;
                debug!(attempt, state = %status.lifecycle(), "Resource request status");
                Ok(status.step())
            }
        })
        .await
    }

    async fn list_matching(
        ctx: &ReconcileContext,
        catalog_id: &str,
        origin_id: &str,
    ) -> ReconcileResult<Vec<CatalogResourceSnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/catalogs/{catalog_id}/resources"),
            &[("$filter", odata::eq("originId", origin_id).as_str())],
        );
        Ok(ctx.graph.list(&path).await?)
    }
}

#[async_trait]
impl Reconcilable for CatalogResourceHandler {
    type Desired = CatalogResourceProperties;
    type Scope = CatalogScope;
    type Snapshot = CatalogResourceSnapshot;

    const KIND: &'static str = "CatalogResource";

    fn validate(&self, desired: &CatalogResourceProperties) -> ReconcileResult<()> {
        if non_empty(Some(desired.catalog_name.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "catalog resource catalogName is required".to_string(),
            ));
        }
        if non_empty(Some(desired.origin_id.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "catalog resource originId is required".to_string(),
            ));
        }
        Ok(())
    }

    fn natural_key(&self, desired: &CatalogResourceProperties) -> String {
        format!("{}/{}", desired.catalog_name, desired.origin_id)
    }

    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &CatalogResourceProperties,
    ) -> ReconcileResult<CatalogScope> {
        let catalog_id = resolve::resolve_catalog(ctx, &desired.catalog_name).await?;
        Ok(CatalogScope { catalog_id })
    }

    /// Retries not-found answers through replication lag before reporting absence.
    #[instrument(skip_all, fields(origin_id = %desired.origin_id))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &CatalogScope,
        desired: &CatalogResourceProperties,
    ) -> ReconcileResult<Vec<CatalogResourceSnapshot>> {
        let catalog_id = scope.catalog_id.as_str();
        let origin_id = desired.origin_id.as_str();
        let found = ctx
            .await_visible("catalog resource lookup", move || async move {
                match Self::list_matching(ctx, catalog_id, origin_id).await {
                    Ok(found) => Ok(Some(found)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await;
        match found {
            Ok(found) => Ok(found),
            Err(ReconcileError::RetriesExhausted { .. }) => {
                debug!("Origin still unknown to the catalog, treating as absent");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &CatalogScope,
        desired: &CatalogResourceProperties,
    ) -> ReconcileResult<String> {
        if desired.origin_system.eq_ignore_ascii_case(AAD_GROUP) {
            let group_path = odata::with_query(
                &format!("groups/{}", desired.origin_id),
                &[("$select", "id")],
            );
            let group_path = group_path.as_str();
            ctx.await_visible("origin group visibility", move || async move {
                Ok::<_, ReconcileError>(ctx.graph.get_optional::<Identified>(group_path).await?)
            })
            .await
            .map_err(|e| match e {
                ReconcileError::RetriesExhausted { .. } => ReconcileError::ParentNotFound {
                    kind: "SecurityGroup",
                    key: desired.origin_id.clone(),
                },
                other => other,
            })?;
        }

        Self::submit(ctx, "adminAdd", desired, &scope.catalog_id).await?;
        Ok(desired.origin_id.clone())
    }

    async fn diff(
        &self,
        _ctx: &ReconcileContext,
        _scope: &CatalogScope,
        desired: &CatalogResourceProperties,
        existing: &CatalogResourceSnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch
            .field("displayName", desired.display_name.as_ref(), existing.display_name.as_ref())?
            .field("description", desired.description.as_ref(), existing.description.as_ref())?;
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        scope: &CatalogScope,
        desired: &CatalogResourceProperties,
        _existing: &CatalogResourceSnapshot,
        _patch: &Patch,
    ) -> ReconcileResult<String> {
        Self::submit(ctx, "adminUpdate", desired, &scope.catalog_id).await?;
        Ok(desired.origin_id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        scope: &CatalogScope,
        _desired: &CatalogResourceProperties,
        handle: &str,
    ) -> ReconcileResult<Option<CatalogResourceSnapshot>> {
        let found = Self::list_matching(ctx, &scope.catalog_id, handle).await?;
        single_match(Self::KIND, handle, found)
    }

    fn id_of(snapshot: &CatalogResourceSnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: CatalogResourceProperties,
        live: &CatalogResourceSnapshot,
    ) -> CatalogResourceProperties {
        CatalogResourceProperties {
            catalog_name: desired.catalog_name,
            origin_id: live.origin_id.clone().unwrap_or(desired.origin_id),
            origin_system: live.origin_system.clone().unwrap_or(desired.origin_system),
            display_name: live.display_name.clone().or(desired.display_name),
            description: live.description.clone().or(desired.description),
            id: Some(live.id.clone()),
            created_date_time: live.created_date_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_system_defaults_to_group() {
        let props: CatalogResourceProperties = serde_json::from_value(json!({
            "catalogName": "Sales",
            "originId": "g-1"
        }))
        .unwrap();
        assert_eq!(props.origin_system, "AadGroup");
    }

    #[test]
    fn test_request_body() {
        let props: CatalogResourceProperties = serde_json::from_value(json!({
            "catalogName": "Sales",
            "originId": "g-1",
            "displayName": "Sales reps"
        }))
        .unwrap();
        let body = CatalogResourceHandler::request_body("adminAdd", &props, "c-1");
        assert_eq!(
            body,
            json!({
                "requestType": "adminAdd",
                "resource": {"originId": "g-1", "originSystem": "AadGroup", "displayName": "Sales reps"},
                "catalog": {"id": "c-1"}
            })
        );
    }

    #[test]
    fn test_missing_origin_rejected() {
        let props: CatalogResourceProperties = serde_json::from_value(json!({
            "catalogName": "Sales",
            "originId": ""
        }))
        .unwrap();
        assert!(CatalogResourceHandler.validate(&props).is_err());
    }
}
