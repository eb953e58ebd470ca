//! Access packages within a catalog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::driver::{Patch, Reconcilable};
use crate::resolve::{self, non_empty, Identified, EM};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Declared and resolved access package properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPackageProperties {
    pub display_name: String,
    /// Display name of the parent catalog.
    pub catalog_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_hidden: Option<bool>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date_time: Option<DateTime<Utc>>,
}

/// Live access package.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPackageSnapshot {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_hidden: Option<bool>,
    #[serde(default)]
    pub catalog: Option<Identified>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_date_time: Option<DateTime<Utc>>,
}

/// Access packages keyed by (catalog, display name).
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessPackageHandler;

/// Resolved parent of an access package.
pub struct CatalogScope {
    catalog_id: String,
}

impl AccessPackageHandler {
    fn create_body(desired: &AccessPackageProperties, catalog_id: &str) -> Value {
        let mut body = json!({
            "displayName": desired.display_name,
            "catalog": { "id": catalog_id },
        });
        if let Some(description) = &desired.description {
            body["description"] = json!(description);
        }
        if let Some(hidden) = desired.is_hidden {
            body["isHidden"] = json!(hidden);
        }
        body
    }
}

#[async_trait]
impl Reconcilable for AccessPackageHandler {
    type Desired = AccessPackageProperties;
    type Scope = CatalogScope;
    type Snapshot = AccessPackageSnapshot;

    const KIND: &'static str = "AccessPackage";

    fn validate(&self, desired: &AccessPackageProperties) -> ReconcileResult<()> {
        if non_empty(Some(desired.display_name.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "access package displayName is required".to_string(),
            ));
        }
        if non_empty(Some(desired.catalog_name.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "access package catalogName is required".to_string(),
            ));
        }
        Ok(())
    }

    fn natural_key(&self, desired: &AccessPackageProperties) -> String {
        format!("{}/{}", desired.catalog_name, desired.display_name)
    }

    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &AccessPackageProperties,
    ) -> ReconcileResult<CatalogScope> {
        let catalog_id = resolve::resolve_catalog(ctx, &desired.catalog_name).await?;
        Ok(CatalogScope { catalog_id })
    }

    #[instrument(skip_all, fields(catalog_id = %scope.catalog_id))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &CatalogScope,
        desired: &AccessPackageProperties,
    ) -> ReconcileResult<Vec<AccessPackageSnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/catalogs/{}/accessPackages", scope.catalog_id),
            &[("$filter", odata::eq("displayName", &desired.display_name).as_str())],
        );
        Ok(ctx.graph.list(&path).await?)
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &CatalogScope,
        desired: &AccessPackageProperties,
    ) -> ReconcileResult<String> {
        let created: Identified = ctx
            .graph
            .post(
                &format!("{EM}/accessPackages"),
                &Self::create_body(desired, &scope.catalog_id),
            )
            .await?;
        Ok(created.id)
    }

    async fn diff(
        &self,
        _ctx: &ReconcileContext,
        _scope: &CatalogScope,
        desired: &AccessPackageProperties,
        existing: &AccessPackageSnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch
            .field("description", desired.description.as_ref(), existing.description.as_ref())?
            .field("isHidden", desired.is_hidden.as_ref(), existing.is_hidden.as_ref())?;
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        _scope: &CatalogScope,
        _desired: &AccessPackageProperties,
        existing: &AccessPackageSnapshot,
        patch: &Patch,
    ) -> ReconcileResult<String> {
        ctx.graph
            .patch(&format!("{EM}/accessPackages/{}", existing.id), &patch.to_body())
            .await?;
        Ok(existing.id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        _scope: &CatalogScope,
        _desired: &AccessPackageProperties,
        handle: &str,
    ) -> ReconcileResult<Option<AccessPackageSnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/accessPackages/{handle}"),
            &[("$expand", "catalog")],
        );
        Ok(ctx.graph.get_optional(&path).await?)
    }

    fn id_of(snapshot: &AccessPackageSnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: AccessPackageProperties,
        live: &AccessPackageSnapshot,
    ) -> AccessPackageProperties {
        AccessPackageProperties {
            display_name: live.display_name.clone().unwrap_or(desired.display_name),
            catalog_name: desired.catalog_name,
            description: live.description.clone().or(desired.description),
            is_hidden: live.is_hidden.or(desired.is_hidden),
            id: Some(live.id.clone()),
            catalog_id: live
                .catalog
                .as_ref()
                .map(|c| c.id.clone())
                .or(desired.catalog_id),
            created_date_time: live.created_date_time,
            modified_date_time: live.modified_date_time,
        }
    }
}
