//! Access package catalogs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;

use crate::driver::{Patch, Reconcilable};
use crate::resolve::{non_empty, Identified, EM};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Who manages a catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CatalogType {
    UserManaged,
    ServiceDefault,
    ServiceManaged,
    #[serde(other)]
    UnknownFutureValue,
}

/// Whether access packages in a catalog can be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CatalogState {
    Unpublished,
    Published,
    #[serde(other)]
    UnknownFutureValue,
}

/// Declared and resolved catalog properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProperties {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_externally_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_type: Option<CatalogType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<CatalogState>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_date_time: Option<DateTime<Utc>>,
}

/// Live catalog as returned by the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_externally_visible: Option<bool>,
    #[serde(default)]
    pub catalog_type: Option<CatalogType>,
    #[serde(default)]
    pub state: Option<CatalogState>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_date_time: Option<DateTime<Utc>>,
}

/// Catalogs keyed by display name.
#[derive(Debug, Default, Clone, Copy)]
pub struct CatalogHandler;

impl CatalogHandler {
    fn create_body(desired: &CatalogProperties) -> Value {
        let mut body = json!({ "displayName": desired.display_name });
        if let Some(description) = &desired.description {
            body["description"] = json!(description);
        }
        if let Some(visible) = desired.is_externally_visible {
            body["isExternallyVisible"] = json!(visible);
        }
        if let Some(catalog_type) = desired.catalog_type {
            body["catalogType"] = json!(catalog_type);
        }
        if let Some(state) = desired.state {
            body["state"] = json!(state);
        }
        body
    }
}

#[async_trait]
impl Reconcilable for CatalogHandler {
    type Desired = CatalogProperties;
    type Scope = ();
    type Snapshot = CatalogSnapshot;

    const KIND: &'static str = "Catalog";

    fn validate(&self, desired: &CatalogProperties) -> ReconcileResult<()> {
        if non_empty(Some(desired.display_name.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "catalog displayName is required".to_string(),
            ));
        }
        Ok(())
    }

    fn natural_key(&self, desired: &CatalogProperties) -> String {
        desired.display_name.clone()
    }

    async fn resolve_scope(
        &self,
        _ctx: &ReconcileContext,
        _desired: &CatalogProperties,
    ) -> ReconcileResult<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(display_name = %desired.display_name))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        desired: &CatalogProperties,
    ) -> ReconcileResult<Vec<CatalogSnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/catalogs"),
            &[("$filter", odata::eq("displayName", &desired.display_name).as_str())],
        );
        Ok(ctx.graph.list(&path).await?)
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        desired: &CatalogProperties,
    ) -> ReconcileResult<String> {
        let created: Identified = ctx
            .graph
            .post(&format!("{EM}/catalogs"), &Self::create_body(desired))
            .await?;
        Ok(created.id)
    }

    async fn diff(
        &self,
        _ctx: &ReconcileContext,
        _scope: &(),
        desired: &CatalogProperties,
        existing: &CatalogSnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch
            .field("description", desired.description.as_ref(), existing.description.as_ref())?
            .field(
                "isExternallyVisible",
                desired.is_externally_visible.as_ref(),
                existing.is_externally_visible.as_ref(),
            )?
            .field("catalogType", desired.catalog_type.as_ref(), existing.catalog_type.as_ref())?
            .field("state", desired.state.as_ref(), existing.state.as_ref())?;
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        _desired: &CatalogProperties,
        existing: &CatalogSnapshot,
        patch: &Patch,
    ) -> ReconcileResult<String> {
        ctx.graph
            .patch(&format!("{EM}/catalogs/{}", existing.id), &patch.to_body())
            .await?;
        Ok(existing.id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        _desired: &CatalogProperties,
        handle: &str,
    ) -> ReconcileResult<Option<CatalogSnapshot>> {
        Ok(ctx.graph.get_optional(&format!("{EM}/catalogs/{handle}")).await?)
    }

    fn id_of(snapshot: &CatalogSnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(&self, desired: CatalogProperties, live: &CatalogSnapshot) -> CatalogProperties {
        CatalogProperties {
            display_name: live.display_name.clone().unwrap_or(desired.display_name),
            description: live.description.clone().or(desired.description),
            is_externally_visible: live.is_externally_visible.or(desired.is_externally_visible),
            catalog_type: live.catalog_type.or(desired.catalog_type),
            state: live.state.or(desired.state),
            id: Some(live.id.clone()),
            created_date_time: live.created_date_time,
            modified_date_time: live.modified_date_time,
        }
    }
}
