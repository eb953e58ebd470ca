//! Resource role scopes: a role on a catalog resource granted by an access package.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::driver::{single_match, Patch, Reconcilable};
use crate::resolve::{self, non_empty, Identified, EM};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

fn default_origin_system() -> String {
    "AadGroup".to_string()
}

fn default_role_name() -> String {
    "Member".to_string()
}

/// Declared and resolved role scope properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRoleScopeProperties {
    pub catalog_name: String,
    pub access_package_name: String,
    /// Origin id of the catalog resource (the group object id for groups).
    pub resource_origin_id: String,
    #[serde(default = "default_origin_system")]
    pub resource_origin_system: String,
    #[serde(default = "default_role_name")]
    pub role_name: String,
    /// Origin id of the role. Derived as `<roleName>_<resourceOriginId>` for groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_origin_id: Option<String>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
}

impl ResourceRoleScopeProperties {
    fn is_group(&self) -> bool {
        self.resource_origin_system.eq_ignore_ascii_case("AadGroup")
    }

    /// The role origin id, derived for group resources when not declared.
    fn effective_role_origin_id(&self) -> Option<String> {
        match non_empty(self.role_origin_id.as_deref()) {
            Some(id) => Some(id.to_string()),
            None if self.is_group() => {
                Some(format!("{}_{}", self.role_name, self.resource_origin_id))
            }
            None => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    #[serde(default)]
    pub origin_id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRef {
    #[serde(default)]
    pub origin_id: Option<String>,
}

/// Live role scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleScopeSnapshot {
    pub id: String,
    #[serde(default)]
    pub role: Option<RoleRef>,
    #[serde(default)]
    pub scope: Option<ScopeRef>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
}

impl RoleScopeSnapshot {
    fn matches(&self, role_origin_id: &str, resource_origin_id: &str) -> bool {
        let role = self.role.as_ref().and_then(|r| r.origin_id.as_deref());
        let scope = self.scope.as_ref().and_then(|s| s.origin_id.as_deref());
        role.is_some_and(|r| r.eq_ignore_ascii_case(role_origin_id))
            && scope.is_some_and(|s| s.eq_ignore_ascii_case(resource_origin_id))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageWithScopes {
    #[serde(default)]
    resource_role_scopes: Vec<RoleScopeSnapshot>,
}

/// Role scopes keyed by (access package, resource origin id, role origin id).
///
/// Role scopes are immutable on the service side: drift is reported, never patched.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceRoleScopeHandler;

pub struct RoleScopeScope {
    access_package_id: String,
    resource_id: String,
    role_origin_id: String,
}

impl ResourceRoleScopeHandler {
    fn create_body(desired: &ResourceRoleScopeProperties, scope: &RoleScopeScope) -> Value {
        json!({
            "role": {
                "originId": scope.role_origin_id,
                "displayName": desired.role_name,
                "originSystem": desired.resource_origin_system,
                "resource": {
                    "id": scope.resource_id,
                    "originId": desired.resource_origin_id,
                    "originSystem": desired.resource_origin_system,
                },
            },
            "scope": {
                "originId": desired.resource_origin_id,
                "originSystem": desired.resource_origin_system,
                "isRootScope": true,
            },
        })
    }

    async fn list_matching(
        ctx: &ReconcileContext,
        scope: &RoleScopeScope,
        resource_origin_id: &str,
    ) -> ReconcileResult<Vec<RoleScopeSnapshot>> {
        let path = odata::with_query(
            &format!("{EM}/accessPackages/{}", scope.access_package_id),
            &[("$expand", "resourceRoleScopes($expand=role,scope)")],
        );
        let package: PackageWithScopes = ctx.graph.get(&path).await?;
        Ok(package
            .resource_role_scopes
            .into_iter()
            .filter(|s| s.matches(&scope.role_origin_id, resource_origin_id))
            .collect())
    }
}

#[async_trait]
impl Reconcilable for ResourceRoleScopeHandler {
    type Desired = ResourceRoleScopeProperties;
    type Scope = RoleScopeScope;
    type Snapshot = RoleScopeSnapshot;

    const KIND: &'static str = "ResourceRoleScope";

    fn validate(&self, desired: &ResourceRoleScopeProperties) -> ReconcileResult<()> {
        for (field, value) in [
            ("catalogName", &desired.catalog_name),
            ("accessPackageName", &desired.access_package_name),
            ("resourceOriginId", &desired.resource_origin_id),
        ] {
            if non_empty(Some(value.as_str())).is_none() {
                return Err(ReconcileError::Validation(format!(
                    "resource role scope {field} is required"
                )));
            }
        }
        if desired.effective_role_origin_id().is_none() {
            return Err(ReconcileError::Validation(format!(
                "roleOriginId is required for {} resources",
                desired.resource_origin_system
            )));
        }
        Ok(())
    }

    fn natural_key(&self, desired: &ResourceRoleScopeProperties) -> String {
        format!(
            "{}/{}/{}",
            desired.access_package_name,
            desired.resource_origin_id,
            desired.effective_role_origin_id().unwrap_or_default()
        )
    }

    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &ResourceRoleScopeProperties,
    ) -> ReconcileResult<RoleScopeScope> {
        let role_origin_id = desired.effective_role_origin_id().ok_or_else(|| {
            ReconcileError::Validation("roleOriginId could not be derived".to_string())
        })?;
        let catalog_id = resolve::resolve_catalog(ctx, &desired.catalog_name).await?;
        let access_package_id =
            resolve::resolve_access_package(ctx, &catalog_id, &desired.access_package_name)
                .await?;
        let resource_id =
            resolve::resolve_catalog_resource(ctx, &catalog_id, &desired.resource_origin_id)
                .await?;
        Ok(RoleScopeScope {
            access_package_id,
            resource_id,
            role_origin_id,
        })
    }

    #[instrument(skip_all, fields(access_package_id = %scope.access_package_id))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &RoleScopeScope,
        desired: &ResourceRoleScopeProperties,
    ) -> ReconcileResult<Vec<RoleScopeSnapshot>> {
        Self::list_matching(ctx, scope, &desired.resource_origin_id).await
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &RoleScopeScope,
        desired: &ResourceRoleScopeProperties,
    ) -> ReconcileResult<String> {
        let created: Identified = ctx
            .graph
            .post(
                &format!(
                    "{EM}/accessPackages/{}/resourceRoleScopes",
                    scope.access_package_id
                ),
                &Self::create_body(desired, scope),
            )
            .await?;
        Ok(created.id)
    }

    async fn diff(
        &self,
        _ctx: &ReconcileContext,
        _scope: &RoleScopeScope,
        desired: &ResourceRoleScopeProperties,
        existing: &RoleScopeSnapshot,
    ) -> ReconcileResult<Patch> {
        let live_name = existing.role.as_ref().and_then(|r| r.display_name.as_deref());
        if let Some(live_name) = live_name {
            if !live_name.eq_ignore_ascii_case(&desired.role_name) {
                warn!(
                    id = %existing.id,
                    declared = %desired.role_name,
                    live = %live_name,
                    "Role scopes cannot be modified; leaving drifted role name in place"
                );
            }
        }
        Ok(Patch::new())
    }

    async fn update(
        &self,
        _ctx: &ReconcileContext,
        _scope: &RoleScopeScope,
        _desired: &ResourceRoleScopeProperties,
        existing: &RoleScopeSnapshot,
        _patch: &Patch,
    ) -> ReconcileResult<String> {
        Ok(existing.id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        scope: &RoleScopeScope,
        desired: &ResourceRoleScopeProperties,
        handle: &str,
    ) -> ReconcileResult<Option<RoleScopeSnapshot>> {
        let found = Self::list_matching(ctx, scope, &desired.resource_origin_id).await?;
        single_match(Self::KIND, handle, found)
    }

    fn id_of(snapshot: &RoleScopeSnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: ResourceRoleScopeProperties,
        live: &RoleScopeSnapshot,
    ) -> ResourceRoleScopeProperties {
        let role_origin_id = live
            .role
            .as_ref()
            .and_then(|r| r.origin_id.clone())
            .or_else(|| desired.effective_role_origin_id());
        ResourceRoleScopeProperties {
            role_origin_id,
            id: Some(live.id.clone()),
            created_date_time: live.created_date_time,
            ..desired
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(extra: Value) -> ResourceRoleScopeProperties {
        let mut value = json!({
            "catalogName": "Sales",
            "accessPackageName": "Sales Reps",
            "resourceOriginId": "g-1"
        });
        if let (Some(target), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_group_role_origin_is_derived() {
        let props = desired(json!({}));
        assert_eq!(props.effective_role_origin_id().as_deref(), Some("Member_g-1"));

        let owner = desired(json!({"roleName": "Owner"}));
        assert_eq!(owner.effective_role_origin_id().as_deref(), Some("Owner_g-1"));
    }

    #[test]
    fn test_non_group_needs_explicit_role() {
        let props = desired(json!({"resourceOriginSystem": "SharePointOnline"}));
        assert!(ResourceRoleScopeHandler.validate(&props).is_err());

        let props = desired(json!({
            "resourceOriginSystem": "SharePointOnline",
            "roleOriginId": "4"
        }));
        assert!(ResourceRoleScopeHandler.validate(&props).is_ok());
    }

    #[test]
    fn test_snapshot_matching() {
        let live: RoleScopeSnapshot = serde_json::from_value(json!({
            "id": "rs-1",
            "role": {"originId": "Member_g-1", "displayName": "Member"},
            "scope": {"originId": "g-1", "isRootScope": true}
        }))
        .unwrap();
        assert!(live.matches("Member_g-1", "g-1"));
        assert!(!live.matches("Owner_g-1", "g-1"));
        assert!(!live.matches("Member_g-1", "g-2"));
    }

    #[test]
    fn test_create_body_links_resource() {
        let props = desired(json!({}));
        let scope = RoleScopeScope {
            access_package_id: "ap-1".into(),
            resource_id: "res-1".into(),
            role_origin_id: "Member_g-1".into(),
        };
        let body = ResourceRoleScopeHandler::create_body(&props, &scope);
        assert_eq!(body["role"]["resource"]["id"], "res-1");
        assert_eq!(body["role"]["originId"], "Member_g-1");
        assert_eq!(body["scope"]["originId"], "g-1");
    }

    #[tokio::test]
    async fn test_drift_never_produces_a_patch() {
        let live: RoleScopeSnapshot = serde_json::from_value(json!({
            "id": "rs-1",
            "role": {"originId": "Member_g-1", "displayName": "Owner"},
            "scope": {"originId": "g-1"}
        }))
        .unwrap();
        let scope = RoleScopeScope {
            access_package_id: "ap-1".into(),
            resource_id: "res-1".into(),
            role_origin_id: "Member_g-1".into(),
        };
        let ctx = crate::context::tests::offline_context();
        let patch = ResourceRoleScopeHandler
            .diff(&ctx, &scope, &desired(json!({})), &live)
            .await
            .unwrap();
        assert!(patch.is_empty());
    }
}
