//! Name-to-id resolution of parent objects.
//!
//! Handlers that act inside a parent (an access package inside a catalog, a
//! policy on an access package, ...) resolve the parent by its natural key on
//! every invocation. A parent that cannot be found is a distinct
//! [`ReconcileError::ParentNotFound`], never "object absent".

use egov_graph::odata;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::driver::single_match;
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Entitlement-management API root.
pub(crate) const EM: &str = "identityGovernance/entitlementManagement";

/// Minimal projection of any directory object.
#[derive(Debug, Clone, Deserialize)]
pub struct Identified {
    pub id: String,
}

/// A group referenced either by object id or by unique name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_name: Option<String>,
}

impl GroupReference {
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            unique_name: None,
        }
    }

    #[must_use]
    pub fn by_name(unique_name: impl Into<String>) -> Self {
        Self {
            id: None,
            unique_name: Some(unique_name.into()),
        }
    }

    /// Whether at least one of id or unique name is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        non_empty(self.id.as_deref()).is_some() || non_empty(self.unique_name.as_deref()).is_some()
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Lists `path` and requires exactly one match.
async fn resolve_one<T: DeserializeOwned>(
    ctx: &ReconcileContext,
    kind: &'static str,
    key: &str,
    path: &str,
) -> ReconcileResult<T> {
    let found: Vec<T> = match ctx.graph.list(path).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    single_match(kind, key, found)?.ok_or_else(|| ReconcileError::ParentNotFound {
        kind,
        key: key.to_string(),
    })
}

/// Resolves a catalog id by display name.
///
/// # Errors
///
/// `ParentNotFound`, `Ambiguous` or a remote error.
#[instrument(skip(ctx))]
pub async fn resolve_catalog(ctx: &ReconcileContext, display_name: &str) -> ReconcileResult<String> {
    let path = odata::with_query(
        &format!("{EM}/catalogs"),
        &[("$filter", odata::eq("displayName", display_name).as_str()), ("$select", "id")],
    );
    let catalog: Identified = resolve_one(ctx, "Catalog", display_name, &path).await?;
    debug!(id = %catalog.id, "Resolved catalog");
    Ok(catalog.id)
}

/// Resolves an access package id by display name within a catalog.
///
/// # Errors
///
/// `ParentNotFound`, `Ambiguous` or a remote error.
#[instrument(skip(ctx))]
pub async fn resolve_access_package(
    ctx: &ReconcileContext,
    catalog_id: &str,
    display_name: &str,
) -> ReconcileResult<String> {
    let path = odata::with_query(
        &format!("{EM}/catalogs/{catalog_id}/accessPackages"),
        &[("$filter", odata::eq("displayName", display_name).as_str()), ("$select", "id")],
    );
    let package: Identified = resolve_one(ctx, "AccessPackage", display_name, &path).await?;
    debug!(id = %package.id, "Resolved access package");
    Ok(package.id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedObject {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

/// Resolves an assignment policy id by display name on an access package.
///
/// The service cannot filter policies by name and package together, so the
/// name is matched exactly on the client side.
///
/// # Errors
///
/// `ParentNotFound`, `Ambiguous` or a remote error.
#[instrument(skip(ctx))]
pub async fn resolve_assignment_policy(
    ctx: &ReconcileContext,
    access_package_id: &str,
    display_name: &str,
) -> ReconcileResult<String> {
    let path = odata::with_query(
        &format!("{EM}/assignmentPolicies"),
        &[
            ("$filter", odata::eq("accessPackage/id", access_package_id).as_str()),
            ("$select", "id,displayName"),
        ],
    );
    let policies: Vec<NamedObject> = match ctx.graph.list(&path).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let matching: Vec<NamedObject> = policies
        .into_iter()
        .filter(|p| p.display_name.as_deref() == Some(display_name))
        .collect();
    let policy = single_match("AssignmentPolicy", display_name, matching)?.ok_or_else(|| {
        ReconcileError::ParentNotFound {
            kind: "AssignmentPolicy",
            key: display_name.to_string(),
        }
    })?;
    debug!(id = %policy.id, "Resolved assignment policy");
    Ok(policy.id)
}

/// Resolves a catalog resource id by the origin id of the object it registers.
///
/// # Errors
///
/// `ParentNotFound`, `Ambiguous` or a remote error.
#[instrument(skip(ctx))]
pub async fn resolve_catalog_resource(
    ctx: &ReconcileContext,
    catalog_id: &str,
    origin_id: &str,
) -> ReconcileResult<String> {
    let path = odata::with_query(
        &format!("{EM}/catalogs/{catalog_id}/resources"),
        &[("$filter", odata::eq("originId", origin_id).as_str()), ("$select", "id")],
    );
    let resource: Identified = resolve_one(ctx, "CatalogResource", origin_id, &path).await?;
    Ok(resource.id)
}

/// Resolves a group reference to its object id.
///
/// An explicit id is confirmed to exist; a unique name is looked up.
///
/// # Errors
///
/// `Validation` when neither is set, otherwise `ParentNotFound`, `Ambiguous`
/// or a remote error.
#[instrument(skip(ctx))]
pub async fn resolve_group(
    ctx: &ReconcileContext,
    reference: &GroupReference,
) -> ReconcileResult<String> {
    if let Some(id) = non_empty(reference.id.as_deref()) {
        let path = odata::with_query(&format!("groups/{id}"), &[("$select", "id")]);
        return match ctx.graph.get_optional::<Identified>(&path).await? {
            Some(group) => Ok(group.id),
            None => Err(ReconcileError::ParentNotFound {
                kind: "SecurityGroup",
                key: id.to_string(),
            }),
        };
    }

    let Some(name) = non_empty(reference.unique_name.as_deref()) else {
        return Err(ReconcileError::Validation(
            "group reference needs an id or a unique name".to_string(),
        ));
    };
    let path = odata::with_query(
        "groups",
        &[("$filter", odata::eq("uniqueName", name).as_str()), ("$select", "id")],
    );
    let group: Identified = resolve_one(ctx, "SecurityGroup", name, &path).await?;
    debug!(id = %group.id, "Resolved group");
    Ok(group.id)
}

/// Resolves a user object id from a mail address or user principal name.
///
/// # Errors
///
/// `ParentNotFound`, `Ambiguous` or a remote error.
#[instrument(skip(ctx))]
pub async fn resolve_user(ctx: &ReconcileContext, email: &str) -> ReconcileResult<String> {
    let filter = format!(
        "{} or {}",
        odata::eq("mail", email),
        odata::eq("userPrincipalName", email)
    );
    let path = odata::with_query("users", &[("$filter", filter.as_str()), ("$select", "id")]);
    let user: Identified = resolve_one(ctx, "User", email, &path).await?;
    Ok(user.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_reference_is_set() {
        assert!(GroupReference::by_id("g-1").is_set());
        assert!(GroupReference::by_name("ops-admins").is_set());
        assert!(!GroupReference::default().is_set());
        assert!(!GroupReference {
            id: Some("  ".into()),
            unique_name: None
        }
        .is_set());
    }

    #[test]
    fn test_group_reference_decoding() {
        let reference: GroupReference =
            serde_json::from_str(r#"{"uniqueName": "ops-admins"}"#).unwrap();
        assert_eq!(reference, GroupReference::by_name("ops-admins"));
    }
}
