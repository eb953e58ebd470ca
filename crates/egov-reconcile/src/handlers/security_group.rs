//! Security groups keyed by unique name.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use egov_graph::odata;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use crate::driver::{Patch, Reconcilable};
use crate::resolve::{non_empty, Identified};
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Members that can be bound inline when creating a group.
const INLINE_MEMBER_LIMIT: usize = 20;

const GROUP_SELECT: &str = "id,uniqueName,displayName,description,mailNickname,createdDateTime";

/// Declared and resolved security group properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupProperties {
    pub unique_name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Derived from `uniqueName` when not declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_nickname: Option<String>,
    /// Member object ids. When declared, replaces the current membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<String>>,

    // Outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
}

impl SecurityGroupProperties {
    fn effective_mail_nickname(&self) -> String {
        match non_empty(self.mail_nickname.as_deref()) {
            Some(nickname) => nickname.to_string(),
            None => derive_mail_nickname(&self.unique_name),
        }
    }

    fn declared_members(&self) -> Option<BTreeSet<String>> {
        self.members.as_ref().map(|members| {
            members
                .iter()
                .filter_map(|m| non_empty(Some(m.as_str())))
                .map(str::to_ascii_lowercase)
                .collect()
        })
    }
}

/// Keeps the characters a mail nickname allows.
fn derive_mail_nickname(unique_name: &str) -> String {
    let nickname: String = unique_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if nickname.is_empty() {
        "group".to_string()
    } else {
        nickname
    }
}

/// Live group.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub id: String,
    #[serde(default)]
    pub unique_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mail_nickname: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
}

/// Security groups with replace-based membership.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityGroupHandler;

impl SecurityGroupHandler {
    fn member_ref(ctx: &ReconcileContext, member_id: &str) -> String {
        ctx.graph.url(&format!("directoryObjects/{member_id}"))
    }

    fn create_body(ctx: &ReconcileContext, desired: &SecurityGroupProperties) -> Value {
        let mut body = json!({
            "displayName": desired.display_name,
            "uniqueName": desired.unique_name,
            "mailEnabled": false,
            "mailNickname": desired.effective_mail_nickname(),
            "securityEnabled": true,
        });
        if let Some(description) = &desired.description {
            body["description"] = json!(description);
        }
        let inline: Vec<String> = desired
            .declared_members()
            .unwrap_or_default()
            .iter()
            .take(INLINE_MEMBER_LIMIT)
            .map(|m| Self::member_ref(ctx, m))
            .collect();
        if !inline.is_empty() {
            body["members@odata.bind"] = json!(inline);
        }
        body
    }

    async fn current_members(
        ctx: &ReconcileContext,
        group_id: &str,
    ) -> ReconcileResult<BTreeSet<String>> {
        let path = odata::with_query(&format!("groups/{group_id}/members"), &[("$select", "id")]);
        let members: Vec<Identified> = ctx.graph.list(&path).await?;
        Ok(members
            .into_iter()
            .map(|m| m.id.to_ascii_lowercase())
            .collect())
    }

    async fn add_member(
        ctx: &ReconcileContext,
        group_id: &str,
        member_id: &str,
    ) -> ReconcileResult<()> {
        ctx.graph
            .post_no_content(
                &format!("groups/{group_id}/members/$ref"),
                &json!({ "@odata.id": Self::member_ref(ctx, member_id) }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(ctx, desired))]
    async fn replace_members(
        ctx: &ReconcileContext,
        group_id: &str,
        desired: &BTreeSet<String>,
    ) -> ReconcileResult<()> {
        let current = Self::current_members(ctx, group_id).await?;
        let to_add: Vec<&String> = desired.difference(&current).collect();
        let to_remove: Vec<&String> = current.difference(desired).collect();
        info!(
            adding = to_add.len(),
            removing = to_remove.len(),
            "Replacing group membership"
        );

        for member in to_add {
            Self::add_member(ctx, group_id, member).await?;
        }
        for member in to_remove {
            ctx.graph
                .delete(&format!("groups/{group_id}/members/{member}/$ref"))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcilable for SecurityGroupHandler {
    type Desired = SecurityGroupProperties;
    type Scope = ();
    type Snapshot = GroupSnapshot;

    const KIND: &'static str = "SecurityGroup";

    fn validate(&self, desired: &SecurityGroupProperties) -> ReconcileResult<()> {
        if non_empty(Some(desired.unique_name.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "security group uniqueName is required".to_string(),
            ));
        }
        if non_empty(Some(desired.display_name.as_str())).is_none() {
            return Err(ReconcileError::Validation(
                "security group displayName is required".to_string(),
            ));
        }
        Ok(())
    }

    fn natural_key(&self, desired: &SecurityGroupProperties) -> String {
        desired.unique_name.clone()
    }

    async fn resolve_scope(
        &self,
        _ctx: &ReconcileContext,
        _desired: &SecurityGroupProperties,
    ) -> ReconcileResult<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(unique_name = %desired.unique_name))]
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        desired: &SecurityGroupProperties,
    ) -> ReconcileResult<Vec<GroupSnapshot>> {
        let path = odata::with_query(
            "groups",
            &[
                ("$filter", odata::eq("uniqueName", &desired.unique_name).as_str()),
                ("$select", GROUP_SELECT),
            ],
        );
        Ok(ctx.graph.list(&path).await?)
    }

    async fn create(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        desired: &SecurityGroupProperties,
    ) -> ReconcileResult<String> {
        let created: Identified = ctx
            .graph
            .post("groups", &Self::create_body(ctx, desired))
            .await?;

        let declared = desired.declared_members().unwrap_or_default();
        for member in declared.iter().skip(INLINE_MEMBER_LIMIT) {
            Self::add_member(ctx, &created.id, member).await?;
        }
        Ok(created.id)
    }

    async fn diff(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        desired: &SecurityGroupProperties,
        existing: &GroupSnapshot,
    ) -> ReconcileResult<Patch> {
        let mut patch = Patch::new();
        patch
            .field("displayName", Some(&desired.display_name), existing.display_name.as_ref())?
            .field("description", desired.description.as_ref(), existing.description.as_ref())?;

        if let Some(declared) = desired.declared_members() {
            let current = Self::current_members(ctx, &existing.id).await?;
            debug!(declared = declared.len(), current = current.len(), "Compared membership");
            if declared != current {
                patch.force("members", json!(declared));
            }
        }
        Ok(patch)
    }

    async fn update(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        desired: &SecurityGroupProperties,
        existing: &GroupSnapshot,
        patch: &Patch,
    ) -> ReconcileResult<String> {
        let mut scalars = patch.to_body();
        if let Some(fields) = scalars.as_object_mut() {
            fields.remove("members");
        }
        if scalars.as_object().is_some_and(|fields| !fields.is_empty()) {
            ctx.graph
                .patch(&format!("groups/{}", existing.id), &scalars)
                .await?;
        }

        if patch.contains("members") {
            if let Some(declared) = desired.declared_members() {
                Self::replace_members(ctx, &existing.id, &declared).await?;
            }
        }
        Ok(existing.id.clone())
    }

    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        _scope: &(),
        _desired: &SecurityGroupProperties,
        handle: &str,
    ) -> ReconcileResult<Option<GroupSnapshot>> {
        let path = odata::with_query(&format!("groups/{handle}"), &[("$select", GROUP_SELECT)]);
        Ok(ctx.graph.get_optional(&path).await?)
    }

    fn id_of(snapshot: &GroupSnapshot) -> &str {
        &snapshot.id
    }

    fn resolved(
        &self,
        desired: SecurityGroupProperties,
        live: &GroupSnapshot,
    ) -> SecurityGroupProperties {
        SecurityGroupProperties {
            unique_name: live.unique_name.clone().unwrap_or(desired.unique_name),
            display_name: live.display_name.clone().unwrap_or(desired.display_name),
            description: live.description.clone().or(desired.description),
            mail_nickname: live.mail_nickname.clone().or(desired.mail_nickname),
            members: desired.members,
            id: Some(live.id.clone()),
            created_date_time: live.created_date_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(extra: Value) -> SecurityGroupProperties {
        let mut value = json!({"uniqueName": "ops-admins", "displayName": "Ops Admins"});
        if let (Some(target), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_mail_nickname_derivation() {
        assert_eq!(derive_mail_nickname("ops-admins.prod"), "opsadminsprod");
        assert_eq!(derive_mail_nickname("---"), "group");
        assert_eq!(
            desired(json!({"mailNickname": "ops"})).effective_mail_nickname(),
            "ops"
        );
    }

    #[test]
    fn test_create_body_binds_first_members_inline() {
        let ctx = crate::context::tests::offline_context();
        let members: Vec<String> = (0..25).map(|i| format!("u-{i}")).collect();
        let body = SecurityGroupHandler::create_body(&ctx, &desired(json!({"members": members})));

        assert_eq!(body["securityEnabled"], true);
        assert_eq!(body["mailEnabled"], false);
        assert_eq!(body["mailNickname"], "opsadmins");
        let bound = body["members@odata.bind"].as_array().unwrap();
        assert_eq!(bound.len(), INLINE_MEMBER_LIMIT);
        assert_eq!(bound[0], "http://127.0.0.1:9/v1.0/directoryObjects/u-0");
    }

    #[test]
    fn test_create_body_binds_each_member_once() {
        let ctx = crate::context::tests::offline_context();
        let body = SecurityGroupHandler::create_body(
            &ctx,
            &desired(json!({"members": ["u-1", " u-1 ", "U-1", "", "u-2"]})),
        );
        assert_eq!(
            body["members@odata.bind"],
            json!([
                "http://127.0.0.1:9/v1.0/directoryObjects/u-1",
                "http://127.0.0.1:9/v1.0/directoryObjects/u-2"
            ])
        );

        let body = SecurityGroupHandler::create_body(&ctx, &desired(json!({"members": ["  "]})));
        assert!(body.get("members@odata.bind").is_none());
    }

    #[test]
    fn test_members_undeclared_means_unmanaged() {
        assert!(desired(json!({})).declared_members().is_none());
        let declared = desired(json!({"members": ["U-1", "u-2", ""]}))
            .declared_members()
            .unwrap();
        assert_eq!(declared.len(), 2);
        assert!(declared.contains("u-1"));
    }
}
