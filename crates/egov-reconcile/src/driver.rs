//! Generic lookup / create / diff / update driver.
//!
//! Every resource type supplies a small [`Reconcilable`] strategy: how to
//! resolve its parents, how to find the object by natural key, how to create it,
//! how to compute the drifted fields and how to write and re-read it. The driver
//! owns the control flow shared by all of them:
//!
//! 1. validate the declared state (no network)
//! 2. resolve parent references by natural key
//! 3. look up the object; not-found means absent, more than one match is fatal
//! 4. create when absent, update when drifted, skip the write when in sync
//! 5. re-fetch after any write, tolerating replication lag, and treat a failed
//!    re-fetch as a partial success

use async_trait::async_trait;
use egov_graph::GraphError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::contract::ResourceHandler;
use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Per-entity strategy plugged into the generic driver.
#[async_trait]
pub trait Reconcilable: Send + Sync {
    /// Declared inputs plus resolved outputs.
    type Desired: Serialize + DeserializeOwned + Clone + Send + Sync;
    /// Parent identifiers resolved before touching the object.
    type Scope: Send + Sync;
    /// Immutable view of the live object, decoded once at the API boundary.
    type Snapshot: Send + Sync;

    /// Resource type name, also used in diagnostics.
    const KIND: &'static str;

    /// Local validation of the declared state. Runs before any network call.
    fn validate(&self, _desired: &Self::Desired) -> ReconcileResult<()> {
        Ok(())
    }

    /// Human-readable natural key, used in logs and errors.
    fn natural_key(&self, desired: &Self::Desired) -> String;

    /// Resolves parent references by natural key.
    async fn resolve_scope(
        &self,
        ctx: &ReconcileContext,
        desired: &Self::Desired,
    ) -> ReconcileResult<Self::Scope>;

    /// Every live object matching the natural key.
    async fn lookup(
        &self,
        ctx: &ReconcileContext,
        scope: &Self::Scope,
        desired: &Self::Desired,
    ) -> ReconcileResult<Vec<Self::Snapshot>>;

    /// Creates the object and returns the handle to re-fetch it by.
    async fn create(
        &self,
        ctx: &ReconcileContext,
        scope: &Self::Scope,
        desired: &Self::Desired,
    ) -> ReconcileResult<String>;

    /// Fields whose declared value differs from the live object.
    async fn diff(
        &self,
        ctx: &ReconcileContext,
        scope: &Self::Scope,
        desired: &Self::Desired,
        existing: &Self::Snapshot,
    ) -> ReconcileResult<Patch>;

    /// Applies a non-empty patch and returns the handle to re-fetch by.
    async fn update(
        &self,
        ctx: &ReconcileContext,
        scope: &Self::Scope,
        desired: &Self::Desired,
        existing: &Self::Snapshot,
        patch: &Patch,
    ) -> ReconcileResult<String>;

    /// Reads the object back after a write. `None` means not visible yet.
    async fn fetch(
        &self,
        ctx: &ReconcileContext,
        scope: &Self::Scope,
        desired: &Self::Desired,
        handle: &str,
    ) -> ReconcileResult<Option<Self::Snapshot>>;

    /// Server-assigned identifier of a snapshot.
    fn id_of(snapshot: &Self::Snapshot) -> &str;

    /// Overlays the live state onto the declared properties.
    fn resolved(&self, desired: Self::Desired, snapshot: &Self::Snapshot) -> Self::Desired;
}

/// What the driver did to converge an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Unchanged,
}

/// Result of a successful convergence.
#[derive(Debug)]
pub struct Converged<S> {
    pub snapshot: S,
    pub action: Action,
}

/// Converges one object to its declared state.
///
/// # Errors
///
/// Validation, parent resolution, ambiguity, remote and partial-success errors
/// are all fatal and returned as-is.
#[instrument(skip_all, fields(kind = R::KIND))]
pub async fn converge<R: Reconcilable>(
    strategy: &R,
    ctx: &ReconcileContext,
    desired: &R::Desired,
) -> ReconcileResult<Converged<R::Snapshot>> {
    strategy.validate(desired)?;
    let key = strategy.natural_key(desired);
    let scope = strategy.resolve_scope(ctx, desired).await?;

    let Some(existing) = lookup_one(strategy, ctx, &scope, desired, &key).await? else {
        info!(key = %key, "Object absent, creating");
        let handle = strategy.create(ctx, &scope, desired).await?;
        let snapshot = refetch(strategy, ctx, &scope, desired, &handle).await?;
        info!(key = %key, id = %R::id_of(&snapshot), "Created");
        return Ok(Converged {
            snapshot,
            action: Action::Created,
        });
    };

    let patch = strategy.diff(ctx, &scope, desired, &existing).await?;
    if patch.is_empty() {
        info!(key = %key, id = %R::id_of(&existing), "In sync, skipping write");
        return Ok(Converged {
            snapshot: existing,
            action: Action::Unchanged,
        });
    }

    info!(
        key = %key,
        id = %R::id_of(&existing),
        fields = ?patch.fields(),
        "Drift detected, updating"
    );
    let handle = strategy
        .update(ctx, &scope, desired, &existing, &patch)
        .await?;
    let snapshot = refetch(strategy, ctx, &scope, desired, &handle).await?;
    Ok(Converged {
        snapshot,
        action: Action::Updated,
    })
}

/// Read-only lookup for preview.
///
/// A parent that cannot be resolved means the object cannot exist yet either,
/// so it is reported as absent rather than as an error.
///
/// # Errors
///
/// Validation, ambiguity and non-not-found remote errors.
#[instrument(skip_all, fields(kind = R::KIND))]
pub async fn observe<R: Reconcilable>(
    strategy: &R,
    ctx: &ReconcileContext,
    desired: &R::Desired,
) -> ReconcileResult<Option<R::Snapshot>> {
    strategy.validate(desired)?;
    let key = strategy.natural_key(desired);
    let scope = match strategy.resolve_scope(ctx, desired).await {
        Ok(scope) => scope,
        Err(ReconcileError::ParentNotFound { kind, key: parent }) => {
            debug!(parent_kind = kind, parent = %parent, "Parent absent, nothing to preview");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };
    lookup_one(strategy, ctx, &scope, desired, &key).await
}

async fn lookup_one<R: Reconcilable>(
    strategy: &R,
    ctx: &ReconcileContext,
    scope: &R::Scope,
    desired: &R::Desired,
    key: &str,
) -> ReconcileResult<Option<R::Snapshot>> {
    let found = match strategy.lookup(ctx, scope, desired).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => {
            debug!(key = %key, "Lookup reported not found");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    debug!(key = %key, matches = found.len(), "Lookup complete");
    single_match(R::KIND, key, found)
}

async fn refetch<R: Reconcilable>(
    strategy: &R,
    ctx: &ReconcileContext,
    scope: &R::Scope,
    desired: &R::Desired,
    handle: &str,
) -> ReconcileResult<R::Snapshot> {
    let operation = format!("read back {} {handle}", R::KIND);
    ctx.await_visible(&operation, || strategy.fetch(ctx, scope, desired, handle))
        .await
        .map_err(|e| match e {
            cancelled @ (ReconcileError::Cancelled | ReconcileError::Remote(GraphError::Cancelled)) => {
                cancelled
            }
            other => ReconcileError::PartialSuccess {
                kind: R::KIND,
                id: handle.to_string(),
                source: Box::new(other),
            },
        })
}

/// Reduces lookup results to at most one object.
///
/// # Errors
///
/// `Ambiguous` when more than one object matches.
pub fn single_match<T>(kind: &'static str, key: &str, mut found: Vec<T>) -> ReconcileResult<Option<T>> {
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        count => Err(ReconcileError::Ambiguous {
            kind,
            key: key.to_string(),
            count,
        }),
    }
}

/// Field-level difference between declared and live state.
///
/// Holds the declared values of drifted fields, ready to be sent as a partial
/// update body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    fields: Map<String, Value>,
}

impl Patch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` when a declared value differs from the live one.
    ///
    /// Undeclared (`None`) values are never compared.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the declared value cannot be encoded.
    pub fn field<T>(
        &mut self,
        name: &str,
        desired: Option<&T>,
        existing: Option<&T>,
    ) -> ReconcileResult<&mut Self>
    where
        T: Serialize + PartialEq + ?Sized,
    {
        if let Some(desired) = desired {
            if existing != Some(desired) {
                self.fields
                    .insert(name.to_string(), serde_json::to_value(desired)?);
            }
        }
        Ok(self)
    }

    /// Records `name` when a declared document is not contained in the live one.
    pub fn document(&mut self, name: &str, desired: Option<&Value>, existing: Option<&Value>) -> &mut Self {
        if let Some(desired) = desired {
            let in_sync =
                existing.is_some_and(|existing| subset_under(Some(name), desired, existing));
            if !in_sync {
                self.fields.insert(name.to_string(), desired.clone());
            }
        }
        self
    }

    /// Records `name` unconditionally.
    pub fn force(&mut self, name: &str, value: Value) -> &mut Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Names of the drifted fields.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }

    /// The patch as a JSON object body.
    #[must_use]
    pub fn to_body(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Keys whose values are service enums, echoed back with different casing.
const ENUM_KEYS: &[&str] = &[
    "@odata.type",
    "allowedTargetScope",
    "approvalMode",
    "caller",
    "level",
    "notificationLevel",
    "notificationType",
    "operations",
    "recipientType",
    "scopeType",
    "type",
];

/// Whether every key declared in `desired` is present with an equal value in `existing`.
///
/// Objects compare by their declared keys only (extra live keys are ignored),
/// arrays element-wise, and scalars by equality. Values of enum-valued keys
/// compare case-insensitively. Used for the opaque documents the service
/// echoes back with additional server-populated fields.
#[must_use]
pub fn json_subset(desired: &Value, existing: &Value) -> bool {
    subset_under(None, desired, existing)
}

fn subset_under(key: Option<&str>, desired: &Value, existing: &Value) -> bool {
    match (desired, existing) {
        (Value::Object(d), Value::Object(e)) => d.iter().all(|(k, dv)| match e.get(k) {
            Some(ev) => subset_under(Some(k), dv, ev),
            None => dv.is_null(),
        }),
        (Value::Array(d), Value::Array(e)) => {
            d.len() == e.len() && d.iter().zip(e).all(|(dv, ev)| subset_under(key, dv, ev))
        }
        (Value::String(d), Value::String(e)) => {
            d == e || (key.is_some_and(|k| ENUM_KEYS.contains(&k)) && d.eq_ignore_ascii_case(e))
        }
        _ => desired == existing,
    }
}

#[async_trait]
impl<R> ResourceHandler for R
where
    R: Reconcilable,
{
    type Properties = R::Desired;

    fn resource_type(&self) -> &'static str {
        R::KIND
    }

    async fn preview(
        &self,
        ctx: &ReconcileContext,
        properties: Self::Properties,
    ) -> ReconcileResult<Self::Properties> {
        Ok(match observe(self, ctx, &properties).await? {
            Some(snapshot) => self.resolved(properties, &snapshot),
            None => properties,
        })
    }

    async fn create_or_update(
        &self,
        ctx: &ReconcileContext,
        properties: Self::Properties,
    ) -> ReconcileResult<Self::Properties> {
        let converged = converge(self, ctx, &properties).await?;
        Ok(self.resolved(properties, &converged.snapshot))
    }
}
