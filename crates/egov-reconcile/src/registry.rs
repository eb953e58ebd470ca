//! Resource-type dispatch.
//!
//! Handlers are typed over their own property structs; the registry erases
//! that type so the orchestrator-facing entry point can route raw JSON
//! envelopes by resource type name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::contract::{Operation, Request, ResourceHandler};
use crate::handlers::{
    AccessPackageHandler, AssignmentPolicyHandler, AssignmentRequestHandler, CatalogHandler,
    CatalogResourceHandler, GroupPimEligibilityHandler, ResourceRoleScopeHandler,
    SecurityGroupHandler,
};
use crate::{Engine, ReconcileError, ReconcileResult};

/// Handler over JSON envelopes.
#[async_trait]
trait ErasedHandler: Send + Sync {
    fn resource_type(&self) -> &'static str;

    async fn handle_json(
        &self,
        engine: &Engine,
        operation: Operation,
        envelope: Value,
        cancel: CancellationToken,
    ) -> ReconcileResult<Value>;
}

#[async_trait]
impl<H> ErasedHandler for H
where
    H: ResourceHandler,
{
    fn resource_type(&self) -> &'static str {
        ResourceHandler::resource_type(self)
    }

    async fn handle_json(
        &self,
        engine: &Engine,
        operation: Operation,
        envelope: Value,
        cancel: CancellationToken,
    ) -> ReconcileResult<Value> {
        let request: Request<H::Properties> = serde_json::from_value(envelope)?;
        let ctx = engine.context(&request.config, cancel)?;
        let response = self.handle(&ctx, operation, request.properties).await?;
        Ok(serde_json::to_value(response)?)
    }
}

/// Registry of resource handlers, keyed case-insensitively by type name.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry with every built-in resource type.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(CatalogHandler)
            .register(AccessPackageHandler)
            .register(AssignmentPolicyHandler)
            .register(CatalogResourceHandler)
            .register(ResourceRoleScopeHandler)
            .register(AssignmentRequestHandler)
            .register(SecurityGroupHandler)
            .register(GroupPimEligibilityHandler);
        registry
    }

    /// Registers a handler, replacing any handler for the same type.
    pub fn register<H>(&mut self, handler: H) -> &mut Self
    where
        H: ResourceHandler + 'static,
    {
        let handler: Arc<dyn ErasedHandler> = Arc::new(handler);
        self.handlers
            .insert(handler.resource_type().to_ascii_lowercase(), handler);
        self
    }

    /// Registered resource type names, sorted.
    #[must_use]
    pub fn resource_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> =
            self.handlers.values().map(|h| h.resource_type()).collect();
        types.sort_unstable();
        types
    }

    /// Runs one operation on a raw request envelope.
    ///
    /// # Errors
    ///
    /// `UnknownResourceType` when no handler matches, `Serialization` when the
    /// envelope does not decode, and any error the handler returns.
    #[instrument(skip(self, engine, envelope, cancel), fields(resource_type = %resource_type, operation = %operation))]
    pub async fn dispatch(
        &self,
        engine: &Engine,
        resource_type: &str,
        operation: Operation,
        envelope: Value,
        cancel: CancellationToken,
    ) -> ReconcileResult<Value> {
        let handler = self
            .handlers
            .get(&resource_type.to_ascii_lowercase())
            .ok_or_else(|| ReconcileError::UnknownResourceType(resource_type.to_string()))?;

        let response = handler.handle_json(engine, operation, envelope, cancel).await?;
        info!("Operation complete");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;
    use serde_json::json;

    #[test]
    fn test_defaults_cover_every_type() {
        assert_eq!(
            HandlerRegistry::with_defaults().resource_types(),
            vec![
                "AccessPackage",
                "AssignmentPolicy",
                "AssignmentRequest",
                "Catalog",
                "CatalogResource",
                "GroupPimEligibility",
                "ResourceRoleScope",
                "SecurityGroup",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let engine = Engine::new(EngineConfig::for_testing()).unwrap();
        let err = HandlerRegistry::with_defaults()
            .dispatch(&engine, "Widget", Operation::Preview, json!({}), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownResourceType(t) if t == "Widget"));
    }

    #[tokio::test]
    async fn test_malformed_envelope_rejected() {
        let engine = Engine::new(EngineConfig::for_testing()).unwrap();
        let err = HandlerRegistry::with_defaults()
            .dispatch(
                &engine,
                "catalog",
                Operation::Preview,
                json!({"properties": {"displayName": "Sales"}}),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Serialization(_)));
    }
}
