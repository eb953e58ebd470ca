//! The two-phase protocol exchanged with the orchestrator.
//!
//! The orchestrator invokes the engine once per declared resource with a
//! [`Request`] envelope carrying the desired properties and the service
//! configuration, and receives a [`Response`] carrying the resolved properties.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{ReconcileContext, ReconcileError, ReconcileResult};

/// Where and as whom to call the governance service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Base URL of the service; empty selects the public Graph endpoint.
    #[serde(default, alias = "ServiceEndpoint")]
    pub service_endpoint: String,
    /// Opaque bearer token supplied by the caller.
    #[serde(alias = "BearerToken", deserialize_with = "deserialize_secret")]
    pub bearer_token: SecretString,
}

impl ServiceConfig {
    /// Builds a configuration in code.
    #[must_use]
    pub fn new(service_endpoint: impl Into<String>, bearer_token: SecretString) -> Self {
        Self {
            service_endpoint: service_endpoint.into(),
            bearer_token,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Request envelope: desired state plus service configuration.
#[derive(Debug, Deserialize)]
pub struct Request<P> {
    #[serde(alias = "Properties")]
    pub properties: P,
    #[serde(alias = "Config")]
    pub config: ServiceConfig,
}

/// Response envelope: resolved remote state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response<P> {
    pub properties: P,
}

/// The operations every handler supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read-only what-if: overlays the live object onto the declared properties.
    Preview,
    /// Converges the remote object to the declared properties.
    CreateOrUpdate,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Preview => write!(f, "preview"),
            Operation::CreateOrUpdate => write!(f, "createOrUpdate"),
        }
    }
}

impl FromStr for Operation {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "preview" => Ok(Operation::Preview),
            "createorupdate" => Ok(Operation::CreateOrUpdate),
            other => Err(ReconcileError::Validation(format!(
                "Unknown operation: {other}"
            ))),
        }
    }
}

/// A resource type the engine knows how to reconcile.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Declared inputs plus read-only outputs, as exchanged in the envelope.
    type Properties: Serialize + DeserializeOwned + Send + Sync;

    /// Name under which the orchestrator addresses this resource type.
    fn resource_type(&self) -> &'static str;

    /// Looks the object up and overlays its live attributes, never writing.
    async fn preview(
        &self,
        ctx: &ReconcileContext,
        properties: Self::Properties,
    ) -> ReconcileResult<Self::Properties>;

    /// Creates the object if absent, updates drifted fields if present.
    async fn create_or_update(
        &self,
        ctx: &ReconcileContext,
        properties: Self::Properties,
    ) -> ReconcileResult<Self::Properties>;

    /// Runs one operation on a decoded envelope.
    async fn handle(
        &self,
        ctx: &ReconcileContext,
        operation: Operation,
        properties: Self::Properties,
    ) -> ReconcileResult<Response<Self::Properties>> {
        let properties = match operation {
            Operation::Preview => self.preview(ctx, properties).await?,
            Operation::CreateOrUpdate => self.create_or_update(ctx, properties).await?,
        };
        Ok(Response { properties })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;

    #[test]
    fn test_request_accepts_both_casings() {
        let lower: Request<serde_json::Value> = serde_json::from_value(json!({
            "properties": {"displayName": "Sales"},
            "config": {"serviceEndpoint": "https://graph.example/v1.0", "bearerToken": "t"}
        }))
        .unwrap();
        let upper: Request<serde_json::Value> = serde_json::from_value(json!({
            "Properties": {"displayName": "Sales"},
            "Config": {"serviceEndpoint": "https://graph.example/v1.0", "bearerToken": "t"}
        }))
        .unwrap();

        assert_eq!(lower.properties, upper.properties);
        assert_eq!(upper.config.service_endpoint, "https://graph.example/v1.0");
        assert_eq!(upper.config.bearer_token.expose_secret(), "t");
    }

    #[test]
    fn test_service_endpoint_defaults_to_empty() {
        let config: ServiceConfig = serde_json::from_value(json!({"bearerToken": "t"})).unwrap();
        assert!(config.service_endpoint.is_empty());
    }

    #[test]
    fn test_token_is_not_debug_printed() {
        let config: ServiceConfig =
            serde_json::from_value(json!({"bearerToken": "super-secret"})).unwrap();
        assert!(!format!("{config:?}").contains("super-secret"));
    }

    #[test]
    fn test_operation_parsing() {
        assert_eq!("preview".parse::<Operation>().unwrap(), Operation::Preview);
        assert_eq!(
            "create-or-update".parse::<Operation>().unwrap(),
            Operation::CreateOrUpdate
        );
        assert_eq!(
            "CreateOrUpdate".parse::<Operation>().unwrap(),
            Operation::CreateOrUpdate
        );
        assert!("delete".parse::<Operation>().is_err());
    }
}
