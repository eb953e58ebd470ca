//! Per-invocation execution context.

use std::future::Future;

use egov_graph::GraphClient;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::poll::{self, PollConfig, PollStep};
use crate::{EngineConfig, ReconcileError, ReconcileResult, ServiceConfig};

/// Long-lived engine state: configuration and a shared connection pool.
///
/// The engine holds no per-resource state. Every invocation gets a fresh
/// [`ReconcileContext`] bound to the caller's endpoint, token and cancellation.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    http_client: reqwest::Client,
}

impl Engine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client cannot be built.
    pub fn new(config: EngineConfig) -> ReconcileResult<Self> {
        config
            .validate()
            .map_err(|e| ReconcileError::Validation(e.to_string()))?;
        let http_client = config.http.build_http_client()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Binds a context to one request's service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is malformed or the token is empty.
    pub fn context(
        &self,
        service: &ServiceConfig,
        cancel: CancellationToken,
    ) -> ReconcileResult<ReconcileContext> {
        let token = SecretString::from(service.bearer_token.expose_secret().to_owned());
        let graph = GraphClient::with_http_client(
            self.http_client.clone(),
            &service.service_endpoint,
            token,
            self.config.http.clone(),
        )?
        .with_cancellation(cancel.clone());

        Ok(ReconcileContext {
            graph,
            poll: self.config.poll.clone(),
            lookup_retry: self.config.lookup_retry.clone(),
            cancel,
        })
    }
}

/// Everything one reconciliation needs: transport, bounds and cancellation.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    pub graph: GraphClient,
    pub poll: PollConfig,
    pub lookup_retry: PollConfig,
    pub cancel: CancellationToken,
}

impl ReconcileContext {
    /// Polls an asynchronous request with the delivery bounds.
    ///
    /// # Errors
    ///
    /// See [`poll::poll_until`].
    pub async fn poll<T, F, Fut>(&self, operation: &str, step: F) -> ReconcileResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ReconcileResult<PollStep<T>>>,
    {
        poll::poll_until(&self.cancel, &self.poll, operation, step).await
    }

    /// Retries a lookup through replication lag with the lookup bounds.
    ///
    /// # Errors
    ///
    /// See [`poll::await_visible`].
    pub async fn await_visible<T, F, Fut>(&self, operation: &str, lookup: F) -> ReconcileResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ReconcileResult<Option<T>>>,
    {
        poll::await_visible(&self.cancel, &self.lookup_retry, operation, lookup).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A context whose transport is never expected to be called.
    pub(crate) fn offline_context() -> ReconcileContext {
        let engine = Engine::new(EngineConfig::for_testing()).unwrap();
        let service = ServiceConfig::new(
            "http://127.0.0.1:9/v1.0",
            SecretString::from("offline".to_string()),
        );
        engine.context(&service, CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_context_rejects_empty_token() {
        let engine = Engine::new(EngineConfig::for_testing()).unwrap();
        let service = ServiceConfig::new("", SecretString::from(String::new()));
        assert!(engine.context(&service, CancellationToken::new()).is_err());
    }

    #[test]
    fn test_context_defaults_endpoint() {
        let engine = Engine::new(EngineConfig::for_testing()).unwrap();
        let service = ServiceConfig::new("", SecretString::from("t".to_string()));
        let ctx = engine.context(&service, CancellationToken::new()).unwrap();
        assert_eq!(ctx.graph.base_url(), "https://graph.microsoft.com/v1.0");
    }

    #[test]
    fn test_context_shares_cancellation() {
        let ctx = offline_context();
        ctx.cancel.cancel();
        assert!(ctx.graph.cancellation().is_cancelled());
    }
}
