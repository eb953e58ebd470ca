//! Microsoft Graph HTTP client with bearer auth, retry handling and cancellation.

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::{GraphClientConfig, DEFAULT_SERVICE_ENDPOINT};
use crate::odata::{ODataError, ODataResponse};
use crate::{GraphError, GraphResult};

/// Microsoft Graph API client.
///
/// Cloning is cheap: the HTTP connection pool, the bearer token and the
/// configuration are shared. The client holds no per-call mutable state, so one
/// instance can serve concurrent reconciliations.
#[derive(Debug, Clone)]
pub struct GraphClient {
    http_client: reqwest::Client,
    base_url: String,
    token: Arc<SecretString>,
    config: Arc<GraphClientConfig>,
    cancel: CancellationToken,
}

impl GraphClient {
    /// Creates a new Graph client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the HTTP client cannot be created.
    pub fn new(
        service_endpoint: &str,
        token: SecretString,
        config: GraphClientConfig,
    ) -> GraphResult<Self> {
        let http_client = config.build_http_client()?;
        Self::with_http_client(http_client, service_endpoint, token, config)
    }

    /// Creates a Graph client on top of an existing connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid URL or the configuration is invalid.
    pub fn with_http_client(
        http_client: reqwest::Client,
        service_endpoint: &str,
        token: SecretString,
        config: GraphClientConfig,
    ) -> GraphResult<Self> {
        config.validate()?;

        let endpoint = service_endpoint.trim();
        let endpoint = if endpoint.is_empty() {
            DEFAULT_SERVICE_ENDPOINT
        } else {
            endpoint
        };
        let parsed = url::Url::parse(endpoint)?;
        if !matches!(parsed.scheme(), "https" | "http") {
            return Err(GraphError::Config(format!(
                "Unsupported endpoint scheme: {}",
                parsed.scheme()
            )));
        }
        if token.expose_secret().trim().is_empty() {
            return Err(GraphError::Config("Bearer token is empty".into()));
        }

        Ok(Self {
            http_client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            token: Arc::new(token),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        })
    }

    /// Returns a copy of this client whose calls abort when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The cancellation token observed by this client.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the base URL for Graph API requests.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the transport configuration.
    #[must_use]
    pub fn config(&self) -> &GraphClientConfig {
        &self.config
    }

    /// Resolves a relative path (or passes an absolute link through).
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// Performs a GET request.
    #[instrument(skip(self))]
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> GraphResult<T> {
        self.request(Method::GET, path, None::<&()>).await
    }

    /// Performs a GET request, mapping a not-found answer to `None`.
    #[instrument(skip(self))]
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> GraphResult<Option<T>> {
        match self.request(Method::GET, path, None::<&()>).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => {
                debug!("Object not found at {}", path);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Performs a POST request and decodes the response body.
    #[instrument(skip(self, body))]
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> GraphResult<T> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Performs a POST request whose response body is irrelevant (usually 204).
    #[instrument(skip(self, body))]
    pub async fn post_no_content<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> GraphResult<()> {
        let _: IgnoredAny = self.request(Method::POST, path, Some(body)).await?;
        Ok(())
    }

    /// Performs a PATCH request. Graph answers 204 No Content.
    #[instrument(skip(self, body))]
    pub async fn patch<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> GraphResult<()> {
        let _: IgnoredAny = self.request(Method::PATCH, path, Some(body)).await?;
        Ok(())
    }

    /// Performs a PUT request (whole-object replacement).
    #[instrument(skip(self, body))]
    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> GraphResult<()> {
        let _: IgnoredAny = self.request(Method::PUT, path, Some(body)).await?;
        Ok(())
    }

    /// Performs a DELETE request.
    ///
    /// Only used to detach references (group membership); the engine never deletes objects.
    #[instrument(skip(self))]
    pub async fn delete(&self, path: &str) -> GraphResult<()> {
        let _: IgnoredAny = self.request(Method::DELETE, path, None::<&()>).await?;
        Ok(())
    }

    /// Fetches every page of a collection, following `@odata.nextLink`.
    #[instrument(skip(self))]
    pub async fn list<T: DeserializeOwned>(&self, path: &str) -> GraphResult<Vec<T>> {
        let mut url = path.to_string();
        let mut items = Vec::new();

        loop {
            debug!("Fetching page: {}", url);
            let page: ODataResponse<T> = self.get(&url).await?;
            items.extend(page.value);

            match page.next_link {
                Some(next) => url = next,
                None => return Ok(items),
            }
        }
    }

    /// Sends a request, racing it against the cancellation token, and decodes the body.
    async fn request<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> GraphResult<T> {
        let url = self.url(path);

        let text = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(GraphError::Cancelled),
            result = self.execute_with_retry(method, &url, body) => result?,
        };

        decode_body(&text)
    }

    /// Performs the request with throttling and transient-error retries.
    async fn execute_with_retry<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> GraphResult<String> {
        let policy = &self.config.retry;
        let mut rate_limit_attempts = 0u32;
        let mut transient_attempts = 0u32;

        loop {
            let mut request = self
                .http_client
                .request(method.clone(), url)
                .bearer_auth(self.token.expose_secret());

            if let Some(b) = body {
                request = request.json(b);
            }

            let response = request.send().await?;
            let status = response.status();

            // Handle throttling (429)
            if status == StatusCode::TOO_MANY_REQUESTS {
                if rate_limit_attempts >= policy.max_retries {
                    return Err(GraphError::MaxRetriesExceeded {
                        attempts: rate_limit_attempts,
                    });
                }
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let delay = policy.delay_for(retry_after.as_deref(), rate_limit_attempts);
                warn!(
                    "Throttled on {} {}, waiting {:?} (attempt {})",
                    method, url, delay, rate_limit_attempts
                );
                tokio::time::sleep(delay).await;
                rate_limit_attempts += 1;
                continue;
            }

            // Handle transient errors (502, 503, 504)
            if matches!(
                status,
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
            ) && transient_attempts < policy.max_retries
            {
                let delay = policy.add_jitter(policy.backoff_delay(transient_attempts));
                transient_attempts += 1;
                warn!(
                    "Transient error {}, retry {}/{} after {:?}",
                    status, transient_attempts, policy.max_retries, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let text = response.text().await?;
            if status.is_success() {
                return Ok(text);
            }
            return Err(api_error(status, text));
        }
    }
}

fn decode_body<T: DeserializeOwned>(text: &str) -> GraphResult<T> {
    let trimmed = text.trim();
    let payload = if trimmed.is_empty() { "null" } else { trimmed };
    Ok(serde_json::from_str(payload)?)
}

fn api_error(status: StatusCode, body: String) -> GraphError {
    match serde_json::from_str::<ODataError>(&body) {
        Ok(odata_error) => GraphError::Api {
            status: status.as_u16(),
            code: odata_error.error.code,
            message: odata_error.error.message,
            inner_error: odata_error.error.inner_error.map(|v| v.to_string()),
            body,
        },
        Err(_) => GraphError::Api {
            status: status.as_u16(),
            code: status.to_string(),
            message: body.clone(),
            inner_error: None,
            body,
        },
    }
}
