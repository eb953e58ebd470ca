//! Microsoft Graph transport for identity-governance reconciliation.
//!
//! A thin, authenticated JSON client over the Graph REST surface used by the
//! entitlement-management and privileged-access endpoints.
//!
//! # Features
//!
//! - Bearer-token authentication (the token is supplied by the caller, never minted here)
//! - `OData` error decoding with the raw body kept for diagnostics
//! - 429 `Retry-After` handling and transient 5xx retries with backoff and jitter
//! - Collection paging via `@odata.nextLink`
//! - Cooperative cancellation of in-flight requests
//!
//! # Example
//!
//! ```no_run
//! use egov_graph::{GraphClient, GraphClientConfig};
//! use secrecy::SecretString;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = GraphClient::new(
//!     "https://graph.microsoft.com/v1.0",
//!     SecretString::from("eyJ0eXAi...".to_string()),
//!     GraphClientConfig::default(),
//! )?;
//!
//! let groups: Vec<serde_json::Value> = client.list("groups?$select=id").await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
pub mod odata;
mod retry;

pub use client::GraphClient;
pub use config::{GraphClientConfig, DEFAULT_SERVICE_ENDPOINT};
pub use error::{GraphError, GraphResult};
pub use retry::RetryPolicy;
