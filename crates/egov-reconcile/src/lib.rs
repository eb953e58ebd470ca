//! Idempotent reconciliation of identity-governance objects.
//!
//! Each resource type (catalog, access package, assignment policy, catalog
//! resource, resource role scope, assignment request, security group and PIM
//! eligibility link) is converged to its declared state by looking it up via
//! its natural key, creating it when absent and patching drifted fields when
//! present. Nothing is cached between invocations: identity is always
//! re-derived from the remote service.
//!
//! # Example
//!
//! ```no_run
//! use egov_reconcile::{Engine, EngineConfig, HandlerRegistry, Operation};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(envelope: serde_json::Value) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::new(EngineConfig::from_env()?)?;
//! let registry = HandlerRegistry::with_defaults();
//!
//! let response = registry
//!     .dispatch(&engine, "Catalog", Operation::CreateOrUpdate, envelope, CancellationToken::new())
//!     .await?;
//! println!("{response}");
//! # Ok(())
//! # }
//! ```

mod config;
mod context;
pub mod contract;
pub mod driver;
mod error;
pub mod handlers;
pub mod poll;
mod registry;
pub mod resolve;

pub use config::{ConfigError, EngineConfig};
pub use context::{Engine, ReconcileContext};
pub use contract::{Operation, Request, ResourceHandler, Response, ServiceConfig};
pub use error::{ReconcileError, ReconcileResult};
pub use registry::HandlerRegistry;
