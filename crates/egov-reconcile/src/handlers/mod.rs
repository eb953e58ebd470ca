//! Per-resource reconciliation strategies.

mod access_package;
mod assignment_policy;
mod assignment_request;
mod catalog;
mod catalog_resource;
mod pim_link;
mod role_scope;
mod security_group;

pub use access_package::{AccessPackageHandler, AccessPackageProperties};
pub use assignment_policy::{AssignmentPolicyHandler, AssignmentPolicyProperties};
pub use assignment_request::{AssignmentRequestHandler, AssignmentRequestProperties};
pub use catalog::{CatalogHandler, CatalogProperties, CatalogState, CatalogType};
pub use catalog_resource::{CatalogResourceHandler, CatalogResourceProperties};
pub use pim_link::{GroupPimEligibilityHandler, GroupPimEligibilityProperties};
pub use role_scope::{ResourceRoleScopeHandler, ResourceRoleScopeProperties};
pub use security_group::{SecurityGroupHandler, SecurityGroupProperties};

use serde::Deserialize;

use crate::poll::{PollStep, RequestState};

/// Status projection shared by entitlement-management requests and PIM
/// schedule requests.
///
/// Entitlement-management requests report their lifecycle in `state` and a
/// human-readable detail in `status`; PIM requests only carry `status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RequestStatus {
    pub id: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl RequestStatus {
    pub fn lifecycle(&self) -> &str {
        self.state
            .as_deref()
            .or(self.status.as_deref())
            .unwrap_or("unknown")
    }

    /// Maps the reported lifecycle onto a poll step.
    pub fn step(&self) -> PollStep<()> {
        let lifecycle = self.lifecycle().to_string();
        match RequestState::classify(&lifecycle) {
            RequestState::Succeeded => PollStep::Done(()),
            RequestState::Failed => PollStep::Failed {
                diagnostic: self.state.as_ref().and(self.status.clone()),
                state: lifecycle,
            },
            RequestState::Pending => PollStep::Pending(lifecycle),
        }
    }
}
