use std::collections::HashMap;

use async_trait::async_trait;
use pve_core::{Entitlement, ProposalId};

/// Source of the entitlements a proposal declares. Implementations may call
/// out to another system; the caller bounds every call with its own timeout.
#[async_trait]
pub trait EntitlementLookup: Send + Sync {
    async fn entitlements(&self, proposal_id: &ProposalId) -> anyhow::Result<Vec<Entitlement>>;
}

/// Entitlements held in memory, keyed by proposal, with an optional list
/// served to proposals that have no entry of their own.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEntitlements {
    by_proposal: HashMap<ProposalId, Vec<Entitlement>>,
    fallback: Vec<Entitlement>,
}

impl InMemoryEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same entitlements for every proposal.
    pub fn shared(entitlements: Vec<Entitlement>) -> Self {
        Self {
            by_proposal: HashMap::new(),
            fallback: entitlements,
        }
    }

    pub fn insert(&mut self, proposal_id: ProposalId, entitlements: Vec<Entitlement>) {
        self.by_proposal.insert(proposal_id, entitlements);
    }
}

#[async_trait]
impl EntitlementLookup for InMemoryEntitlements {
    async fn entitlements(&self, proposal_id: &ProposalId) -> anyhow::Result<Vec<Entitlement>> {
        Ok(self
            .by_proposal
            .get(proposal_id)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
