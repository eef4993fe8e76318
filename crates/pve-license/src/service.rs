use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use pve_core::{
    Entitlement, IssueOrigin, LicenseConflict, LicenseConflictKind, ProductConfiguration, ProductId, Severity,
    ValidationIssue,
};
use tracing::{debug, warn};

use crate::lookup::EntitlementLookup;

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Checks license-gated products against the proposal's declared
/// entitlements. Lookup failures degrade to `unknown` conflicts.
#[derive(Clone)]
pub struct LicenseValidationService {
    lookup: Arc<dyn EntitlementLookup>,
    timeout: Duration,
}

impl LicenseValidationService {
    pub fn new(lookup: Arc<dyn EntitlementLookup>, timeout: Duration) -> Self {
        Self { lookup, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// One conflict per gated product that lacks a current entitlement.
    /// `today` decides expiry.
    pub async fn validate_licenses(&self, config: &ProductConfiguration, today: NaiveDate) -> Vec<LicenseConflict> {
        let mut seen = BTreeSet::new();
        let gated: Vec<&ProductId> = config
            .products
            .iter()
            .filter(|p| p.license_gated && seen.insert(p.id.clone()))
            .map(|p| &p.id)
            .collect();
        if gated.is_empty() {
            return vec![];
        }

        let lookup = tokio::time::timeout(self.timeout, self.lookup.entitlements(&config.proposal_id)).await;
        let entitlements = match lookup {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                warn!(proposal_id = %config.proposal_id, error = %e, "entitlement lookup failed");
                return unknown(&gated, &format!("entitlement lookup failed: {e}"));
            }
            Err(_) => {
                warn!(
                    proposal_id = %config.proposal_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "entitlement lookup timed out"
                );
                return unknown(&gated, "entitlement lookup timed out");
            }
        };

        let conflicts: Vec<LicenseConflict> = gated
            .into_iter()
            .filter_map(|product| check_product(product, &entitlements, today))
            .collect();
        debug!(proposal_id = %config.proposal_id, conflicts = conflicts.len(), "licenses checked");
        conflicts
    }
}

fn check_product(product: &ProductId, entitlements: &[Entitlement], today: NaiveDate) -> Option<LicenseConflict> {
    let held: Vec<&Entitlement> = entitlements.iter().filter(|e| &e.product_id == product).collect();
    if held.is_empty() {
        return Some(LicenseConflict {
            product_id: product.clone(),
            kind: LicenseConflictKind::Missing,
            severity: Severity::Critical,
            message: format!("Product {product} requires a license entitlement"),
        });
    }
    if held.iter().any(|e| e.expires_on.map_or(true, |d| d >= today)) {
        return None;
    }
    let latest = held.iter().filter_map(|e| e.expires_on).max();
    Some(LicenseConflict {
        product_id: product.clone(),
        kind: LicenseConflictKind::Expired,
        severity: Severity::Critical,
        message: match latest {
            Some(d) => format!("License entitlement for product {product} expired on {d}"),
            None => format!("License entitlement for product {product} has expired"),
        },
    })
}

fn unknown(gated: &[&ProductId], reason: &str) -> Vec<LicenseConflict> {
    gated
        .iter()
        .map(|p| LicenseConflict {
            product_id: (*p).clone(),
            kind: LicenseConflictKind::Unknown,
            severity: Severity::High,
            message: format!("License status of product {p} is unknown: {reason}"),
        })
        .collect()
}

pub fn license_issues(conflicts: &[LicenseConflict], entity_id: &str, now_ms: i64) -> Vec<ValidationIssue> {
    conflicts
        .iter()
        .map(|c| {
            let fix = match c.kind {
                LicenseConflictKind::Missing => format!("Add a license entitlement for {}", c.product_id),
                LicenseConflictKind::Expired => format!("Renew the license for {}", c.product_id),
                LicenseConflictKind::Unknown => "Re-run validation once entitlements are reachable".to_string(),
            };
            ValidationIssue::open(
                entity_id,
                IssueOrigin::License,
                format!("license:{}", c.product_id),
                c.severity,
                c.message.clone(),
                now_ms,
            )
            .with_fix(Some(fix))
        })
        .collect()
}
