use std::collections::BTreeSet;

use pve_core::{
    CircularDependency, CompatibilityMatrix, CompatibilityResult, CompatibilityStatus, ConfigurationValidationResult,
    Deadline, IssueOrigin, LicenseConflict, MissingRequirement, ProductCompatibility, ProductConfiguration, ProductId,
    ProductRelationship, RelationshipType, Severity, ValidationIssue,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::graph::{is_malformed, to_circular, RelationshipGraph};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CompatibilityOptions {
    /// Follow `recommends` edges during cycle detection as well.
    #[serde(default)]
    pub include_recommends_in_cycles: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ProductCompatibilityService {
    options: CompatibilityOptions,
}

fn status_for(kind: Option<RelationshipType>) -> CompatibilityStatus {
    match kind {
        Some(RelationshipType::Incompatible) => CompatibilityStatus::Incompatible,
        Some(RelationshipType::Requires | RelationshipType::Recommends) => CompatibilityStatus::Conditional,
        _ => CompatibilityStatus::Compatible,
    }
}

/// Selected ids in configuration order, duplicates dropped.
fn selected_ids(config: &ProductConfiguration) -> Vec<ProductId> {
    let mut seen = BTreeSet::new();
    config
        .products
        .iter()
        .filter(|p| seen.insert(p.id.clone()))
        .map(|p| p.id.clone())
        .collect()
}

impl ProductCompatibilityService {
    pub fn new(options: CompatibilityOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompatibilityOptions {
        &self.options
    }

    /// Pairwise statuses for every unordered pair of selected products.
    pub fn check_product_compatibility(
        &self,
        products: &[ProductId],
        relationships: &[ProductRelationship],
    ) -> CompatibilityResult {
        let graph = RelationshipGraph::build(products, relationships);
        let (pairs, complete) = pairwise(&graph, products, Deadline::none());
        CompatibilityResult {
            status: rollup(&pairs, &[], &[]),
            pairs,
            complete,
            ..Default::default()
        }
    }

    pub fn detect_circular_dependencies(
        &self,
        products: &[ProductId],
        relationships: &[ProductRelationship],
    ) -> Vec<CircularDependency> {
        let graph = RelationshipGraph::build(products, relationships);
        self.cycles(&graph, Deadline::none()).0
    }

    /// N x N table with the same tie-break as the pairwise check; the
    /// diagonal is `compatible`.
    pub fn generate_compatibility_matrix(
        &self,
        products: &[ProductId],
        relationships: &[ProductRelationship],
    ) -> CompatibilityMatrix {
        let graph = RelationshipGraph::build(products, relationships);
        matrix(&graph, products)
    }

    /// Every graph check for one configuration: pairs, cycles, missing
    /// requirements, malformed entries and recommendations. Stops early and
    /// marks the result incomplete once `deadline` expires.
    pub fn evaluate(&self, config: &ProductConfiguration, deadline: Deadline) -> CompatibilityResult {
        let products = selected_ids(config);
        let graph = RelationshipGraph::build(&products, &config.relationships);

        let (pairs, pairs_done) = pairwise(&graph, &products, deadline);
        let (circular_dependencies, cycles_done) = if pairs_done {
            self.cycles(&graph, deadline)
        } else {
            (vec![], false)
        };

        let mut missing_requirements = vec![];
        let mut recommendations = vec![];
        let mut malformed = vec![];
        let mut seen_alternatives = BTreeSet::new();
        for rel in &config.relationships {
            if is_malformed(rel) {
                warn!(
                    source = %rel.source_product_id,
                    target = %rel.target_product_id,
                    kind = %rel.relationship_type,
                    "malformed product relationship"
                );
                let repeated = malformed.iter().any(|m: &ProductCompatibility| {
                    m.product_a == rel.source_product_id
                        && m.product_b == rel.target_product_id
                        && m.relationship == Some(rel.relationship_type)
                });
                if repeated {
                    continue;
                }
                malformed.push(ProductCompatibility {
                    product_a: rel.source_product_id.clone(),
                    product_b: rel.target_product_id.clone(),
                    status: CompatibilityStatus::Conditional,
                    relationship: Some(rel.relationship_type),
                    severity: Some(Severity::Error),
                    reason: Some(malformed_reason(rel)),
                });
                continue;
            }
            let (src, dst) = (&rel.source_product_id, &rel.target_product_id);
            let src_selected = config.is_selected(src);
            let dst_selected = config.is_selected(dst);
            match rel.relationship_type {
                RelationshipType::Requires if src_selected && !dst_selected => {
                    let missing = MissingRequirement {
                        product_id: src.clone(),
                        requires: dst.clone(),
                    };
                    if !missing_requirements.contains(&missing) {
                        recommendations.push(format!("Add product {dst}: required by {src}"));
                        missing_requirements.push(missing);
                    }
                }
                RelationshipType::Recommends if src_selected && !dst_selected => {
                    recommendations.push(format!("Consider adding product {dst}: recommended with {src}"));
                }
                RelationshipType::Alternative if src_selected && dst_selected && src != dst => {
                    let key = if src <= dst { (src, dst) } else { (dst, src) };
                    if seen_alternatives.insert(key) {
                        recommendations.push(format!(
                            "Products {} and {} are alternatives; keep only one",
                            key.0, key.1
                        ));
                    }
                }
                _ => {}
            }
        }

        let status = rollup(&pairs, &circular_dependencies, &missing_requirements);
        let complete = pairs_done && cycles_done;
        debug!(
            proposal_id = %config.proposal_id,
            pairs = pairs.len(),
            cycles = circular_dependencies.len(),
            missing = missing_requirements.len(),
            complete,
            "compatibility evaluated"
        );
        CompatibilityResult {
            status,
            pairs,
            circular_dependencies,
            license_conflicts: vec![],
            missing_requirements,
            malformed,
            recommendations,
            complete,
        }
    }

    /// `evaluate` plus the matrix, with license conflicts from the license
    /// check folded in.
    pub fn validate_product_configuration(
        &self,
        config: &ProductConfiguration,
        license_conflicts: Vec<LicenseConflict>,
        deadline: Deadline,
    ) -> ConfigurationValidationResult {
        let compatibility = self.evaluate(config, deadline);
        let products = selected_ids(config);
        let graph = RelationshipGraph::build(&products, &config.relationships);
        ConfigurationValidationResult::compose(compatibility, matrix(&graph, &products), license_conflicts)
    }

    fn cycles(&self, graph: &RelationshipGraph, deadline: Deadline) -> (Vec<CircularDependency>, bool) {
        let with_recommends = self.options.include_recommends_in_cycles;
        let follow = |t: RelationshipType| {
            t == RelationshipType::Requires || (with_recommends && t == RelationshipType::Recommends)
        };
        let (cycles, complete) = graph.find_cycles(follow, deadline);
        (to_circular(graph, cycles), complete)
    }
}

fn pairwise(graph: &RelationshipGraph, products: &[ProductId], deadline: Deadline) -> (Vec<ProductCompatibility>, bool) {
    let mut pairs = vec![];
    for (i, a) in products.iter().enumerate() {
        if deadline.expired() {
            return (pairs, false);
        }
        for b in &products[i + 1..] {
            let kind = graph.pair(a, b);
            pairs.push(ProductCompatibility {
                product_a: a.clone(),
                product_b: b.clone(),
                status: status_for(kind),
                relationship: kind,
                severity: None,
                reason: kind.map(|k| format!("{a} {k} {b}")),
            });
        }
    }
    (pairs, true)
}

fn matrix(graph: &RelationshipGraph, products: &[ProductId]) -> CompatibilityMatrix {
    let cells = products
        .iter()
        .map(|a| {
            products
                .iter()
                .map(|b| {
                    if a == b {
                        CompatibilityStatus::Compatible
                    } else {
                        status_for(graph.pair(a, b))
                    }
                })
                .collect()
        })
        .collect();
    CompatibilityMatrix {
        products: products.to_vec(),
        cells,
    }
}

fn rollup(
    pairs: &[ProductCompatibility],
    cycles: &[CircularDependency],
    missing: &[MissingRequirement],
) -> CompatibilityStatus {
    if pairs.iter().any(|p| p.status == CompatibilityStatus::Incompatible)
        || cycles.iter().any(|c| c.severity.blocks())
    {
        CompatibilityStatus::Incompatible
    } else if !cycles.is_empty()
        || !missing.is_empty()
        || pairs.iter().any(|p| p.status == CompatibilityStatus::Conditional)
    {
        CompatibilityStatus::Conditional
    } else {
        CompatibilityStatus::Compatible
    }
}

fn malformed_reason(rel: &ProductRelationship) -> String {
    if rel.source_product_id.as_str().trim().is_empty() || rel.target_product_id.as_str().trim().is_empty() {
        "relationship has a blank product id".to_string()
    } else {
        format!("{} relationship from a product to itself", rel.relationship_type)
    }
}

fn ordered<'a>(a: &'a ProductId, b: &'a ProductId) -> (&'a ProductId, &'a ProductId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Issues raised by the graph checks. Conditional pairs and alternatives
/// only produce recommendations.
pub fn compatibility_issues(result: &CompatibilityResult, entity_id: &str, now_ms: i64) -> Vec<ValidationIssue> {
    let mut issues = vec![];
    for pair in result.pairs.iter().filter(|p| p.status == CompatibilityStatus::Incompatible) {
        let (a, b) = ordered(&pair.product_a, &pair.product_b);
        issues.push(
            ValidationIssue::open(
                entity_id,
                IssueOrigin::Compatibility,
                format!("incompatible:{a}:{b}"),
                Severity::Error,
                format!("Products {a} and {b} are incompatible"),
                now_ms,
            )
            .with_fix(Some(format!("Remove {a} or {b} from the proposal"))),
        );
    }
    for m in &result.missing_requirements {
        issues.push(
            ValidationIssue::open(
                entity_id,
                IssueOrigin::Compatibility,
                format!("requires:{}:{}", m.product_id, m.requires),
                Severity::High,
                format!("Product {} requires {}, which is not selected", m.product_id, m.requires),
                now_ms,
            )
            .with_fix(Some(format!("Add product {}", m.requires))),
        );
    }
    for bad in &result.malformed {
        issues.push(ValidationIssue::open(
            entity_id,
            IssueOrigin::Compatibility,
            format!(
                "malformed:{}:{}:{}",
                bad.product_a,
                bad.product_b,
                bad.relationship.map_or("unknown", |k| k.as_str())
            ),
            bad.severity.unwrap_or(Severity::Error),
            bad.reason.clone().unwrap_or_else(|| "malformed relationship".to_string()),
            now_ms,
        ));
    }
    for cycle in &result.circular_dependencies {
        let path: Vec<&str> = cycle.path.iter().map(|p| p.as_str()).collect();
        issues.push(ValidationIssue::open(
            entity_id,
            IssueOrigin::CircularDependency,
            cycle.fingerprint(),
            cycle.severity,
            format!("Circular dependency: {}", path.join(" -> ")),
            now_ms,
        ));
    }
    issues
}
