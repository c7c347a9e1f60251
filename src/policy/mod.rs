//! Policy manifest: typed configuration describing the rules under which two
//! peers may collaborate, with deterministic hashing and field-by-field
//! negotiation.
//!
//! Grounded on the teacher's `enterprise::auth::policy` ABAC engine (the
//! `Effect`/`Condition`/evaluation shape) for the validation vocabulary, and
//! on `enterprise::licensing::validation` for the pattern of hashing a
//! canonical serialization before comparing two parties' views of the same
//! configuration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A canonicalized inline-formatting mark the editor may apply to text.
///
/// This is the closed set of marks the AI sanitization policy can allow or
/// deny; it is *not* the full mark vocabulary the editor itself may support,
/// only the subset this kernel's policy layer understands well enough to
/// negotiate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CanonMark {
    /// Bold emphasis.
    Bold,
    /// Italic emphasis.
    Italic,
    /// Strikethrough.
    Strikethrough,
    /// Inline code span.
    Code,
    /// Underline.
    Underline,
    /// Hyperlink.
    Link,
    /// Highlight/background color.
    Highlight,
}

/// The AI sanitization policy: what an AI-originated update is allowed to
/// introduce into the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiSanitizationPolicy {
    /// Marks an AI-originated update may apply.
    pub allowed_marks: BTreeSet<CanonMark>,
    /// Block types an AI-originated update may introduce, e.g. `"paragraph"`,
    /// `"heading"`, `"code_block"`.
    pub allowed_block_types: BTreeSet<String>,
}

impl Default for AiSanitizationPolicy {
    fn default() -> Self {
        Self {
            allowed_marks: BTreeSet::new(),
            allowed_block_types: BTreeSet::new(),
        }
    }
}

/// How a scalar field resolves when two manifests disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationStrategy {
    /// Resolve to the smaller of the two values.
    Min,
    /// Resolve to the larger of the two values.
    Max,
    /// Resolve to the intersection (set-valued fields only).
    Intersection,
    /// The client's value always wins.
    ClientWins,
    /// The server's value always wins.
    ServerWins,
    /// Any disagreement is a hard failure.
    Reject,
}

/// A typed policy manifest: the full set of rules two peers negotiate over
/// before collaborating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyManifest {
    /// Identifies the policy family. Two manifests are only ever compatible
    /// if the portion of `policy_id` before the first `:` agrees — this is
    /// the "family" the specification's `areManifestsCompatible` gates on.
    pub policy_id: String,
    /// Rules governing AI-originated content.
    pub ai_sanitization_policy: AiSanitizationPolicy,
    /// Maximum permitted size, in bytes, of a single CRDT update.
    pub max_update_size: u64,
    /// Protocol feature flags both peers must agree to use.
    pub protocol_features: BTreeSet<String>,
    /// Presence time-to-live, in milliseconds, this peer expects.
    pub presence_ttl_ms: u64,
}

impl PolicyManifest {
    /// The negotiation strategy for each scalar/set field, by field name.
    /// `policy_id` is intentionally absent: it is a compatibility gate, not a
    /// negotiable field.
    fn strategy_for(field: &str) -> NegotiationStrategy {
        match field {
            "max_update_size" => NegotiationStrategy::Min,
            "protocol_features" => NegotiationStrategy::Intersection,
            "presence_ttl_ms" => NegotiationStrategy::Min,
            "ai_sanitization_policy.allowed_marks" => NegotiationStrategy::Intersection,
            "ai_sanitization_policy.allowed_block_types" => NegotiationStrategy::Intersection,
            _ => NegotiationStrategy::Reject,
        }
    }

    /// Canonical serialization: a JSON object with lexicographically sorted
    /// keys at every level and no insignificant whitespace. `BTreeMap`/
    /// `BTreeSet` already serialize in sorted key order via `serde_json`, so
    /// building the manifest on top of them is what makes the hash stable
    /// across platforms without a custom canonicalizer.
    pub fn canonical_json(&self) -> String {
        let mut obj = BTreeMap::new();
        obj.insert("policy_id", serde_json::Value::String(self.policy_id.clone()));
        obj.insert(
            "ai_sanitization_policy",
            serde_json::json!({
                "allowed_marks": self.ai_sanitization_policy.allowed_marks,
                "allowed_block_types": self.ai_sanitization_policy.allowed_block_types,
            }),
        );
        obj.insert(
            "max_update_size",
            serde_json::Value::Number(self.max_update_size.into()),
        );
        obj.insert(
            "protocol_features",
            serde_json::json!(self.protocol_features),
        );
        obj.insert(
            "presence_ttl_ms",
            serde_json::Value::Number(self.presence_ttl_ms.into()),
        );
        serde_json::to_string(&obj).expect("manifest canonicalization cannot fail")
    }

    /// Compute the deterministic sha-256 hex digest of this manifest's
    /// canonical form (property P4: identical content hashes identically on
    /// every platform).
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The `policy_id` family: the portion before the first `:`, or the
    /// whole string if there is no `:`.
    fn family(&self) -> &str {
        self.policy_id.split(':').next().unwrap_or(&self.policy_id)
    }
}

/// A single structural or semantic validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path to the offending field.
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

/// The result of validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Whether the manifest passed all checks.
    pub valid: bool,
    /// Accumulated issues; empty iff `valid`.
    pub errors: Vec<ValidationIssue>,
}

/// Structural and semantic validation of a manifest.
pub fn validate_manifest(manifest: &PolicyManifest) -> ValidationOutcome {
    let mut errors = Vec::new();

    if manifest.policy_id.trim().is_empty() {
        errors.push(ValidationIssue {
            field: "policy_id".to_string(),
            message: "policy_id must not be empty".to_string(),
        });
    }
    if manifest.max_update_size == 0 {
        errors.push(ValidationIssue {
            field: "max_update_size".to_string(),
            message: "max_update_size must be greater than zero".to_string(),
        });
    }
    if manifest.presence_ttl_ms == 0 {
        errors.push(ValidationIssue {
            field: "presence_ttl_ms".to_string(),
            message: "presence_ttl_ms must be greater than zero".to_string(),
        });
    }

    ValidationOutcome {
        valid: errors.is_empty(),
        errors,
    }
}

/// Errors raised by manifest validation/negotiation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// A manifest failed structural validation.
    #[error("policy manifest invalid: {0:?}")]
    Invalid(Vec<ValidationIssue>),

    /// No compatible manifest could be negotiated.
    #[error("no compatible policy manifest: {0}")]
    Incompatible(String),
}

/// Result alias for the policy module.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Whether two manifests are compatible enough to attempt negotiation at
/// all. This is a coarse gate: a `false` here refuses negotiation wholesale,
/// independent of whether individual fields could otherwise be resolved.
pub fn are_manifests_compatible(a: &PolicyManifest, b: &PolicyManifest) -> bool {
    a.family() == b.family()
}

/// One row of the negotiation log: the value each peer proposed for a field
/// and how it was resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationLogEntry {
    /// Dotted field path.
    pub field: String,
    /// The strategy applied to resolve this field.
    pub strategy: NegotiationStrategy,
    /// JSON-rendered value each input manifest proposed, in input order.
    pub proposed: Vec<serde_json::Value>,
    /// JSON-rendered resolved value.
    pub resolved: serde_json::Value,
}

/// The outcome of negotiating a set of manifests.
#[derive(Debug, Clone)]
pub struct NegotiationOutcome {
    /// Whether negotiation succeeded.
    pub success: bool,
    /// The resulting effective manifest, present iff `success`.
    pub manifest: Option<PolicyManifest>,
    /// Failure reasons, present iff `!success`.
    pub errors: Vec<String>,
    /// Per-field negotiation log, populated only when requested.
    pub log: Option<Vec<NegotiationLogEntry>>,
}

/// Negotiate an effective manifest across two or more manifests.
///
/// Scalars resolve per [`PolicyManifest::strategy_for`]; set-valued fields
/// resolve to the intersection. An empty intersection on a field that every
/// manifest declares non-empty is treated as `INCOMPATIBLE` (there is nothing
/// left every peer can agree to accept).
pub fn negotiate(manifests: &[PolicyManifest], include_log: bool) -> NegotiationOutcome {
    if manifests.len() < 2 {
        return NegotiationOutcome {
            success: false,
            manifest: None,
            errors: vec!["negotiation requires at least two manifests".to_string()],
            log: None,
        };
    }

    for pair in manifests.windows(2) {
        if !are_manifests_compatible(&pair[0], &pair[1]) {
            return NegotiationOutcome {
                success: false,
                manifest: None,
                errors: vec![format!(
                    "incompatible policy families: {} vs {}",
                    pair[0].family(),
                    pair[1].family()
                )],
                log: None,
            };
        }
    }

    let mut log = Vec::new();

    let max_update_size = manifests.iter().map(|m| m.max_update_size).min().unwrap();
    log_scalar(
        include_log,
        &mut log,
        "max_update_size",
        NegotiationStrategy::Min,
        manifests.iter().map(|m| serde_json::json!(m.max_update_size)),
        serde_json::json!(max_update_size),
    );

    let presence_ttl_ms = manifests.iter().map(|m| m.presence_ttl_ms).min().unwrap();
    log_scalar(
        include_log,
        &mut log,
        "presence_ttl_ms",
        NegotiationStrategy::Min,
        manifests.iter().map(|m| serde_json::json!(m.presence_ttl_ms)),
        serde_json::json!(presence_ttl_ms),
    );

    let protocol_features = intersect_all(manifests.iter().map(|m| &m.protocol_features));
    log_scalar(
        include_log,
        &mut log,
        "protocol_features",
        NegotiationStrategy::Intersection,
        manifests.iter().map(|m| serde_json::json!(m.protocol_features)),
        serde_json::json!(protocol_features),
    );

    let allowed_marks = intersect_all(
        manifests
            .iter()
            .map(|m| &m.ai_sanitization_policy.allowed_marks),
    );
    let any_nonempty_marks = manifests
        .iter()
        .any(|m| !m.ai_sanitization_policy.allowed_marks.is_empty());
    if any_nonempty_marks && allowed_marks.is_empty() {
        return NegotiationOutcome {
            success: false,
            manifest: None,
            errors: vec![
                "INCOMPATIBLE: empty intersection for ai_sanitization_policy.allowed_marks"
                    .to_string(),
            ],
            log: include_log.then_some(log),
        };
    }
    log_scalar(
        include_log,
        &mut log,
        "ai_sanitization_policy.allowed_marks",
        NegotiationStrategy::Intersection,
        manifests
            .iter()
            .map(|m| serde_json::json!(m.ai_sanitization_policy.allowed_marks)),
        serde_json::json!(allowed_marks),
    );

    let allowed_block_types = intersect_all(
        manifests
            .iter()
            .map(|m| &m.ai_sanitization_policy.allowed_block_types),
    );
    let any_nonempty_blocks = manifests
        .iter()
        .any(|m| !m.ai_sanitization_policy.allowed_block_types.is_empty());
    if any_nonempty_blocks && allowed_block_types.is_empty() {
        return NegotiationOutcome {
            success: false,
            manifest: None,
            errors: vec![
                "INCOMPATIBLE: empty intersection for ai_sanitization_policy.allowed_block_types"
                    .to_string(),
            ],
            log: include_log.then_some(log),
        };
    }
    log_scalar(
        include_log,
        &mut log,
        "ai_sanitization_policy.allowed_block_types",
        NegotiationStrategy::Intersection,
        manifests
            .iter()
            .map(|m| serde_json::json!(m.ai_sanitization_policy.allowed_block_types)),
        serde_json::json!(allowed_block_types),
    );

    let effective = PolicyManifest {
        policy_id: manifests[0].policy_id.clone(),
        ai_sanitization_policy: AiSanitizationPolicy {
            allowed_marks,
            allowed_block_types,
        },
        max_update_size,
        protocol_features,
        presence_ttl_ms,
    };

    NegotiationOutcome {
        success: true,
        manifest: Some(effective),
        errors: Vec::new(),
        log: include_log.then_some(log),
    }
}

fn log_scalar(
    include_log: bool,
    log: &mut Vec<NegotiationLogEntry>,
    field: &str,
    strategy: NegotiationStrategy,
    proposed: impl Iterator<Item = serde_json::Value>,
    resolved: serde_json::Value,
) {
    if !include_log {
        return;
    }
    debug_assert_eq!(strategy, PolicyManifest::strategy_for(field));
    log.push(NegotiationLogEntry {
        field: field.to_string(),
        strategy,
        proposed: proposed.collect(),
        resolved,
    });
}

fn intersect_all<'a, T: Ord + Clone + 'a>(
    mut sets: impl Iterator<Item = &'a BTreeSet<T>>,
) -> BTreeSet<T> {
    let first = match sets.next() {
        Some(s) => s.clone(),
        None => return BTreeSet::new(),
    };
    sets.fold(first, |acc, s| acc.intersection(s).cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(policy_id: &str, max_update_size: u64) -> PolicyManifest {
        PolicyManifest {
            policy_id: policy_id.to_string(),
            ai_sanitization_policy: AiSanitizationPolicy {
                allowed_marks: [CanonMark::Bold, CanonMark::Italic].into_iter().collect(),
                allowed_block_types: ["paragraph".to_string(), "heading".to_string()]
                    .into_iter()
                    .collect(),
            },
            max_update_size,
            protocol_features: ["presence".to_string(), "catch_up".to_string()]
                .into_iter()
                .collect(),
            presence_ttl_ms: 30_000,
        }
    }

    #[test]
    fn hash_is_deterministic_and_order_independent_of_construction() {
        let a = manifest("lfcc:v1", 1_000_000);
        let b = manifest("lfcc:v1", 1_000_000);
        assert_eq!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn hash_changes_with_content() {
        let a = manifest("lfcc:v1", 1_000_000);
        let b = manifest("lfcc:v1", 2_000_000);
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn compatible_requires_same_family() {
        let a = manifest("lfcc:v1", 1_000_000);
        let b = manifest("lfcc:v2", 1_000_000);
        assert!(are_manifests_compatible(&a, &b));

        let c = manifest("other:v1", 1_000_000);
        assert!(!are_manifests_compatible(&a, &c));
    }

    #[test]
    fn negotiate_takes_min_of_max_update_size() {
        let a = manifest("lfcc:v1", 1_000_000);
        let b = manifest("lfcc:v1", 500_000);
        let outcome = negotiate(&[a, b], false);
        assert!(outcome.success);
        assert_eq!(outcome.manifest.unwrap().max_update_size, 500_000);
    }

    #[test]
    fn negotiate_intersects_allowed_marks() {
        let mut a = manifest("lfcc:v1", 1_000_000);
        a.ai_sanitization_policy.allowed_marks = [CanonMark::Bold, CanonMark::Italic, CanonMark::Code]
            .into_iter()
            .collect();
        let mut b = manifest("lfcc:v1", 1_000_000);
        b.ai_sanitization_policy.allowed_marks = [CanonMark::Bold, CanonMark::Underline]
            .into_iter()
            .collect();

        let outcome = negotiate(&[a, b], false);
        let effective = outcome.manifest.unwrap();
        assert_eq!(
            effective.ai_sanitization_policy.allowed_marks,
            [CanonMark::Bold].into_iter().collect()
        );
    }

    #[test]
    fn negotiate_fails_on_empty_mark_intersection() {
        let mut a = manifest("lfcc:v1", 1_000_000);
        a.ai_sanitization_policy.allowed_marks = [CanonMark::Bold].into_iter().collect();
        let mut b = manifest("lfcc:v1", 1_000_000);
        b.ai_sanitization_policy.allowed_marks = [CanonMark::Underline].into_iter().collect();

        let outcome = negotiate(&[a, b], false);
        assert!(!outcome.success);
        assert!(outcome.errors[0].contains("INCOMPATIBLE"));
    }

    #[test]
    fn negotiate_fails_wholesale_on_incompatible_family() {
        let a = manifest("lfcc:v1", 1_000_000);
        let b = manifest("other:v1", 1_000_000);
        let outcome = negotiate(&[a, b], false);
        assert!(!outcome.success);
    }

    #[test]
    fn negotiation_log_records_strategy_and_values() {
        let a = manifest("lfcc:v1", 1_000_000);
        let b = manifest("lfcc:v1", 500_000);
        let outcome = negotiate(&[a, b], true);
        let log = outcome.log.unwrap();
        let entry = log
            .iter()
            .find(|e| e.field == "max_update_size")
            .expect("max_update_size entry present");
        assert_eq!(entry.strategy, NegotiationStrategy::Min);
        assert_eq!(entry.resolved, serde_json::json!(500_000));
    }

    #[test]
    fn validate_rejects_empty_policy_id() {
        let mut m = manifest("lfcc:v1", 1_000_000);
        m.policy_id = String::new();
        let outcome = validate_manifest(&m);
        assert!(!outcome.valid);
    }

    proptest::proptest! {
        #[test]
        fn compute_hash_is_a_pure_function_of_content(max_update_size in 1u64..10_000_000, presence_ttl_ms in 1u64..600_000) {
            let mut a = manifest("lfcc:v1", max_update_size);
            a.presence_ttl_ms = presence_ttl_ms;
            let mut b = manifest("lfcc:v1", max_update_size);
            b.presence_ttl_ms = presence_ttl_ms;
            proptest::prop_assert_eq!(a.compute_hash(), b.compute_hash());
        }

        #[test]
        fn compute_hash_changes_when_max_update_size_does(a_size in 1u64..5_000_000, b_size in 5_000_001u64..10_000_000) {
            let a = manifest("lfcc:v1", a_size);
            let b = manifest("lfcc:v1", b_size);
            proptest::prop_assert_ne!(a.compute_hash(), b.compute_hash());
        }
    }
}
