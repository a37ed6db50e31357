//! Shared Kubernetes metadata helpers
//!
//! Content hashing, label/annotation merging, owner reference handling and
//! managed-fields inspection used by the workload engine and the canary gate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use regex::RegexSet;
use tracing::error;

use crate::{Error, LABEL_PROFILE_LEGACY, VENDOR_DOMAIN};

// =============================================================================
// Content hashing
// =============================================================================

/// Compute a deterministic hash of an input string.
///
/// Truncated SHA-256, 16 hex characters. Stable across processes so it can
/// be stored in annotations and compared on later reconciles.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash the JSON serialization of a value.
///
/// Map-typed fields are `BTreeMap`s and struct fields serialize in
/// declaration order, so equal values always hash equal.
pub fn spec_hash<T: serde::Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_string(value)
        .map_err(|e| Error::serialization(format!("failed to hash spec: {}", e)))?;
    Ok(deterministic_hash(&json))
}

// =============================================================================
// Label and annotation merging
// =============================================================================

/// Compiled keep-filter for previous labels or annotations.
///
/// The filter is a comma-separated list of globs (e.g.
/// `team.example.com/*,deploy.*`) where `*` matches any run of characters
/// and `?` a single one. Everything else is literal. An empty filter keeps
/// nothing; one that fails to compile is logged and treated as empty.
#[derive(Clone, Debug, Default)]
pub struct KeepFilter {
    set: Option<RegexSet>,
}

/// Anchored regex for a glob
fn glob_to_regex(pattern: &str) -> String {
    let escaped = regex::escape(pattern);
    format!("^{}$", escaped.replace(r"\*", ".*").replace(r"\?", "."))
}

impl KeepFilter {
    /// Compile a filter expression
    pub fn new(expr: &str) -> Self {
        let patterns: Vec<String> = expr
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(glob_to_regex)
            .collect();
        if patterns.is_empty() {
            return Self::default();
        }

        match RegexSet::new(&patterns) {
            Ok(set) => Self { set: Some(set) },
            Err(e) => {
                error!(filter = %expr, error = %e, "invalid keep filter, ignoring it");
                Self::default()
            }
        }
    }

    /// True when the key matches any glob
    pub fn matches(&self, key: &str) -> bool {
        self.set.as_ref().is_some_and(|s| s.is_match(key))
    }
}

/// Merge previous and desired labels or annotations.
///
/// Desired values always win. A previous key is carried over only if it
/// matches the keep filter or belongs to the vendor domain.
pub fn merge_annotations_labels(
    previous: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    filter: &KeepFilter,
) -> BTreeMap<String, String> {
    let mut merged = desired.clone();
    for (key, value) in previous {
        if merged.contains_key(key) {
            continue;
        }
        if filter.matches(key) || key.contains(VENDOR_DOMAIN) {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Remove the pre-1.0 profile label, returning whether it was present
pub fn strip_legacy_profile_label(labels: &mut BTreeMap<String, String>) -> bool {
    labels.remove(LABEL_PROFILE_LEGACY).is_some()
}

// =============================================================================
// Replicas
// =============================================================================

/// Pick the replica count to send on update.
///
/// A desired count always wins. When the desired object leaves replicas
/// unset, the live count is kept so an autoscaler is never overridden.
pub fn preserve_replicas(desired: Option<i32>, live: Option<i32>) -> Option<i32> {
    desired.or(live)
}

// =============================================================================
// Owner references
// =============================================================================

/// True when any owner reference names the given kind
pub fn has_owner_kind(meta: &ObjectMeta, kind: &str) -> bool {
    meta.owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == kind))
}

/// Replace every owner reference of `legacy_kind` with `owner`.
///
/// Returns `None` when no reference needs migrating. The new owner is not
/// duplicated when it is already present.
pub fn migrate_owner_references(
    meta: &ObjectMeta,
    legacy_kind: &str,
    owner: &OwnerReference,
) -> Option<Vec<OwnerReference>> {
    let refs = meta.owner_references.as_ref()?;
    if !refs.iter().any(|r| r.kind == legacy_kind) {
        return None;
    }

    let mut migrated: Vec<OwnerReference> = refs
        .iter()
        .filter(|r| r.kind != legacy_kind)
        .cloned()
        .collect();
    if !migrated.iter().any(|r| r.uid == owner.uid) {
        migrated.push(owner.clone());
    }
    Some(migrated)
}

/// Merge patch body replacing `metadata.ownerReferences`
pub fn owner_references_patch(refs: &[OwnerReference]) -> serde_json::Value {
    serde_json::json!({ "metadata": { "ownerReferences": refs } })
}

// =============================================================================
// Managed fields
// =============================================================================

/// Last time a manager touched the object outside of the status subresource.
///
/// Falls back to the creation timestamp when no managed field entry carries a
/// time.
pub fn last_spec_update_time(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let latest = meta
        .managed_fields
        .iter()
        .flatten()
        .filter(|mf| mf.subresource.as_deref() != Some("status"))
        .filter_map(|mf| mf.time.as_ref().map(|t| t.0))
        .max();
    latest.or_else(|| meta.creation_timestamp.as_ref().map(|t| t.0))
}

/// Labels of an object, empty when unset
pub fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

/// Annotations of an object, empty when unset
pub fn annotations_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.annotations.clone().unwrap_or_default()
}
