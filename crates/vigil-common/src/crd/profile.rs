//! AgentProfile Custom Resource Definition
//!
//! A profile scopes a node agent override to the nodes matching its
//! affinity requirements. Profiles are ordered by creation time (name breaks
//! ties) and the first profile to claim a node keeps it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::agent::{ComponentName, ComponentOverride};
use super::types::Condition;
use crate::Error;

/// Name of the synthetic catch-all profile
pub const DEFAULT_PROFILE_NAME: &str = "default";

/// Maximum profile name length, bounded by the label value limit
pub const MAX_PROFILE_NAME_LEN: usize = 63;

/// Condition type set when a profile passes validation
pub const CONDITION_VALID: &str = "Valid";

/// Condition type set when a profile is applied to its nodes
pub const CONDITION_APPLIED: &str = "Applied";

/// Node selector operator
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProfileSelectorOperator {
    /// Label value is in the set
    In,
    /// Label value is not in the set (or label absent)
    NotIn,
    /// Label is present
    Exists,
    /// Label is absent
    DoesNotExist,
    /// Label value, parsed as an integer, is greater than the single value
    Gt,
    /// Label value, parsed as an integer, is less than the single value
    Lt,
}

impl ProfileSelectorOperator {
    /// Operator spelled as in Kubernetes node selector terms
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
            Self::Gt => "Gt",
            Self::Lt => "Lt",
        }
    }
}

/// One node label requirement
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileNodeRequirement {
    /// Label key
    pub key: String,
    /// Operator
    pub operator: ProfileSelectorOperator,
    /// Values, interpreted per operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl ProfileNodeRequirement {
    /// Evaluate the requirement against a node's labels
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            ProfileSelectorOperator::In => value.is_some_and(|v| self.values.contains(v)),
            ProfileSelectorOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            ProfileSelectorOperator::Exists => value.is_some(),
            ProfileSelectorOperator::DoesNotExist => value.is_none(),
            ProfileSelectorOperator::Gt | ProfileSelectorOperator::Lt => {
                let (Some(actual), Some(bound)) = (
                    value.and_then(|v| v.parse::<i64>().ok()),
                    self.values.first().and_then(|v| v.parse::<i64>().ok()),
                ) else {
                    return false;
                };
                if self.operator == ProfileSelectorOperator::Gt {
                    actual > bound
                } else {
                    actual < bound
                }
            }
        }
    }

    fn validate(&self, resource: &str, index: usize) -> Result<(), Error> {
        let field = format!("spec.profileAffinity.profileNodeAffinity[{}]", index);
        if self.key.is_empty() {
            return Err(Error::validation_for_field(resource, field, "key cannot be empty"));
        }
        match self.operator {
            ProfileSelectorOperator::In | ProfileSelectorOperator::NotIn => {
                if self.values.is_empty() {
                    return Err(Error::validation_for_field(
                        resource,
                        field,
                        format!("operator {} requires values", self.operator.as_str()),
                    ));
                }
            }
            ProfileSelectorOperator::Exists | ProfileSelectorOperator::DoesNotExist => {
                if !self.values.is_empty() {
                    return Err(Error::validation_for_field(
                        resource,
                        field,
                        format!("operator {} takes no values", self.operator.as_str()),
                    ));
                }
            }
            ProfileSelectorOperator::Gt | ProfileSelectorOperator::Lt => {
                if self.values.len() != 1 || self.values[0].parse::<i64>().is_err() {
                    return Err(Error::validation_for_field(
                        resource,
                        field,
                        format!(
                            "operator {} requires exactly one integer value",
                            self.operator.as_str()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Node affinity of a profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAffinity {
    /// Requirements, all of which must hold for a node to match
    #[serde(default)]
    pub profile_node_affinity: Vec<ProfileNodeRequirement>,
}

/// Override payload of a profile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    /// Component overrides, only `nodeAgent` is accepted
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub override_: BTreeMap<ComponentName, ComponentOverride>,
}

/// Specification for an AgentProfile
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "agent.vigil.dev",
    version = "v1alpha1",
    kind = "AgentProfile",
    plural = "agentprofiles",
    shortname = "aprofile",
    namespaced,
    status = "AgentProfileStatus",
    printcolumn = r#"{"name":"Valid","type":"string","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.applied"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfileSpec {
    /// Nodes this profile targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_affinity: Option<ProfileAffinity>,

    /// Override applied to the node agent on matching nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ProfileConfig>,
}

impl AgentProfileSpec {
    /// Node requirements, empty when no affinity is set
    pub fn requirements(&self) -> &[ProfileNodeRequirement] {
        self.profile_affinity
            .as_ref()
            .map(|a| a.profile_node_affinity.as_slice())
            .unwrap_or_default()
    }

    /// Node agent override carried by this profile
    pub fn node_agent_override(&self) -> Option<&ComponentOverride> {
        self.config
            .as_ref()
            .and_then(|c| c.override_.get(&ComponentName::NodeAgent))
    }

    /// True when the node's labels satisfy every requirement
    pub fn matches_node(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements().iter().all(|r| r.matches(labels))
    }

    /// Validate a user profile.
    ///
    /// `name` is the profile's metadata name and `resource` the
    /// `namespace/name` used in error messages.
    pub fn validate(&self, name: &str, resource: &str) -> Result<(), Error> {
        if name.len() > MAX_PROFILE_NAME_LEN {
            return Err(Error::validation_for_field(
                resource,
                "metadata.name",
                format!(
                    "profile name must be at most {} characters",
                    MAX_PROFILE_NAME_LEN
                ),
            ));
        }
        if name == DEFAULT_PROFILE_NAME {
            return Err(Error::validation_for_field(
                resource,
                "metadata.name",
                "profile name 'default' is reserved",
            ));
        }

        let requirements = self.requirements();
        if requirements.is_empty() {
            return Err(Error::validation_for_field(
                resource,
                "spec.profileAffinity.profileNodeAffinity",
                "at least one node requirement is needed",
            ));
        }
        for (i, r) in requirements.iter().enumerate() {
            r.validate(resource, i)?;
        }

        if let Some(config) = &self.config {
            if let Some(other) = config
                .override_
                .keys()
                .find(|c| **c != ComponentName::NodeAgent)
            {
                return Err(Error::validation_for_field(
                    resource,
                    format!("spec.config.override.{}", other),
                    "profiles can only override the node agent",
                ));
            }
        }
        Ok(())
    }
}

/// Status of an AgentProfile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfileStatus {
    /// `Valid` and `Applied` conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Summary of the `Valid` condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<String>,

    /// Summary of the `Applied` condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<String>,

    /// Hash of the spec the conditions were computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_hash: Option<String>,

    /// Last time the spec hash changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(key: &str, op: ProfileSelectorOperator, values: &[&str]) -> ProfileNodeRequirement {
        ProfileNodeRequirement {
            key: key.to_string(),
            operator: op,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn profile_with(requirements: Vec<ProfileNodeRequirement>) -> AgentProfileSpec {
        AgentProfileSpec {
            profile_affinity: Some(ProfileAffinity {
                profile_node_affinity: requirements,
            }),
            config: None,
        }
    }

    #[test]
    fn operators_match_node_labels() {
        let node = labels(&[("pool", "gpu"), ("cores", "16")]);

        assert!(req("pool", ProfileSelectorOperator::In, &["gpu", "tpu"]).matches(&node));
        assert!(!req("pool", ProfileSelectorOperator::NotIn, &["gpu"]).matches(&node));
        assert!(req("zone", ProfileSelectorOperator::NotIn, &["a"]).matches(&node));
        assert!(req("pool", ProfileSelectorOperator::Exists, &[]).matches(&node));
        assert!(req("zone", ProfileSelectorOperator::DoesNotExist, &[]).matches(&node));
        assert!(req("cores", ProfileSelectorOperator::Gt, &["8"]).matches(&node));
        assert!(!req("cores", ProfileSelectorOperator::Lt, &["8"]).matches(&node));
        assert!(!req("pool", ProfileSelectorOperator::Gt, &["8"]).matches(&node));
    }

    /// Story: A profile only matches nodes satisfying every requirement
    #[test]
    fn story_all_requirements_must_hold() {
        let profile = profile_with(vec![
            req("pool", ProfileSelectorOperator::In, &["gpu"]),
            req("spot", ProfileSelectorOperator::DoesNotExist, &[]),
        ]);
        assert!(profile.matches_node(&labels(&[("pool", "gpu")])));
        assert!(!profile.matches_node(&labels(&[("pool", "gpu"), ("spot", "true")])));
        assert!(!profile.matches_node(&labels(&[("pool", "cpu")])));
    }

    /// Story: Malformed profiles are rejected with the offending field
    #[test]
    fn story_profile_validation() {
        let ok = profile_with(vec![req("pool", ProfileSelectorOperator::In, &["gpu"])]);
        assert!(ok.validate("gpu", "ns/gpu").is_ok());

        let long_name = "p".repeat(64);
        assert!(ok.validate(&long_name, "ns/long").is_err());
        assert!(ok.validate("default", "ns/default").is_err());

        let no_values = profile_with(vec![req("pool", ProfileSelectorOperator::In, &[])]);
        assert!(no_values
            .validate("p", "ns/p")
            .unwrap_err()
            .to_string()
            .contains("requires values"));

        let exists_with_values =
            profile_with(vec![req("pool", ProfileSelectorOperator::Exists, &["x"])]);
        assert!(exists_with_values.validate("p", "ns/p").is_err());

        let gt_non_int = profile_with(vec![req("cores", ProfileSelectorOperator::Gt, &["many"])]);
        assert!(gt_non_int.validate("p", "ns/p").is_err());

        let empty = profile_with(vec![]);
        assert!(empty.validate("p", "ns/p").is_err());
    }

    #[test]
    fn profile_overrides_limited_to_node_agent() {
        let mut spec = profile_with(vec![req("pool", ProfileSelectorOperator::In, &["gpu"])]);
        let mut overrides = BTreeMap::new();
        overrides.insert(ComponentName::ClusterAgent, ComponentOverride::default());
        spec.config = Some(ProfileConfig {
            override_: overrides,
        });
        let err = spec.validate("gpu", "ns/gpu").unwrap_err();
        assert!(err.to_string().contains("only override the node agent"));
    }
}
