//! Reconciliation engine for DesiredAgent resources
//!
//! This crate turns a `DesiredAgent` spec into live workloads:
//!
//! - **Features**: pluggable units deciding which components and containers are required
//! - **Pod templates**: the default → global → features → overrides → profile pipeline
//! - **Workloads**: content-hash diff/apply for DaemonSets, Deployments and ExtendedDaemonSets
//! - **Components**: the fixed registry of top-level components and their reconcile loop
//! - **Profiles**: node profile assignment and the canary gate for profile workloads
//! - **Store**: staged secondary objects applied and pruned once per reconcile
//! - **Controller**: the `reconcile`/`error_policy` pair driven by `kube::runtime`

pub mod canary;
pub mod client;
pub mod component;
pub mod context;
pub mod controller;
pub mod dependencies;
pub mod features;
pub mod global;
pub mod options;
pub mod pod_template;
pub mod profile;
pub mod provider;
pub mod required;
pub mod store;
pub mod workload;

#[cfg(test)]
pub(crate) mod test_support;

pub(crate) use vigil_common::{crd, Error};

/// Result type alias using the shared Error type
pub type Result<T> = std::result::Result<T, Error>;

pub use controller::{error_policy, reconcile, AgentContext};
pub use options::OperatorOptions;
