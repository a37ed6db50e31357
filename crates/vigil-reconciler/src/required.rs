//! Required components computed from the enabled features
//!
//! Every feature returns a [`RequiredComponents`] value from `configure`.
//! Values merge with tri-state OR semantics and a container set union. An
//! explicit override disabling a component puts a floor under the merge that
//! no feature can lift.

use std::collections::BTreeSet;
use std::fmt;

use crate::crd::ComponentName;

/// Container that may run in a component's pods
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentContainer {
    /// Core node agent
    Core,
    /// APM trace agent
    Trace,
    /// Process collection agent
    Process,
    /// OTel agent embedded in the node agent pod
    Otel,
    /// All node agent processes in one container
    Unified,
    /// Cluster agent
    ClusterAgent,
    /// Cluster checks runner
    ClusterChecksRunner,
    /// OTel agent gateway
    OtelAgentGateway,
    /// Standalone OTel collector
    OtelCollector,
}

impl AgentContainer {
    /// Container name in the pod spec
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "agent",
            Self::Trace => "trace-agent",
            Self::Process => "process-agent",
            Self::Otel => "otel-agent",
            Self::Unified => "unified",
            Self::ClusterAgent => "cluster-agent",
            Self::ClusterChecksRunner => "cluster-checks-runner",
            Self::OtelAgentGateway => "otel-agent-gateway",
            Self::OtelCollector => "otel-collector",
        }
    }

    /// Main container of a component
    pub fn main_for(component: ComponentName) -> Self {
        match component {
            ComponentName::NodeAgent => Self::Core,
            ComponentName::ClusterAgent => Self::ClusterAgent,
            ComponentName::ClusterChecksRunner => Self::ClusterChecksRunner,
            ComponentName::OtelAgentGateway => Self::OtelAgentGateway,
            ComponentName::OtelCollectorGateway => Self::OtelCollector,
        }
    }
}

impl fmt::Display for AgentContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requirement for one top-level component
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequiredComponent {
    /// What features asked for, before any override floor
    pub requested: Option<bool>,
    forced_off: bool,
    /// Containers that must be present
    pub containers: BTreeSet<AgentContainer>,
}

impl RequiredComponent {
    /// Component requested with the given containers
    pub fn required(containers: impl IntoIterator<Item = AgentContainer>) -> Self {
        Self {
            requested: Some(true),
            forced_off: false,
            containers: containers.into_iter().collect(),
        }
    }

    /// Component explicitly not requested
    pub fn not_required() -> Self {
        Self {
            requested: Some(false),
            ..Default::default()
        }
    }

    /// Tri-state requirement after the override floor
    pub fn is_required(&self) -> Option<bool> {
        if self.forced_off {
            Some(false)
        } else {
            self.requested
        }
    }

    /// True when the component should run
    pub fn is_enabled(&self) -> bool {
        self.is_required() == Some(true)
    }

    /// True when some feature asked for the component, floor or not
    pub fn is_requested(&self) -> bool {
        self.requested == Some(true)
    }

    /// True when an override floored the component
    pub fn is_forced_off(&self) -> bool {
        self.forced_off
    }

    /// Floor the component to disabled
    pub fn force_off(&mut self) {
        self.forced_off = true;
    }

    /// True when nothing was said about the component
    pub fn is_empty(&self) -> bool {
        self.requested.is_none() && !self.forced_off && self.containers.is_empty()
    }

    /// Merge another requirement in: tri-state OR and container union
    pub fn merge(&mut self, other: &RequiredComponent) {
        self.requested = match (self.requested, other.requested) {
            (None, x) | (x, None) => x,
            (Some(a), Some(b)) => Some(a || b),
        };
        self.forced_off |= other.forced_off;
        self.containers.extend(other.containers.iter().copied());
    }
}

/// Requirements for every top-level component
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequiredComponents {
    /// Node agent daemon
    pub node_agent: RequiredComponent,
    /// Cluster agent deployment
    pub cluster_agent: RequiredComponent,
    /// Cluster checks runner deployment
    pub cluster_checks_runner: RequiredComponent,
    /// OTel agent gateway deployment
    pub otel_agent_gateway: RequiredComponent,
    /// OTel collector gateway deployment
    pub otel_collector_gateway: RequiredComponent,
    /// Node agent runs one unified container
    pub single_container: bool,
}

impl RequiredComponents {
    /// Requirement of one component
    pub fn get(&self, component: ComponentName) -> &RequiredComponent {
        match component {
            ComponentName::NodeAgent => &self.node_agent,
            ComponentName::ClusterAgent => &self.cluster_agent,
            ComponentName::ClusterChecksRunner => &self.cluster_checks_runner,
            ComponentName::OtelAgentGateway => &self.otel_agent_gateway,
            ComponentName::OtelCollectorGateway => &self.otel_collector_gateway,
        }
    }

    /// Mutable requirement of one component
    pub fn get_mut(&mut self, component: ComponentName) -> &mut RequiredComponent {
        match component {
            ComponentName::NodeAgent => &mut self.node_agent,
            ComponentName::ClusterAgent => &mut self.cluster_agent,
            ComponentName::ClusterChecksRunner => &mut self.cluster_checks_runner,
            ComponentName::OtelAgentGateway => &mut self.otel_agent_gateway,
            ComponentName::OtelCollectorGateway => &mut self.otel_collector_gateway,
        }
    }

    /// Merge another value component by component
    pub fn merge(&mut self, other: &RequiredComponents) {
        for component in ComponentName::ALL {
            self.get_mut(component).merge(other.get(component));
        }
        self.single_container |= other.single_container;
    }

    /// True when no component was touched
    pub fn is_empty(&self) -> bool {
        ComponentName::ALL.iter().all(|c| self.get(*c).is_empty())
    }

    /// Whether a component should run.
    ///
    /// The cluster checks runner also needs the cluster agent.
    pub fn is_enabled(&self, component: ComponentName) -> bool {
        let own = self.get(component).is_enabled();
        match component {
            ComponentName::ClusterChecksRunner => own && self.cluster_agent.is_enabled(),
            _ => own,
        }
    }
}
