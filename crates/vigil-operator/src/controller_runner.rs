//! Controller runner - builds the DesiredAgent controller futures

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use vigil_common::crd::{AgentProfile, DesiredAgent, ExtendedDaemonSet};
use vigil_reconciler::{error_policy, reconcile, AgentContext, OperatorOptions};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the DesiredAgent controller
///
/// Owned DaemonSets and Deployments trigger their agent; any AgentProfile
/// change re-triggers every known agent since profiles are cluster-wide.
pub fn build_agent_controllers(
    client: Client,
    options: OperatorOptions,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let agents: Api<DesiredAgent> = Api::all(client.clone());
    let extended = options.extended_daemonset_enabled;
    let profiles = options.profiles_enabled;
    let ctx = Arc::new(AgentContext::from_client(client.clone(), options));

    let mut controller = Controller::new(agents, watcher_config())
        .owns(Api::<DaemonSet>::all(client.clone()), watcher_config())
        .owns(Api::<Deployment>::all(client.clone()), watcher_config());

    if extended {
        tracing::info!("- watching ExtendedDaemonSets");
        controller = controller.owns(
            Api::<ExtendedDaemonSet>::all(client.clone()),
            watcher_config(),
        );
    }

    if profiles {
        tracing::info!("- watching AgentProfiles");
        let known_agents = controller.store();
        controller = controller.watches(
            Api::<AgentProfile>::all(client),
            watcher_config(),
            move |_profile| {
                known_agents
                    .state()
                    .iter()
                    .map(|agent| ObjectRef::from_obj(agent.as_ref()))
                    .collect::<Vec<_>>()
            },
        );
    }

    tracing::info!("- DesiredAgent controller");

    vec![Box::pin(
        controller
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("DesiredAgent")),
    )]
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
