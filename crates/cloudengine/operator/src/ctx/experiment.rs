use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use cloudengine_api::{
    custom_cluster::{CustomClusterCrd, CustomClusterState},
    experiment::{ExperimentCrd, ExperimentSpec, ExperimentState, ExperimentStatus},
};
use cloudengine_core_k8s::{
    client::ObjectClient,
    manager::{Context, ReconcileError},
    name::NamespacedName,
};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, CustomResourceExt, ResourceExt,
};
use serde_json::json;
use tracing::{info, instrument, Level};

#[derive(Default)]
pub struct Ctx {}

#[async_trait]
impl ::cloudengine_core_k8s::manager::Ctx for Ctx {
    type Data = ExperimentCrd;

    const NAME: &'static str = "experiment-controller";
    const FALLBACK: Duration = Duration::from_secs(30); // 30 seconds

    #[instrument(level = Level::INFO, skip_all, fields(name = %data.name_any(), namespace = data.namespace()), err(Display))]
    async fn reconcile(
        context: Arc<Context<Self>>,
        data: Arc<<Self as ::cloudengine_core_k8s::manager::Ctx>::Data>,
    ) -> Result<Action, ReconcileError>
    where
        Self: Sized,
    {
        let name = data.name_any();
        let namespace = data.namespace().unwrap_or_default();

        let cluster_name = NamespacedName::namespaced(&namespace, &data.spec.cluster);
        let cluster_state = match context.client.get::<CustomClusterCrd>(&cluster_name).await {
            Ok(cluster) => cluster.status.map(|status| status.state),
            Err(error) if error.is_not_found() => None,
            Err(error) => return Err(error.into()),
        };

        let (state, message) = next_state(&data.spec, &cluster_name, cluster_state);
        let status = data.status.as_ref();
        if status.map(|status| status.state) == Some(state)
            && status.and_then(|status| status.message.as_ref()) == message.as_ref()
        {
            return Ok(Action::requeue(
                <Self as ::cloudengine_core_k8s::manager::Ctx>::FALLBACK,
            ));
        }

        Self::update_state(&context, &namespace, &name, state, message).await?;
        info!("experiment is {state}: {namespace}/{name}");
        Ok(Action::requeue(
            <Self as ::cloudengine_core_k8s::manager::Ctx>::FALLBACK,
        ))
    }
}

impl Ctx {
    #[instrument(level = Level::INFO, skip(context), err(Display))]
    async fn update_state(
        context: &Context<Self>,
        namespace: &str,
        name: &str,
        state: ExperimentState,
        message: Option<String>,
    ) -> Result<(), ReconcileError> {
        let api = Api::<<Self as ::cloudengine_core_k8s::manager::Ctx>::Data>::namespaced(
            context.kube.clone(),
            namespace,
        );
        let crd = <Self as ::cloudengine_core_k8s::manager::Ctx>::Data::api_resource();

        let patch = Patch::Merge(json!({
            "apiVersion": crd.api_version,
            "kind": crd.kind,
            "status": ExperimentStatus {
                state,
                message,
                last_updated: Utc::now(),
            },
        }));
        let pp = PatchParams::apply(<Self as ::cloudengine_core_k8s::manager::Ctx>::NAME);
        api.patch_status(name, &pp, &patch).await?;
        Ok(())
    }
}

fn next_state(
    spec: &ExperimentSpec,
    cluster_name: &NamespacedName,
    cluster_state: Option<CustomClusterState>,
) -> (ExperimentState, Option<String>) {
    match cluster_state {
        _ if spec.pause => (ExperimentState::Paused, None),
        Some(CustomClusterState::Ready) => (ExperimentState::Running, None),
        Some(CustomClusterState::Pending) | None => (
            ExperimentState::Pending,
            Some(format!("waiting for cluster {cluster_name}")),
        ),
    }
}
