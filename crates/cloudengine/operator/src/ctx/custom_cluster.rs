use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use cloudengine_api::custom_cluster::{
    CustomClusterCrd, CustomClusterState, CustomClusterStatus,
};
use cloudengine_core_k8s::manager::{Context, ReconcileError};
use kube::{
    api::{Patch, PatchParams},
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, CustomResourceExt, ResourceExt,
};
use serde_json::json;
use tracing::{info, instrument, warn, Level};

#[derive(Default)]
pub struct Ctx {}

#[async_trait]
impl ::cloudengine_core_k8s::manager::Ctx for Ctx {
    type Data = CustomClusterCrd;

    const NAME: &'static str = "customcluster-controller";
    const FALLBACK: Duration = Duration::from_secs(5 * 60); // 5 minutes

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

        match data
            .status
            .as_ref()
            .map(|status| status.state)
            .unwrap_or_default()
        {
            CustomClusterState::Pending => {
                Self::update_state(&context, &namespace, &name, CustomClusterState::Ready).await?;

                let event = Event {
                    type_: EventType::Normal,
                    reason: "Ready".into(),
                    note: Some(format!("cluster {namespace}/{name} is ready")),
                    action: "Reconcile".into(),
                    secondary: None,
                };
                if let Err(error) = context.recorder(&*data).publish(event).await {
                    warn!("failed to publish an event of {namespace}/{name}: {error}");
                }

                info!("custom cluster is ready: {namespace}/{name}");
                Ok(Action::requeue(
                    <Self as ::cloudengine_core_k8s::manager::Ctx>::FALLBACK,
                ))
            }
            CustomClusterState::Ready => Ok(Action::await_change()),
        }
    }
}

impl Ctx {
    #[instrument(level = Level::INFO, skip(context), err(Display))]
    async fn update_state(
        context: &Context<Self>,
        namespace: &str,
        name: &str,
        state: CustomClusterState,
    ) -> Result<(), ReconcileError> {
        let api = Api::<<Self as ::cloudengine_core_k8s::manager::Ctx>::Data>::namespaced(
            context.kube.clone(),
            namespace,
        );
        let crd = <Self as ::cloudengine_core_k8s::manager::Ctx>::Data::api_resource();

        let patch = Patch::Merge(json!({
            "apiVersion": crd.api_version,
            "kind": crd.kind,
            "status": CustomClusterStatus {
                state,
                last_updated: Utc::now(),
            },
        }));
        let pp = PatchParams::apply(<Self as ::cloudengine_core_k8s::manager::Ctx>::NAME);
        api.patch_status(name, &pp, &patch).await?;
        Ok(())
    }
}
