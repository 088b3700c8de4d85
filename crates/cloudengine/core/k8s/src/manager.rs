use core::{fmt, time::Duration};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cloudengine_core::signal::FunctionSignal;
use futures::{future, StreamExt};
use kube::{
    runtime::{
        controller::Action,
        events::{Recorder, Reporter},
        watcher::Config,
    },
    Api, Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::{select, sync::oneshot, task::JoinSet};
use tracing::{debug, error, info, instrument, warn, Level};

use crate::{
    client::{ClientError, DirectClient},
    scheme::{Scheme, SchemeError, TypeKey},
};

/// A unit of the reconcile loop, owned by the [`Manager`] until it starts.
#[async_trait]
pub trait Controller
where
    Self: Send,
{
    fn name(&self) -> &str;

    /// The kind this controller reacts to.
    fn watches(&self) -> &TypeKey;

    /// Runs until `signal` terminates; returning earlier is a failure.
    async fn run(self: Box<Self>, signal: FunctionSignal) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Kube(#[from] ::kube::Error),
}

/// Everything a reconciler may touch while handling one object.
pub struct Context<C> {
    pub client: DirectClient,
    pub ctx: Arc<C>,
    pub kube: Client,
    reporter: Reporter,
}

impl<C> Context<C> {
    pub fn recorder<K>(&self, data: &K) -> Recorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(self.kube.clone(), self.reporter.clone(), data.object_ref(&()))
    }
}

#[async_trait]
pub trait Ctx
where
    Self: 'static + Send + Sync,
{
    type Data: Clone
        + fmt::Debug
        + DeserializeOwned
        + Resource<DynamicType = ()>
        + Send
        + Sync
        + 'static;

    const NAME: &'static str;
    const FALLBACK: Duration = Duration::from_secs(30 * 60); // 30 minutes

    async fn reconcile(
        context: Arc<Context<Self>>,
        data: Arc<<Self as Ctx>::Data>,
    ) -> Result<Action, ReconcileError>
    where
        Self: Sized;

    fn error_policy(_context: Arc<Context<Self>>, _error: &ReconcileError) -> Action
    where
        Self: Sized,
    {
        Action::requeue(<Self as Ctx>::FALLBACK)
    }
}

/// Drives a [`Ctx`] with the kube-runtime controller over every namespace.
pub struct KubeController<C> {
    context: Arc<Context<C>>,
    key: TypeKey,
}

impl<C> KubeController<C>
where
    C: Ctx,
{
    pub fn new(client: DirectClient, ctx: C) -> Self {
        let reporter = Reporter {
            controller: <C as Ctx>::NAME.into(),
            instance: ::gethostname::gethostname().into_string().ok(),
        };
        Self {
            context: Arc::new(Context {
                kube: client.kube().clone(),
                client,
                ctx: Arc::new(ctx),
                reporter,
            }),
            key: TypeKey::of::<<C as Ctx>::Data>(),
        }
    }
}

#[async_trait]
impl<C> Controller for KubeController<C>
where
    C: Ctx,
{
    fn name(&self) -> &str {
        <C as Ctx>::NAME
    }

    fn watches(&self) -> &TypeKey {
        &self.key
    }

    async fn run(self: Box<Self>, signal: FunctionSignal) -> Result<()> {
        let api = Api::<<C as Ctx>::Data>::all(self.context.kube.clone());

        let controller = ::kube::runtime::Controller::new(api, Config::default())
            .run(
                |data, context| <C as Ctx>::reconcile(context, data),
                |data, error, context| {
                    let kind = <<C as Ctx>::Data as Resource>::kind(&());
                    let name = data.name_any();
                    warn!("failed to reconcile {kind} {name:?}: {error}");
                    <C as Ctx>::error_policy(context, error)
                },
                self.context.clone(),
            )
            .for_each(|result| {
                match result {
                    Ok((object, action)) => debug!("reconciled {object}: {action:?}"),
                    Err(error) => debug!("reconcile loop error: {error}"),
                }
                future::ready(())
            });

        select! {
            () = controller => bail!("watch stream has ended"),
            () = signal.wait_to_terminate() => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("{key} is already watched by {existing:?}")]
    Duplicate { key: TypeKey, existing: String },
    #[error("a controller named {name:?} is already registered")]
    DuplicateName { name: String },
    #[error("controller {name:?} watches an unknown kind: {source}")]
    Unregistered {
        name: String,
        #[source]
        source: SchemeError,
    },
}

/// Owns the registered controllers and runs them once.
///
/// Registration takes `&mut self` while [`Manager::start`] consumes the
/// manager, so no controller can be added after the loop has started.
pub struct Manager {
    controllers: Vec<Box<dyn Controller>>,
    ready: Option<oneshot::Sender<()>>,
    scheme: Arc<Scheme>,
}

impl Manager {
    pub fn new(scheme: Arc<Scheme>) -> Self {
        Self {
            controllers: Vec::default(),
            ready: None,
            scheme,
        }
    }

    pub fn controllers(&self) -> impl Iterator<Item = &str> {
        self.controllers.iter().map(|controller| controller.name())
    }

    pub fn register<T>(&mut self, controller: T) -> Result<&mut Self, RegistrationError>
    where
        T: 'static + Controller,
    {
        let key = controller.watches();
        if let Err(source) = self.scheme.resolve(key) {
            return Err(RegistrationError::Unregistered {
                name: controller.name().into(),
                source,
            });
        }
        if let Some(existing) = self
            .controllers
            .iter()
            .find(|registered| registered.watches() == key)
        {
            return Err(RegistrationError::Duplicate {
                key: key.clone(),
                existing: existing.name().into(),
            });
        }
        if self
            .controllers
            .iter()
            .any(|registered| registered.name() == controller.name())
        {
            return Err(RegistrationError::DuplicateName {
                name: controller.name().into(),
            });
        }

        info!("registered controller: {} ({key})", controller.name());
        self.controllers.push(Box::new(controller));
        Ok(self)
    }

    pub fn register_ctx<C>(
        &mut self,
        client: DirectClient,
        ctx: C,
    ) -> Result<&mut Self, RegistrationError>
    where
        C: Ctx,
    {
        self.register(KubeController::new(client, ctx))
    }

    /// Resolves once every controller task has been spawned.
    ///
    /// The receiver errors out if the manager is dropped before starting.
    pub fn subscribe_ready(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ready = Some(tx);
        rx
    }

    /// Runs every controller until `signal` terminates.
    ///
    /// A controller that fails or stops on its own terminates the signal, so
    /// the others wind down and the failure is returned.
    #[instrument(level = Level::INFO, skip_all, err(Display))]
    pub async fn start(self, signal: FunctionSignal) -> Result<()> {
        let Self {
            controllers, ready, ..
        } = self;

        let mut tasks = JoinSet::new();
        for controller in controllers {
            let name = controller.name().to_string();
            let signal = signal.clone();
            tasks.spawn(async move {
                info!("starting controller: {name}");
                let result = controller.run(signal).await;
                (name, result)
            });
        }

        if let Some(ready) = ready {
            ready.send(()).ok();
        }
        info!("manager is running");

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let error = match joined {
                Ok((name, Ok(()))) if signal.is_terminating() => {
                    info!("stopped controller: {name}");
                    continue;
                }
                Ok((name, Ok(()))) => anyhow!("controller {name:?} stopped before cancellation"),
                Ok((name, Err(error))) => anyhow!("controller {name:?} failed: {error}"),
                Err(error) => anyhow!("controller task failed: {error}"),
            };

            error!("{error}");
            signal.terminate();
            failure.get_or_insert(error);
        }

        match failure {
            Some(error) => Err(error),
            None => {
                info!("manager has stopped");
                Ok(())
            }
        }
    }
}
