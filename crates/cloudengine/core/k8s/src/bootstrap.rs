//! Startup and teardown sequencing of the operator.
//!
//! Connector → Scheme → Client → Registrar happen strictly in order. The
//! manager run-loop (task A) and the singleton ensurer (task B) are then
//! spawned together and joined on a [`Barrier`], fed only from inside each
//! task.

use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use anyhow::anyhow;
use cloudengine_core::{retry::RetryPolicy, signal::FunctionSignal};
use strum::Display;
use thiserror::Error;
use tokio::{join, select, spawn, sync::oneshot, task::JoinHandle, time::timeout};
use tracing::{error, info, instrument, warn, Level};

use crate::{
    client::{DirectClient, ObjectClient},
    connector::{Connection, ConnectorConfig},
    manager::{Manager, RegistrationError},
    scheme::{Scheme, SchemeBuilder, SchemeError},
    singleton::{EnsureError, Ensured, Singleton, SingletonEnsurer},
};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Connector,
    Scheme,
    Manager,
    Registration,
    Ensure,
    /// The termination signal arrived before startup completed
    Cancelled,
}

#[derive(Debug, Error)]
#[error("bootstrap failed in the {phase} phase: {source}")]
pub struct BootstrapError {
    phase: Phase,
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl BootstrapError {
    pub fn new(phase: Phase, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// One receiver per spawned startup task, each resolved by that task.
pub struct Barrier {
    ensured: oneshot::Receiver<Result<Ensured, EnsureError>>,
    ready: oneshot::Receiver<()>,
}

impl Barrier {
    pub fn new(
        ready: oneshot::Receiver<()>,
        ensured: oneshot::Receiver<Result<Ensured, EnsureError>>,
    ) -> Self {
        Self { ensured, ready }
    }

    /// Waits for the run-loop to become ready and for the ensurer to finish.
    ///
    /// The run-loop only reports readiness; it keeps running afterwards.
    pub async fn wait(self) -> Result<Ensured, BarrierError> {
        let (ready, ensured) = join!(self.ready, self.ensured);
        if ready.is_err() {
            return Err(BarrierError::NotReady);
        }
        match ensured {
            Ok(result) => result.map_err(BarrierError::Ensure),
            Err(_) => Err(BarrierError::Ensure(EnsureError::Aborted)),
        }
    }
}

#[derive(Debug)]
pub enum BarrierError {
    NotReady,
    Ensure(EnsureError),
}

/// The bootstrap-phase tasks, after the barrier has been passed.
pub struct Running {
    ensured: Ensured,
    manager: JoinHandle<anyhow::Result<()>>,
    signal: FunctionSignal,
}

impl Running {
    pub fn ensured(&self) -> Ensured {
        self.ensured
    }

    pub fn signal(&self) -> &FunctionSignal {
        &self.signal
    }

    pub fn is_finished(&self) -> bool {
        self.manager.is_finished()
    }

    /// Cancels the run-loop and waits for it to exit.
    #[instrument(level = Level::INFO, skip(self), err(Display))]
    pub async fn shutdown(self, grace_period: Duration) -> Result<(), BootstrapError> {
        self.signal.terminate();
        join_manager(self.manager, grace_period).await
    }
}

async fn join_manager(
    mut manager: JoinHandle<anyhow::Result<()>>,
    grace_period: Duration,
) -> Result<(), BootstrapError> {
    match timeout(grace_period, &mut manager).await {
        Ok(Ok(result)) => result.map_err(|error| BootstrapError::new(Phase::Manager, error)),
        Ok(Err(error)) => Err(BootstrapError::new(Phase::Manager, error)),
        Err(_) => {
            manager.abort();
            Err(BootstrapError::new(
                Phase::Manager,
                anyhow!("run-loop did not stop within {grace_period:?}"),
            ))
        }
    }
}

/// Spawns the manager run-loop and the singleton ensurer, and waits on the
/// [`Barrier`].
///
/// On failure the run-loop is cancelled and joined before returning.
#[instrument(level = Level::INFO, skip_all, err(Display))]
pub async fn launch<C, K>(
    mut manager: Manager,
    ensurer: SingletonEnsurer<C>,
    signal: FunctionSignal,
    grace_period: Duration,
) -> Result<Running, BootstrapError>
where
    C: 'static + ObjectClient,
    K: 'static + Singleton,
{
    let ready = manager.subscribe_ready();
    let manager = spawn(manager.start(signal.clone()));

    let (tx, ensured) = oneshot::channel();
    spawn(async move {
        tx.send(ensurer.ensure_exists::<K>().await).ok();
    });

    let barrier = Barrier::new(ready, ensured);
    match barrier.wait().await {
        Ok(ensured) => {
            info!("bootstrap has completed: {ensured:?}");
            Ok(Running {
                ensured,
                manager,
                signal,
            })
        }
        Err(BarrierError::NotReady) => {
            signal.terminate();
            let error = match join_manager(manager, grace_period).await {
                Err(error) => error,
                Ok(()) => BootstrapError::new(
                    Phase::Manager,
                    anyhow!("run-loop exited before becoming ready"),
                ),
            };
            Err(error)
        }
        Err(BarrierError::Ensure(error)) => {
            signal.terminate();
            if let Err(error) = join_manager(manager, grace_period).await {
                warn!("{error}");
            }
            Err(BootstrapError::new(Phase::Ensure, error))
        }
    }
}

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub connector: ConnectorConfig,
    /// Extra CRD manifests to register and install
    pub crd_dir: Option<PathBuf>,
    pub establish_timeout: Duration,
    pub field_manager: String,
    pub install_crds: bool,
    pub retry: RetryPolicy,
    pub shutdown_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            connector: ConnectorConfig::default(),
            crd_dir: None,
            establish_timeout: Duration::from_secs(60),
            field_manager: "cloudengine".into(),
            install_crds: true,
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// A fully bootstrapped operator.
pub struct Environment {
    connection: Connection,
    running: Running,
    shutdown_timeout: Duration,
}

impl Environment {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn running(&self) -> &Running {
        &self.running
    }

    /// Stops the run-loop first, then the connector.
    #[instrument(level = Level::INFO, skip_all, err(Display))]
    pub async fn teardown(self) -> Result<(), BootstrapError> {
        let stopped = self.running.shutdown(self.shutdown_timeout).await;
        if let Err(error) = &stopped {
            error!("{error}");
        }

        let released = self
            .connection
            .stop()
            .await
            .map_err(|error| BootstrapError::new(Phase::Connector, error));
        stopped.and(released)
    }
}

fn cancelled() -> BootstrapError {
    BootstrapError::new(
        Phase::Cancelled,
        anyhow!("interrupted by the termination signal"),
    )
}

/// Brings the operator to a running state.
///
/// `add_to_scheme` registers the resource types and `register` adds the
/// controllers; both run before anything is spawned. A termination signal
/// observed before the barrier is passed aborts startup with
/// [`Phase::Cancelled`], releasing the connection.
#[instrument(level = Level::INFO, skip_all, err(Display))]
pub async fn bootstrap<K, S, R>(
    config: &BootstrapConfig,
    signal: FunctionSignal,
    add_to_scheme: S,
    register: R,
) -> Result<Environment, BootstrapError>
where
    K: 'static + Singleton,
    S: FnOnce(&mut SchemeBuilder) -> Result<(), SchemeError>,
    R: FnOnce(&mut Manager, &DirectClient) -> Result<(), RegistrationError>,
{
    let connection = select! {
        biased;
        () = signal.wait_to_terminate() => return Err(cancelled()),
        result = Connection::start(&config.connector) => {
            result.map_err(|error| BootstrapError::new(Phase::Connector, error))?
        }
    };

    let result = select! {
        biased;
        () = signal.wait_to_terminate() => Err(cancelled()),
        result = bootstrap_on::<K, _, _>(config, &connection, signal.clone(), add_to_scheme, register) => result,
    };

    match result {
        Ok(running) => Ok(Environment {
            connection,
            running,
            shutdown_timeout: config.shutdown_timeout,
        }),
        Err(error) => {
            if let Err(release) = connection.stop().await {
                warn!("{release}");
            }
            Err(error)
        }
    }
}

async fn bootstrap_on<K, S, R>(
    config: &BootstrapConfig,
    connection: &Connection,
    signal: FunctionSignal,
    add_to_scheme: S,
    register: R,
) -> Result<Running, BootstrapError>
where
    K: 'static + Singleton,
    S: FnOnce(&mut SchemeBuilder) -> Result<(), SchemeError>,
    R: FnOnce(&mut Manager, &DirectClient) -> Result<(), RegistrationError>,
{
    let scheme_error = |error| BootstrapError::new(Phase::Scheme, error);

    let mut builder = Scheme::builder();
    add_to_scheme(&mut builder).map_err(scheme_error)?;
    if let Some(dir) = &config.crd_dir {
        builder.register_dir(dir).await.map_err(scheme_error)?;
    }
    let scheme = Arc::new(builder.build());
    if scheme.is_empty() {
        warn!("no resource types were registered");
    }

    if config.install_crds {
        scheme
            .install(
                connection.client(),
                &config.field_manager,
                config.establish_timeout,
            )
            .await
            .map_err(scheme_error)?;
    }

    let client = DirectClient::new(
        connection.client(),
        scheme.clone(),
        config.field_manager.clone(),
    );

    let mut manager = Manager::new(scheme);
    register(&mut manager, &client)
        .map_err(|error| BootstrapError::new(Phase::Registration, error))?;

    let ensurer = SingletonEnsurer::with_retry(client, config.retry.clone());
    launch::<_, K>(manager, ensurer, signal, config.shutdown_timeout).await
}
