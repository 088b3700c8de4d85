use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use clap::{value_parser, ArgAction, Parser};
use cloudengine_api::custom_cluster::CustomClusterCrd;
use cloudengine_core::{retry::RetryPolicy, signal::FunctionSignal};
use cloudengine_core_k8s::{
    bootstrap::{bootstrap, BootstrapConfig, Phase},
    connector::ConnectorConfig,
};
use duration_string::DurationString;
use tokio::spawn;
use tracing::{error, info, warn};

use crate::health::Readiness;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Args {
    /// Turn debugging information on
    #[arg(short, long, env = "CLOUDENGINE_DEBUG", action = ArgAction::Count)]
    #[arg(value_parser = value_parser!(u8).range(..=3))]
    debug: u8,

    /// Attach to the cluster of the current kubeconfig instead of
    /// provisioning an ephemeral one
    #[arg(
        long,
        env = "CLOUDENGINE_USE_EXISTING_CLUSTER",
        action = ArgAction::Set,
        default_value_t = true
    )]
    use_existing_cluster: bool,

    /// Directory of extra CRD manifests to register and install
    #[arg(long, env = "CLOUDENGINE_CRD_DIR")]
    crd_dir: Option<PathBuf>,

    /// Skip installing the CRDs into the cluster
    #[arg(long, env = "CLOUDENGINE_SKIP_CRD_INSTALL")]
    skip_crd_install: bool,

    /// How long to wait for the control plane to answer
    #[arg(long, env = "CLOUDENGINE_START_TIMEOUT", default_value = "10m")]
    start_timeout: DurationString,

    /// How long to wait for the controllers to stop
    #[arg(long, env = "CLOUDENGINE_SHUTDOWN_TIMEOUT", default_value = "30s")]
    shutdown_timeout: DurationString,

    /// Number of attempts when ensuring the meta cluster (0 = unbounded)
    #[arg(long, env = "CLOUDENGINE_ENSURE_ATTEMPTS", default_value_t = 5)]
    ensure_attempts: u32,

    /// Address of the health and readiness endpoints
    #[arg(
        long,
        env = "CLOUDENGINE_METRICS_BIND_ADDRESS",
        default_value = "0.0.0.0:8080"
    )]
    metrics_bind_address: SocketAddr,

    /// Name of the ephemeral cluster
    #[arg(long, env = "CLOUDENGINE_EPHEMERAL_CLUSTER_NAME", default_value = "cloudengine")]
    ephemeral_cluster_name: String,

    /// Path of the `kind` binary used to provision the ephemeral cluster
    #[arg(long, env = "CLOUDENGINE_KIND_BINARY")]
    kind_binary: Option<PathBuf>,

    /// Forward the output of the cluster provisioner
    #[arg(long, env = "CLOUDENGINE_ATTACH_CONTROL_PLANE_OUTPUT")]
    attach_control_plane_output: bool,
}

impl Args {
    pub(crate) async fn run(self) -> Result<()> {
        ::cloudengine_core::tracer::init_once_with_level_int(self.debug, true);

        let result = self.try_run().await;
        if let Err(error) = &result {
            error!("{error}");
        }

        ::cloudengine_core::tracer::shutdown();
        result
    }

    async fn try_run(self) -> Result<()> {
        let signal = FunctionSignal::default();
        signal.trap_on_sigint()?;

        let readiness = Readiness::default();
        let health = spawn(crate::health::loop_forever(
            self.metrics_bind_address,
            readiness.clone(),
            signal.clone(),
        ));

        let config = self.to_config();
        let env = bootstrap::<CustomClusterCrd, _, _>(
            &config,
            signal.clone(),
            ::cloudengine_api::add_to_scheme,
            crate::ctx::register,
        )
        .await;

        let env = match env {
            Ok(env) => env,
            Err(error) if error.phase() == Phase::Cancelled => {
                warn!("{error}");
                health.abort();
                info!("Terminated.");
                return Ok(());
            }
            Err(error) => {
                health.abort();
                return Err(error.into());
            }
        };

        readiness.mark_ready();
        let ensured = env.running().ensured();
        let ephemeral = env.connection().is_ephemeral();
        info!(?ensured, ephemeral, "Ready");
        signal.wait_to_terminate().await;

        info!("Terminating...");
        readiness.mark_unready();
        let result = env.teardown().await.map_err(|error| anyhow!(error));

        health.abort();
        info!("Terminated.");
        result
    }

    fn to_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            connector: ConnectorConfig {
                use_existing_cluster: self.use_existing_cluster,
                start_timeout: Duration::from(self.start_timeout),
                attach_output: self.attach_control_plane_output,
                ephemeral_cluster_name: self.ephemeral_cluster_name.clone(),
                provisioner: self.kind_binary.clone(),
            },
            crd_dir: self.crd_dir.clone(),
            field_manager: crate::consts::NAME.into(),
            install_crds: !self.skip_crd_install,
            retry: RetryPolicy::with_max_attempts(self.ensure_attempts),
            shutdown_timeout: Duration::from(self.shutdown_timeout),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_attach_to_an_existing_cluster() {
        let args = Args::try_parse_from(["cloudengine-operator"]).unwrap();
        let config = args.to_config();

        assert!(config.connector.use_existing_cluster);
        assert_eq!(config.connector.start_timeout, Duration::from_secs(600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.install_crds);
        assert_eq!(config.field_manager, "cloudengine-operator");
        assert_eq!(config.connector.provisioner, None);
        assert_eq!(args.metrics_bind_address, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn provisions_an_ephemeral_cluster_on_request() {
        let args = Args::try_parse_from([
            "cloudengine-operator",
            "-dd",
            "--use-existing-cluster=false",
            "--start-timeout=90s",
            "--crd-dir=./crds",
            "--kind-binary=/opt/bin/kind",
        ])
        .unwrap();
        let config = args.to_config();

        assert_eq!(args.debug, 2);
        assert!(!config.connector.use_existing_cluster);
        assert_eq!(config.connector.start_timeout, Duration::from_secs(90));
        assert_eq!(config.crd_dir, Some(PathBuf::from("./crds")));
        assert_eq!(config.connector.provisioner, Some(PathBuf::from("/opt/bin/kind")));
    }
}
