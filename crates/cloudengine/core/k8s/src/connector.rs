use std::{
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use cloudengine_core::{
    env::infer,
    retry::{retry_with_backoff, RetryPolicy},
};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use thiserror::Error;
use tokio::{
    process::Command,
    time::{timeout_at, Instant},
};
use tracing::{info, instrument, warn, Level};

const ENV_KIND_BINARY: &str = "CLOUDENGINE_KIND_BINARY";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Attach to the cluster of the current kube config instead of
    /// provisioning an ephemeral one.
    pub use_existing_cluster: bool,
    pub start_timeout: Duration,
    /// Forward the provisioner's output to this process.
    pub attach_output: bool,
    /// Prefix of the ephemeral cluster name; a random suffix is appended so
    /// that an existing cluster is never reused nor deleted.
    pub ephemeral_cluster_name: String,
    /// Path of the `kind` binary; defaults to `$CLOUDENGINE_KIND_BINARY`,
    /// then `kind` on `PATH`.
    pub provisioner: Option<PathBuf>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            use_existing_cluster: true,
            start_timeout: Duration::from_secs(10 * 60), // 10 minutes
            attach_output: false,
            ephemeral_cluster_name: "cloudengine".into(),
            provisioner: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("failed to load the kube config: {0}")]
    Config(String),
    #[error("failed to provision an ephemeral control plane: {0}")]
    Provision(String),
    #[error("control plane was not reachable within {0:?}")]
    Timeout(Duration),
    #[error("failed to release the control plane: {0}")]
    Release(String),
}

/// A live connection to a control plane; stopping it consumes it.
pub struct Connection {
    config: Config,
    ephemeral: Option<EphemeralCluster>,
    kube: Client,
}

impl Connection {
    /// Blocks until the API server answers, or fails once
    /// `config.start_timeout` has elapsed.
    #[instrument(level = Level::INFO, skip_all, fields(existing = config.use_existing_cluster), err(Display))]
    pub async fn start(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let deadline = Instant::now() + config.start_timeout;

        let (kube_config, ephemeral) = if config.use_existing_cluster {
            let kube_config = Config::infer()
                .await
                .map_err(|error| ConnectorError::Config(error.to_string()))?;
            (kube_config, None)
        } else {
            let cluster = EphemeralCluster::new(config)?;
            let provisioned = match timeout_at(deadline, cluster.create()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectorError::Timeout(config.start_timeout)),
            };
            match provisioned {
                Ok(()) => match cluster.load_config().await {
                    Ok(kube_config) => (kube_config, Some(cluster)),
                    Err(error) => return Err(cluster.abandon(error).await),
                },
                Err(error) => return Err(cluster.abandon(error).await),
            }
        };

        let kube = match Client::try_from(kube_config.clone()) {
            Ok(kube) => kube,
            Err(error) => {
                let error = ConnectorError::Config(error.to_string());
                return Err(match ephemeral {
                    Some(cluster) => cluster.abandon(error).await,
                    None => error,
                });
            }
        };

        let connection = Self {
            config: kube_config,
            ephemeral,
            kube,
        };
        match timeout_at(deadline, connection.wait_until_reachable()).await {
            Ok(()) => Ok(connection),
            Err(_) => {
                let error = ConnectorError::Timeout(config.start_timeout);
                if let Err(release) = connection.stop().await {
                    warn!("{release}");
                }
                Err(error)
            }
        }
    }

    pub fn client(&self) -> Client {
        self.kube.clone()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral.is_some()
    }

    /// Releases the control plane, deleting it if it was provisioned here.
    #[instrument(level = Level::INFO, skip_all, err(Display))]
    pub async fn stop(self) -> Result<(), ConnectorError> {
        drop(self.kube);
        match self.ephemeral {
            Some(cluster) => cluster.delete().await,
            None => {
                info!("detached from the control plane");
                Ok(())
            }
        }
    }

    async fn wait_until_reachable(&self) {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::unbounded()
        };

        match retry_with_backoff(&policy, "apiserver_version", || self.kube.apiserver_version())
            .await
        {
            Ok(version) => info!(
                "connected to the control plane: {} ({})",
                &self.config.cluster_url, version.git_version,
            ),
            // an unbounded policy only stops on success
            Err(error) => warn!("{error}"),
        }
    }
}

/// A throwaway `kind` cluster.
struct EphemeralCluster {
    attach_output: bool,
    binary: PathBuf,
    kubeconfig: PathBuf,
    name: String,
}

impl EphemeralCluster {
    fn new(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        let binary = match config
            .provisioner
            .clone()
            .or_else(|| infer(ENV_KIND_BINARY).ok())
        {
            Some(binary) => binary,
            None => ::which::which("kind").map_err(|error| {
                ConnectorError::Provision(format!("failed to find the kind binary: {error}"))
            })?,
        };

        let suffix = ::uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", &config.ephemeral_cluster_name, &suffix[..8]);
        let kubeconfig =
            env::temp_dir().join(format!("{name}-{}.kubeconfig", ::uuid::Uuid::new_v4()));

        Ok(Self {
            attach_output: config.attach_output,
            binary,
            kubeconfig,
            name,
        })
    }

    async fn create(&self) -> Result<(), ConnectorError> {
        info!("provisioning an ephemeral control plane: {}", &self.name);
        self.kind([
            OsStr::new("create"),
            OsStr::new("cluster"),
            OsStr::new("--name"),
            OsStr::new(&self.name),
            OsStr::new("--kubeconfig"),
            self.kubeconfig.as_os_str(),
        ])
        .await
        .map_err(ConnectorError::Provision)
    }

    async fn load_config(&self) -> Result<Config, ConnectorError> {
        let kubeconfig = Kubeconfig::read_from(&self.kubeconfig)
            .map_err(|error| ConnectorError::Config(error.to_string()))?;
        Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|error| ConnectorError::Config(error.to_string()))
    }

    /// Deletes a half-provisioned cluster and hands back the original error.
    ///
    /// The name is unique to this process, so nothing else is touched.
    async fn abandon(self, error: ConnectorError) -> ConnectorError {
        if let Err(release) = self.delete().await {
            warn!("{release}");
        }
        error
    }

    async fn delete(self) -> Result<(), ConnectorError> {
        info!("deleting the ephemeral control plane: {}", &self.name);
        let result = self
            .kind([
                OsStr::new("delete"),
                OsStr::new("cluster"),
                OsStr::new("--name"),
                OsStr::new(&self.name),
            ])
            .await
            .map_err(ConnectorError::Release);

        remove_kubeconfig(&self.kubeconfig).await;
        result
    }

    async fn kind<const N: usize>(&self, args: [&OsStr; N]) -> Result<(), String> {
        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);
        if !self.attach_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let status = command
            .status()
            .await
            .map_err(|error| format!("failed to run {:?}: {error}", &self.binary))?;
        if status.success() {
            Ok(())
        } else {
            Err(format!("{:?} exited with {status}", &self.binary))
        }
    }
}

async fn remove_kubeconfig(path: &Path) {
    if let Err(error) = ::tokio::fs::remove_file(path).await {
        if error.kind() != ::std::io::ErrorKind::NotFound {
            warn!("failed to remove {path:?}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_attaches_to_an_existing_cluster() {
        let config = ConnectorConfig::default();
        assert!(config.use_existing_cluster);
        assert_eq!(config.start_timeout, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn missing_provisioner_is_a_provisioning_error() {
        let config = ConnectorConfig {
            use_existing_cluster: false,
            start_timeout: Duration::from_secs(5),
            provisioner: Some("/nonexistent/cloudengine-kind".into()),
            ..Default::default()
        };

        let error = Connection::start(&config).await.err().expect("no kind binary");
        assert!(matches!(error, ConnectorError::Provision(_)), "{error}");
    }

    #[test]
    fn ephemeral_clusters_get_unique_names() {
        let config = ConnectorConfig {
            provisioner: Some("/nonexistent/cloudengine-kind".into()),
            ..Default::default()
        };

        let first = EphemeralCluster::new(&config).unwrap();
        let second = EphemeralCluster::new(&config).unwrap();
        assert_ne!(first.name, second.name);
        for cluster in [&first, &second] {
            assert!(cluster.name.starts_with("cloudengine-"), "{}", &cluster.name);
            assert_ne!(cluster.name, config.ephemeral_cluster_name);
        }
    }

    /// A `kind` stand-in that logs its arguments and refuses to create,
    /// as `kind` does when the cluster name is already taken.
    #[cfg(unix)]
    #[tokio::test]
    async fn failed_provisioning_only_deletes_its_own_cluster() {
        use std::os::unix::fs::PermissionsExt;

        let dir = env::temp_dir().join(format!("cloudengine-kind-{}", ::uuid::Uuid::new_v4()));
        ::std::fs::create_dir_all(&dir).unwrap();
        let binary = dir.join("kind");
        let log = dir.join("calls.log");
        ::std::fs::write(
            &binary,
            format!(
                "#!/bin/sh\necho \"$@\" >> {log:?}\n[ \"$1\" = create ] && exit 1\nexit 0\n"
            ),
        )
        .unwrap();
        ::std::fs::set_permissions(&binary, ::std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = ConnectorConfig {
            use_existing_cluster: false,
            start_timeout: Duration::from_secs(30),
            provisioner: Some(binary),
            ..Default::default()
        };
        let error = Connection::start(&config).await.err().expect("create fails");
        assert!(matches!(error, ConnectorError::Provision(_)), "{error}");

        let calls = ::std::fs::read_to_string(&log).unwrap();
        ::std::fs::remove_dir_all(&dir).ok();

        let calls: Vec<Vec<&str>> = calls
            .lines()
            .map(|line| line.split_whitespace().collect())
            .collect();
        assert_eq!(calls.len(), 2, "{calls:?}");
        assert_eq!(calls[0][..3], ["create", "cluster", "--name"]);
        assert_eq!(calls[1][..3], ["delete", "cluster", "--name"]);

        let created = calls[0][3];
        assert_ne!(created, "cloudengine");
        assert!(created.starts_with("cloudengine-"), "{created}");
        assert_eq!(calls[1][3], created);
    }
}
