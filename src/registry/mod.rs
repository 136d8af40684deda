use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use tracing::{debug, info};

use crate::util::errors::{Error, Result, StdError};

/// How often the background sweeper scans the last-seen inventory.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Inventory entries untouched for this long are pruned.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved, ready-to-use connection material for one remote cluster.
///
/// Owned by the registry; callers receive clones and must not feed them back.
#[derive(Clone, Debug)]
pub struct ConnectionDescriptor {
    pub cluster: String,
    pub namespace: String,
    /// Raw kubeconfig YAML, kept for tools that authenticate via a file
    /// (the helm client).
    pub kubeconfig: String,
    config: Config,
}

impl ConnectionDescriptor {
    pub fn client(&self) -> Result<Client> {
        Client::try_from(self.config.clone())
            .map_err(|e| Error::StdError(StdError::ConnectionFailed(e.to_string())))
    }
}

/// Cache of live connection descriptors for the registered target clusters.
///
/// Intentionally dumb and synchronous: it stores what it is told and never
/// decides liveness itself. One lock, short critical sections, no I/O while
/// the lock is held.
#[derive(Default)]
pub struct TargetRegistry {
    descriptors: Mutex<HashMap<String, ConnectionDescriptor>>,
    // Auxiliary last-seen inventory, pruned by the hourly sweeper
    last_seen: Mutex<HashMap<String, Instant>>,
}

fn key(cluster: &str, namespace: &str) -> String {
    format!("{namespace}/{cluster}")
}

impl TargetRegistry {
    /// Parses the credential material and stores (or overwrites) the
    /// descriptor for this cluster. Overwriting is the credential-rotation
    /// path.
    pub async fn add_or_update(&self, cluster: &str, namespace: &str, material: &[u8]) -> Result<()> {
        let yaml = std::str::from_utf8(material).map_err(|e| {
            Error::StdError(StdError::InvalidCredential(format!(
                "credential material for cluster '{cluster}' is not valid UTF-8: {e}"
            )))
        })?;
        let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| {
            Error::StdError(StdError::InvalidCredential(format!(
                "credential material for cluster '{cluster}' is not a kubeconfig: {e}"
            )))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                Error::StdError(StdError::InvalidCredential(format!(
                    "kubeconfig for cluster '{cluster}' could not be resolved: {e}"
                )))
            })?;

        let descriptor = ConnectionDescriptor {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
            kubeconfig: yaml.to_string(),
            config,
        };

        let k = key(cluster, namespace);
        self.descriptors.lock().unwrap().insert(k.clone(), descriptor);
        self.last_seen.lock().unwrap().insert(k, Instant::now());
        debug!("Registered connection descriptor for cluster '{}'", cluster);
        Ok(())
    }

    pub fn get(&self, cluster: &str, namespace: &str) -> Result<ConnectionDescriptor> {
        self.descriptors
            .lock()
            .unwrap()
            .get(&key(cluster, namespace))
            .cloned()
            .ok_or_else(|| Error::StdError(StdError::NotRegistered(cluster.to_string())))
    }

    /// Idempotent; removing an absent entry is not an error.
    pub fn remove(&self, cluster: &str, namespace: &str) {
        let k = key(cluster, namespace);
        self.descriptors.lock().unwrap().remove(&k);
        self.last_seen.lock().unwrap().remove(&k);
    }

    /// Marks the cluster as recently used in the last-seen inventory.
    pub fn touch(&self, cluster: &str, namespace: &str) {
        self.last_seen
            .lock()
            .unwrap()
            .insert(key(cluster, namespace), Instant::now());
    }

    /// One lightweight read against the remote API using the stored
    /// descriptor. Registry state is left untouched on failure: a transient
    /// outage must not force re-registration.
    pub async fn verify_connectivity(&self, cluster: &str, namespace: &str) -> Result<()> {
        let descriptor = self.get(cluster, namespace)?;
        let client = descriptor.client()?;
        let namespaces: Api<Namespace> = Api::all(client);

        let params = ListParams::default().limit(1);
        let listing = namespaces.list(&params);
        match tokio::time::timeout(CONNECT_TIMEOUT, listing).await {
            Ok(Ok(_)) => {
                self.touch(cluster, namespace);
                Ok(())
            }
            Ok(Err(e)) => Err(Error::StdError(StdError::ConnectionFailed(format!(
                "cluster '{cluster}' API list failed: {e}"
            )))),
            Err(_) => Err(Error::StdError(StdError::ConnectionFailed(format!(
                "cluster '{cluster}' API did not respond within {}s",
                CONNECT_TIMEOUT.as_secs()
            )))),
        }
    }

    /// Drops inventory entries older than `max_age`. Returns how many were
    /// pruned. Descriptors are kept; only the auxiliary inventory shrinks.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let mut inventory = self.last_seen.lock().unwrap();
        let before = inventory.len();
        inventory.retain(|_, seen| seen.elapsed() < max_age);
        before - inventory.len()
    }
}

/// Single long-lived sweeper owned by the process lifecycle. Started once
/// from main, never per-reconcile.
pub fn run_stale_sweeper(registry: Arc<TargetRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = registry.prune_stale(STALE_AFTER);
            if pruned > 0 {
                info!("Pruned {} stale cluster inventory entries", pruned);
            } else {
                debug!("Stale sweep found nothing to prune");
            }
        }
    })
}
