//! Streaming configuration provider.
//!
//! Keeps one HTTP connection open against any seed host and consumes the
//! unbounded stream of JSON config documents it pushes, delimited by the
//! four-byte separator `"\n\n\n\n"`. Each complete document has `$HOST`
//! substituted with the remote peer's IP, is parsed, gated on a strictly
//! increasing revision, resolved to a [`Topology`] under the network view
//! chosen on the first config, and published to subscribers.
//!
//! Seed hosts are tried in order; once the list is exhausted the whole sweep
//! is retried with the configured delay and attempt cap. A document that
//! fails to parse is logged and consumed; the stream is not torn down.

use crate::bucket::{BucketConfig, Topology};
use crate::config::ClientConfig;
use crate::error::ConfigError;
use crate::host::HostAndPort;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::retry::{Retry, RetryError};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONFIG_SEPARATOR: &[u8] = b"\n\n\n\n";

pub struct ConfigProvider {
    settings: Arc<ClientConfig>,
    topology_tx: broadcast::Sender<Arc<Topology>>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigProvider {
    pub fn new(settings: Arc<ClientConfig>) -> ConfigProvider {
        let (topology_tx, _) = broadcast::channel(16);
        let (shutdown, _) = watch::channel(false);
        ConfigProvider {
            settings,
            topology_tx,
            lifecycle: Arc::new(Lifecycle::new("config-provider")),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Topology updates, in strictly increasing revision order. Subscribe
    /// before calling [`start`](Self::start) to observe the first config.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Topology>> {
        self.topology_tx.subscribe()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Spawn the provider task. Idempotent while running.
    pub fn start(&self) {
        let mut slot = lock_or_recover(&self.task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let task = Arc::new(ProviderTask {
            settings: self.settings.clone(),
            topology_tx: self.topology_tx.clone(),
            lifecycle: self.lifecycle.clone(),
            shutdown: self.shutdown.subscribe(),
            current_rev: AtomicI64::new(i64::MIN),
            network: Mutex::new(None),
        });
        *slot = Some(tokio::spawn(task.run()));
    }

    /// Stop the provider and wait for its task to wind down.
    pub async fn stop(&self) {
        self.lifecycle.transition(LifecycleState::Disconnecting);
        let _ = self.shutdown.send(true);
        let task = lock_or_recover(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.lifecycle.transition(LifecycleState::Disconnected);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Provider task
// ---------------------------------------------------------------------------

struct ProviderTask {
    settings: Arc<ClientConfig>,
    topology_tx: broadcast::Sender<Arc<Topology>>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Receiver<bool>,
    current_rev: AtomicI64,
    /// Network view, decided once on the first received config. `Some(None)`
    /// is an explicit decision for the primary view.
    network: Mutex<Option<Option<String>>>,
}

impl ProviderTask {
    async fn run(self: Arc<Self>) {
        loop {
            let task = self.clone();
            let result = Retry::any()
                .delay(self.settings.config_reconnect_delay)
                .max(self.settings.config_reconnect_max_attempts)
                .until_stopped(self.shutdown.clone())
                .on_retry(|attempt, cause, delay| {
                    warn!(attempt, %cause, ?delay, "config sweep failed; retrying");
                })
                .run(move || {
                    let task = task.clone();
                    async move { task.sweep().await }
                })
                .await;
            match result {
                // The stream served configs and then dropped: start a fresh
                // sweep with a reset attempt budget.
                Ok(true) => continue,
                Ok(false) | Err(RetryError::Cancelled) => break,
                Err(RetryError::Exhausted(cause)) => {
                    error!(%cause, "config provider gave up after exhausting retries");
                    break;
                }
            }
        }
        self.lifecycle.transition(LifecycleState::Disconnected);
    }

    fn stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Try every seed host once. `Ok(true)` means a stream was established
    /// and served at least one config before ending; `Ok(false)` means the
    /// provider was stopped.
    async fn sweep(&self) -> Result<bool, ConfigError> {
        for host in &self.settings.seed_hosts {
            if self.stopped() {
                return Ok(false);
            }
            match self.stream_from(host).await {
                Ok(served) => {
                    if self.stopped() {
                        return Ok(false);
                    }
                    if served {
                        return Ok(true);
                    }
                    debug!(%host, "config stream ended without serving; trying next seed");
                }
                Err(cause) => {
                    debug!(%host, %cause, "seed host attempt failed");
                }
            }
        }
        Err(ConfigError::NoSeedsLeft)
    }

    async fn stream_from(&self, host: &HostAndPort) -> Result<bool, ConfigError> {
        self.lifecycle.transition(LifecycleState::Connecting);
        let scheme = if self.settings.ssl_enabled { "https" } else { "http" };
        let url = format!(
            "{scheme}://{host}/pools/default/bs/{bucket}",
            bucket = self.settings.bucket
        );
        let http = reqwest::Client::builder()
            .connect_timeout(self.settings.socket_connect_timeout)
            .build()
            .map_err(|e| ConfigError::Http(e.to_string()))?;
        let response = http
            .get(&url)
            .basic_auth(&self.settings.username, Some(&self.settings.password))
            .send()
            .await
            .map_err(|e| ConfigError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ConfigError::Http(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        let peer_ip = response
            .remote_addr()
            .map_or_else(|| host.host().to_owned(), |addr| addr.ip().to_string());
        info!(%host, "config stream established");
        self.lifecycle.transition(LifecycleState::Connected);

        let mut shutdown = self.shutdown.clone();
        let mut served = false;
        let mut scratch = BytesMut::new();
        let mut chunks = response.bytes_stream();
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(served);
                    }
                }
                chunk = chunks.next() => match chunk {
                    None => return Ok(served),
                    Some(Err(cause)) => {
                        if served {
                            debug!(%cause, "config stream dropped");
                            return Ok(true);
                        }
                        return Err(ConfigError::Http(cause.to_string()));
                    }
                    Some(Ok(bytes)) => {
                        scratch.extend_from_slice(&bytes);
                        while let Some(document) = split_document(&mut scratch) {
                            if self.apply_document(&document, &peer_ip) {
                                served = true;
                            }
                        }
                    }
                },
            }
        }
    }

    /// Parse and publish one document; `true` when a topology was emitted.
    fn apply_document(&self, document: &Bytes, peer_ip: &str) -> bool {
        let text = match std::str::from_utf8(document) {
            Ok(text) => text,
            Err(cause) => {
                warn!(%cause, "config document is not utf-8; skipping");
                return false;
            }
        };
        let substituted = substitute_host(text, peer_ip);
        let config = match BucketConfig::parse(&substituted) {
            Ok(config) => config,
            Err(cause) => {
                warn!(%cause, "config document failed to parse; skipping");
                return false;
            }
        };

        let advanced = self
            .current_rev
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (config.rev > current).then_some(config.rev)
            })
            .is_ok();
        if !advanced {
            debug!(rev = config.rev, "dropping stale config revision");
            return false;
        }

        let network = lock_or_recover(&self.network)
            .get_or_insert_with(|| {
                let chosen =
                    config.resolve_network(&self.settings.network, &self.settings.seed_hosts);
                info!(
                    network = chosen.as_deref().unwrap_or("default"),
                    "selected cluster network view"
                );
                chosen
            })
            .clone();
        match config.topology(network.as_deref(), self.settings.ssl_enabled) {
            Ok(topology) => {
                info!(
                    rev = topology.rev(),
                    partitions = topology.num_partitions(),
                    "applying config"
                );
                let _ = self.topology_tx.send(Arc::new(topology));
                true
            }
            Err(cause) => {
                warn!(%cause, "config could not be resolved into a topology");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Document framing helpers
// ---------------------------------------------------------------------------

/// Split the first separator-terminated document off the scratch buffer.
/// Bytes after the separator stay buffered for the next call.
fn split_document(scratch: &mut BytesMut) -> Option<Bytes> {
    let at = scratch
        .windows(CONFIG_SEPARATOR.len())
        .position(|window| window == CONFIG_SEPARATOR)?;
    let document = scratch.split_to(at).freeze();
    scratch.advance(CONFIG_SEPARATOR.len());
    Some(document)
}

/// Unconditional `$HOST` replacement, quoted occurrences included.
fn substitute_host(document: &str, peer_ip: &str) -> String {
    document.replace("$HOST", peer_ip)
}
