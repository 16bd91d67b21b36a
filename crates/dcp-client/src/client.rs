//! Top-level client: wires the config provider, the conductor, and the event
//! channel together.

use crate::bucket::Topology;
use crate::conductor::{Conductor, ConductorMsg};
use crate::config::ClientConfig;
use crate::connection::ConnectionContext;
use crate::error::{ConfigError, DcpError};
use crate::events::DcpEvent;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::partitions::{PartitionStateTable, StreamState};
use crate::provider::ConfigProvider;
use arc_swap::ArcSwapOption;
use dcp_wire::types::{FailoverLogEntry, ObservedSeqno, StreamOffset};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

pub struct Client {
    settings: Arc<ClientConfig>,
    table: Arc<PartitionStateTable>,
    events: broadcast::Sender<DcpEvent>,
    provider: ConfigProvider,
    conductor_tx: mpsc::UnboundedSender<ConductorMsg>,
    conductor_rx: Mutex<Option<mpsc::UnboundedReceiver<ConductorMsg>>>,
    conductor_task: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Sender<bool>,
    topology: Arc<ArcSwapOption<Topology>>,
}

impl Client {
    pub fn new(settings: ClientConfig) -> Client {
        let settings = Arc::new(settings);
        let (events, _) = broadcast::channel(1024);
        let (conductor_tx, conductor_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let provider = ConfigProvider::new(settings.clone());
        Client {
            settings,
            table: Arc::new(PartitionStateTable::new()),
            events,
            provider,
            conductor_tx,
            conductor_rx: Mutex::new(Some(conductor_rx)),
            conductor_task: Mutex::new(None),
            lifecycle: Arc::new(Lifecycle::new("client")),
            shutdown,
            topology: Arc::new(ArcSwapOption::const_empty()),
        }
    }

    /// Start the config provider and the conductor, then wait for the first
    /// topology to land.
    pub async fn connect(&self) -> Result<(), DcpError> {
        self.lifecycle.transition(LifecycleState::Connecting);
        let mut first_config = self.provider.subscribe();
        let conductor_configs = self.provider.subscribe();

        if let Some(msg_rx) = lock_slot(&self.conductor_rx).take() {
            let ctx = ConnectionContext {
                settings: self.settings.clone(),
                table: self.table.clone(),
                events: self.events.clone(),
                conductor: self.conductor_tx.clone(),
            };
            let conductor = Conductor::new(
                ctx,
                msg_rx,
                conductor_configs,
                self.shutdown.subscribe(),
                self.topology.clone(),
            );
            *lock_slot(&self.conductor_task) = Some(tokio::spawn(conductor.run()));
        }
        self.provider.start();

        let mut provider_state = self.provider.lifecycle().subscribe();
        loop {
            tokio::select! {
                config = first_config.recv() => match config {
                    // Lagged still proves configs are flowing.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        self.lifecycle.transition(LifecycleState::Disconnected);
                        return Err(ConfigError::NoSeedsLeft.into());
                    }
                },
                changed = provider_state.changed() => {
                    if changed.is_err() || *provider_state.borrow() == LifecycleState::Disconnected {
                        self.lifecycle.transition(LifecycleState::Disconnected);
                        return Err(ConfigError::NoSeedsLeft.into());
                    }
                }
            }
        }
        self.lifecycle.transition(LifecycleState::Connected);
        Ok(())
    }

    /// Subscribe to the change-event stream.
    pub fn events(&self) -> broadcast::Receiver<DcpEvent> {
        self.events.subscribe()
    }

    /// The event stream as a `futures` stream.
    pub fn event_stream(&self) -> BroadcastStream<DcpEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Partition count of the current topology, when one has arrived.
    pub fn num_partitions(&self) -> Option<usize> {
        self.topology.load_full().map(|t| t.num_partitions())
    }

    /// Begin streaming the given partitions from their last known offsets
    /// (the zero offset for partitions never streamed before).
    pub fn start_streaming(&self, partitions: impl IntoIterator<Item = u16>) {
        for vbucket in partitions {
            self.stream_partition(vbucket, self.table.offset(vbucket));
        }
    }

    /// Begin streaming one partition from an explicit offset, e.g. one
    /// restored by the application's checkpoint store.
    pub fn stream_partition(&self, vbucket: u16, offset: StreamOffset) {
        let _ = self
            .conductor_tx
            .send(ConductorMsg::StartStream { vbucket, offset });
    }

    /// The current resumable offset of a partition; this is what a
    /// checkpointing listener persists.
    pub fn offset(&self, vbucket: u16) -> StreamOffset {
        self.table.offset(vbucket)
    }

    pub fn stream_state(&self, vbucket: u16) -> StreamState {
        self.table.state(vbucket)
    }

    /// Fetch the failover log of a partition from its owning node.
    pub async fn failover_log(&self, vbucket: u16) -> Result<Vec<FailoverLogEntry>, DcpError> {
        let (reply, rx) = oneshot::channel();
        self.conductor_tx
            .send(ConductorMsg::FailoverLog { vbucket, reply })
            .map_err(|_| DcpError::Stopped)?;
        rx.await.map_err(|_| DcpError::Stopped)?
    }

    /// Observe the persistence state of a partition under a branch uuid.
    pub async fn observe_seqno(&self, vbucket: u16, vbuuid: u64) -> Result<ObservedSeqno, DcpError> {
        let (reply, rx) = oneshot::channel();
        self.conductor_tx
            .send(ConductorMsg::ObserveSeqno {
                vbucket,
                vbuuid,
                reply,
            })
            .map_err(|_| DcpError::Stopped)?;
        rx.await.map_err(|_| DcpError::Stopped)?
    }

    /// Stop everything: the provider, the conductor, every node connection.
    /// In-flight request futures complete with `ConnectionClosed`.
    pub async fn stop(&self) {
        self.lifecycle.transition(LifecycleState::Disconnecting);
        self.provider.stop().await;
        let _ = self.shutdown.send(true);
        let task = lock_slot(&self.conductor_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.lifecycle.transition(LifecycleState::Disconnected);
    }
}

fn lock_slot<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
