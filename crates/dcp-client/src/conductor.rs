//! Stream conductor.
//!
//! Owns the per-node connections and drives every partition stream through
//! its lifecycle: open requests, rollback handling, re-opens after
//! connection loss, and reassignment when a topology update moves partitions
//! between nodes. The conductor is one cooperative task; everything reaches
//! it as a message or a topology update, so stream lifecycle decisions are
//! serialized.

use crate::bucket::Topology;
use crate::connection::{ConnectionContext, NodeConnection};
use crate::dispatcher::Dispatcher;
use crate::error::DcpError;
use crate::events::{DcpEvent, RollbackAction};
use crate::host::HostAndPort;
use crate::partitions::StreamState;
use crate::retry::{Retry, RetryError};
use arc_swap::ArcSwapOption;
use dcp_wire::types::{FailoverLogEntry, ObservedSeqno, SnapshotMarker, StreamOffset};
use dcp_wire::RequestBuilder;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Everything the conductor reacts to.
#[derive(Debug)]
pub(crate) enum ConductorMsg {
    StartStream {
        vbucket: u16,
        offset: StreamOffset,
    },
    /// Re-open at the server's rollback point.
    ResumeRollback {
        vbucket: u16,
        seqno: u64,
    },
    /// Every clone of a rollback action dropped without a decision, or the
    /// post-rollback grace period expired.
    RollbackUnhandled {
        vbucket: u16,
    },
    /// A listener accepted the rollback without re-opening.
    RollbackDismissed {
        vbucket: u16,
    },
    OpenFailed {
        vbucket: u16,
        failure: OpenFailure,
    },
    ConnectionDown {
        host: HostAndPort,
        graceful: bool,
    },
    FailoverLog {
        vbucket: u16,
        reply: oneshot::Sender<Result<Vec<FailoverLogEntry>, DcpError>>,
    },
    ObserveSeqno {
        vbucket: u16,
        vbuuid: u64,
        reply: oneshot::Sender<Result<ObservedSeqno, DcpError>>,
    },
}

/// How a stream-open request failed.
#[derive(Debug)]
pub(crate) enum OpenFailure {
    Rollback(u64),
    NotMyVbucket,
    ConnectionClosed,
    Other(String),
}

pub(crate) struct Conductor {
    ctx: ConnectionContext,
    msg_rx: mpsc::UnboundedReceiver<ConductorMsg>,
    topology_rx: broadcast::Receiver<Arc<Topology>>,
    topology_closed: bool,
    shutdown: watch::Receiver<bool>,
    /// Topology handle shared with the client for read-only queries.
    shared_topology: Arc<ArcSwapOption<Topology>>,
    topology: Option<Arc<Topology>>,
    connections: HashMap<HostAndPort, NodeConnection>,
    /// Streams parked until a topology names an owner for them, with the
    /// offset to open at.
    parked: HashMap<u16, StreamOffset>,
    /// Partitions with an outstanding rollback decision.
    rollback_pending: HashSet<u16>,
}

impl Conductor {
    pub fn new(
        ctx: ConnectionContext,
        msg_rx: mpsc::UnboundedReceiver<ConductorMsg>,
        topology_rx: broadcast::Receiver<Arc<Topology>>,
        shutdown: watch::Receiver<bool>,
        shared_topology: Arc<ArcSwapOption<Topology>>,
    ) -> Conductor {
        Conductor {
            ctx,
            msg_rx,
            topology_rx,
            topology_closed: false,
            shutdown,
            shared_topology,
            topology: None,
            connections: HashMap::new(),
            parked: HashMap::new(),
            rollback_pending: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                topology = self.topology_rx.recv(), if !self.topology_closed => match topology {
                    Ok(topology) => self.apply_topology(topology).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "conductor lagged behind topology updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.topology_closed = true;
                    }
                },
                msg = self.msg_rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }
        self.teardown();
    }

    // -----------------------------------------------------------------------
    // Topology handling
    // -----------------------------------------------------------------------

    async fn apply_topology(&mut self, topology: Arc<Topology>) {
        let previous = self.topology.replace(topology.clone());
        self.shared_topology.store(Some(topology.clone()));
        info!(rev = topology.rev(), partitions = topology.num_partitions(), "topology applied");

        // Partitions whose owner moved are parked and re-opened at their
        // current offset on the new node.
        for vbucket in 0..topology.num_partitions() as u16 {
            let state = self.ctx.table.state(vbucket);
            if !matches!(state, StreamState::Streaming | StreamState::Opening) {
                continue;
            }
            let old_owner = previous.as_ref().and_then(|t| t.partition_owner(vbucket));
            if old_owner != topology.partition_owner(vbucket) {
                self.ctx.table.set_state(vbucket, StreamState::Idle);
                self.parked
                    .entry(vbucket)
                    .or_insert_with(|| self.ctx.table.offset(vbucket));
            }
        }

        // Nodes that no longer own anything lose their connection.
        let owners: HashSet<HostAndPort> = topology.owning_nodes().into_iter().collect();
        let departed: Vec<HostAndPort> = self
            .connections
            .keys()
            .filter(|host| !owners.contains(host))
            .cloned()
            .collect();
        for host in departed {
            if let Some(connection) = self.connections.remove(&host) {
                info!(%host, "closing connection to departed node");
                connection.close();
            }
        }

        let mut reopen: Vec<(u16, StreamOffset)> = self.parked.drain().collect();
        reopen.sort_unstable_by_key(|(vbucket, _)| *vbucket);
        for (vbucket, offset) in reopen {
            self.start_stream(vbucket, offset).await;
        }
    }

    // -----------------------------------------------------------------------
    // Message handling
    // -----------------------------------------------------------------------

    async fn handle(&mut self, msg: ConductorMsg) {
        match msg {
            ConductorMsg::StartStream { vbucket, offset } => {
                self.start_stream(vbucket, offset).await;
            }
            ConductorMsg::ResumeRollback { vbucket, seqno } => {
                let offset = StreamOffset::new(
                    self.ctx.table.uuid(vbucket),
                    seqno,
                    SnapshotMarker::new(seqno, seqno, 0),
                );
                self.start_stream(vbucket, offset).await;
            }
            ConductorMsg::RollbackUnhandled { vbucket } => {
                // The default rollback handler: nobody decided, so the
                // partition fails.
                if self.rollback_pending.remove(&vbucket) {
                    self.ctx.table.set_state(vbucket, StreamState::Failed);
                    self.failure(i32::from(vbucket), "rollback left unhandled");
                }
            }
            ConductorMsg::RollbackDismissed { vbucket } => {
                self.rollback_pending.remove(&vbucket);
            }
            ConductorMsg::OpenFailed { vbucket, failure } => {
                self.open_failed(vbucket, failure).await;
            }
            ConductorMsg::ConnectionDown { host, graceful } => {
                self.connection_down(host, graceful).await;
            }
            ConductorMsg::FailoverLog { vbucket, reply } => {
                match self.dispatcher_for(vbucket).await {
                    Err(cause) => {
                        let _ = reply.send(Err(cause));
                    }
                    Ok(dispatcher) => {
                        tokio::spawn(async move {
                            let result = dispatcher
                                .send_request(RequestBuilder::failover_log(vbucket))
                                .await
                                .and_then(|frame| {
                                    frame.failover_log().map_err(DcpError::from)
                                });
                            let _ = reply.send(result);
                        });
                    }
                }
            }
            ConductorMsg::ObserveSeqno {
                vbucket,
                vbuuid,
                reply,
            } => match self.dispatcher_for(vbucket).await {
                Err(cause) => {
                    let _ = reply.send(Err(cause));
                }
                Ok(dispatcher) => {
                    tokio::spawn(async move {
                        let result = dispatcher
                            .send_request(RequestBuilder::observe_seqno(vbucket, vbuuid))
                            .await
                            .and_then(|frame| frame.observed_seqno().map_err(DcpError::from));
                        let _ = reply.send(result);
                    });
                }
            },
        }
    }

    async fn start_stream(&mut self, vbucket: u16, offset: StreamOffset) {
        self.rollback_pending.remove(&vbucket);
        match self.ctx.table.state(vbucket) {
            StreamState::Opening | StreamState::Streaming => {
                debug!(vbucket, "stream already active");
                return;
            }
            _ => {}
        }
        let Some(topology) = self.topology.as_ref() else {
            // No config has landed yet; open once one does.
            debug!(vbucket, "no topology yet; parking stream request");
            self.parked.insert(vbucket, offset);
            return;
        };
        let Some(owner) = topology.partition_owner(vbucket).cloned() else {
            self.ctx.table.set_state(vbucket, StreamState::Failed);
            self.failure(i32::from(vbucket), "partition has no owning node");
            return;
        };
        let dispatcher = match self.ensure_connection(&owner).await {
            Ok(dispatcher) => dispatcher,
            Err(DcpError::Stopped) => return,
            Err(cause) => {
                self.ctx.table.set_state(vbucket, StreamState::Failed);
                self.failure(i32::from(vbucket), &cause.to_string());
                return;
            }
        };
        self.ctx.table.set_state(vbucket, StreamState::Opening);
        debug!(vbucket, seqno = offset.seqno, "opening stream");
        let conductor = self.ctx.conductor.clone();
        tokio::spawn(open_stream(dispatcher, vbucket, offset, conductor));
    }

    async fn open_failed(&mut self, vbucket: u16, failure: OpenFailure) {
        match failure {
            OpenFailure::Rollback(seqno) => {
                self.ctx.table.set_state(vbucket, StreamState::Idle);
                self.rollback_pending.insert(vbucket);
                let action = RollbackAction::new(vbucket, seqno, self.ctx.conductor.clone());
                info!(vbucket, seqno, "server demanded rollback");
                let _ = self.ctx.events.send(DcpEvent::Rollback {
                    vbucket,
                    seqno,
                    action,
                });
                // A listener that does nothing within the grace period falls
                // through to the default failure path.
                let conductor = self.ctx.conductor.clone();
                let grace = self.ctx.settings.stream_reconnect_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = conductor.send(ConductorMsg::RollbackUnhandled { vbucket });
                });
            }
            OpenFailure::NotMyVbucket => {
                debug!(vbucket, "open refused: not my vbucket; awaiting reassignment");
                self.ctx.table.set_state(vbucket, StreamState::Idle);
                let offset = self.ctx.table.offset(vbucket);
                self.parked.insert(vbucket, offset);
            }
            OpenFailure::ConnectionClosed => {
                if self
                    .ctx
                    .table
                    .transition(vbucket, StreamState::Opening, StreamState::Idle)
                {
                    let offset = self.ctx.table.offset(vbucket);
                    self.start_stream(vbucket, offset).await;
                }
            }
            OpenFailure::Other(detail) => {
                self.ctx.table.set_state(vbucket, StreamState::Failed);
                self.failure(i32::from(vbucket), &detail);
            }
        }
    }

    async fn connection_down(&mut self, host: HostAndPort, graceful: bool) {
        self.connections.remove(&host);
        if graceful {
            return;
        }
        self.failure(-1, &format!("connection to {host} lost"));
        let Some(topology) = self.topology.clone() else {
            return;
        };
        for vbucket in 0..topology.num_partitions() as u16 {
            if topology.partition_owner(vbucket) != Some(&host) {
                continue;
            }
            if self
                .ctx
                .table
                .transition(vbucket, StreamState::Streaming, StreamState::Idle)
            {
                let offset = self.ctx.table.offset(vbucket);
                self.start_stream(vbucket, offset).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    async fn ensure_connection(&mut self, host: &HostAndPort) -> Result<Arc<Dispatcher>, DcpError> {
        if let Some(connection) = self.connections.get(host) {
            return Ok(connection.dispatcher());
        }
        let settings = &self.ctx.settings;
        let ctx = self.ctx.clone();
        let target = host.clone();
        let result = Retry::any()
            .delay(settings.stream_reconnect_delay)
            .max(settings.stream_reconnect_max_attempts)
            .until_stopped(self.shutdown.clone())
            .on_retry(move |attempt, cause, delay| {
                warn!(attempt, %cause, ?delay, "node connection attempt failed; retrying");
            })
            .run(move || {
                let ctx = ctx.clone();
                let host = target.clone();
                async move { NodeConnection::open(host, &ctx).await }
            })
            .await;
        match result {
            Ok(connection) => {
                let dispatcher = connection.dispatcher();
                self.connections.insert(host.clone(), connection);
                Ok(dispatcher)
            }
            Err(RetryError::Cancelled) => Err(DcpError::Stopped),
            Err(RetryError::Exhausted(cause)) => Err(cause),
        }
    }

    async fn dispatcher_for(&mut self, vbucket: u16) -> Result<Arc<Dispatcher>, DcpError> {
        let owner = self
            .topology
            .as_ref()
            .and_then(|topology| topology.partition_owner(vbucket))
            .cloned()
            .ok_or(DcpError::NoOwner(vbucket))?;
        self.ensure_connection(&owner).await
    }

    fn failure(&self, vbucket: i32, detail: &str) {
        let _ = self.ctx.events.send(DcpEvent::StreamFailure {
            vbucket,
            detail: detail.to_owned(),
        });
    }

    fn teardown(mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
    }
}

/// One stream-open request. Success is fully handled on the connection's
/// reader task (failover-log application and the state flip to streaming);
/// failures are classified and reported back to the conductor.
async fn open_stream(
    dispatcher: Arc<Dispatcher>,
    vbucket: u16,
    offset: StreamOffset,
    conductor: mpsc::UnboundedSender<ConductorMsg>,
) {
    let request = RequestBuilder::stream_request(vbucket, offset, u64::MAX);
    let failure = match dispatcher.send_request(request).await {
        Ok(_) => {
            debug!(vbucket, "stream opened");
            return;
        }
        Err(DcpError::BadResponseStatus { status, frame }) if status.is_rollback() => {
            OpenFailure::Rollback(frame.rollback_seqno().unwrap_or(0))
        }
        Err(DcpError::BadResponseStatus { status, .. }) if status.is_not_my_vbucket() => {
            OpenFailure::NotMyVbucket
        }
        Err(DcpError::ConnectionClosed) => OpenFailure::ConnectionClosed,
        Err(cause) => OpenFailure::Other(cause.to_string()),
    };
    let _ = conductor.send(ConductorMsg::OpenFailed { vbucket, failure });
}
