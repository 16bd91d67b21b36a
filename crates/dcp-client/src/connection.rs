//! One producer connection to a kv node.
//!
//! # Lifecycle
//! 1. TCP connect (TLS-wrapped when `ssl_enabled`), bounded by
//!    `socket_connect_timeout`
//! 2. `SASL_AUTH PLAIN` with the configured credentials
//! 3. `DCP_OPEN` announcing the producer connection name
//! 4. `DCP_CONTROL connection_buffer_size` advertising the flow-control
//!    buffer
//!
//! A writer task drains the outbound queue; a reader task frames the inbound
//! byte stream and routes every frame exactly once: responses to the
//! dispatcher, everything else to the demultiplexer. All state updates for
//! frames of this connection happen on the reader task.

use crate::conductor::ConductorMsg;
use crate::config::ClientConfig;
use crate::demux::Demux;
use crate::dispatcher::{Completion, Dispatcher};
use crate::error::DcpError;
use crate::events::DcpEvent;
use crate::flow::AckTracker;
use crate::host::HostAndPort;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::partitions::PartitionStateTable;
use bytes::{Bytes, BytesMut};
use dcp_wire::frame::{HEADER_SIZE, Magic, opcode};
use dcp_wire::{DcpFrame, RequestBuilder};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Shared wiring every connection hooks into.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub settings: Arc<ClientConfig>,
    pub table: Arc<PartitionStateTable>,
    pub events: broadcast::Sender<DcpEvent>,
    pub conductor: mpsc::UnboundedSender<ConductorMsg>,
}

pub(crate) struct NodeConnection {
    host: HostAndPort,
    dispatcher: Arc<Dispatcher>,
    lifecycle: Arc<Lifecycle>,
    shutdown: watch::Sender<bool>,
}

impl NodeConnection {
    pub async fn open(
        host: HostAndPort,
        ctx: &ConnectionContext,
    ) -> Result<NodeConnection, DcpError> {
        let settings = &ctx.settings;
        let lifecycle = Arc::new(Lifecycle::new("node-connection"));
        lifecycle.transition(LifecycleState::Connecting);

        let stream = connect_transport(&host, settings).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Bytes>();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let ack = Arc::new(AckTracker::new(
            settings.flow_control_buffer,
            settings.flow_control_ack_threshold,
            out_tx.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(out_tx));
        let demux = Arc::new(Demux::new(
            ctx.table.clone(),
            ctx.events.clone(),
            ack,
            settings.flow_control_mode,
        ));

        tokio::spawn(write_loop(write_half, out_rx, shutdown.subscribe()));
        tokio::spawn(read_loop(
            read_half,
            dispatcher.clone(),
            demux,
            shutdown_rx,
            ctx.conductor.clone(),
            host.clone(),
            lifecycle.clone(),
        ));

        let connection = NodeConnection {
            host,
            dispatcher,
            lifecycle,
            shutdown,
        };
        if let Err(cause) = connection.handshake(settings).await {
            connection.close();
            return Err(cause);
        }
        connection.lifecycle.transition(LifecycleState::Connected);
        info!(host = %connection.host, "node connection established");
        Ok(connection)
    }

    async fn handshake(&self, settings: &ClientConfig) -> Result<(), DcpError> {
        self.dispatcher
            .send_request(RequestBuilder::sasl_auth_plain(
                &settings.username,
                &settings.password,
            ))
            .await?;
        self.dispatcher
            .send_request(RequestBuilder::open_connection(&settings.connection_name))
            .await?;
        self.dispatcher
            .send_request(RequestBuilder::control(
                "connection_buffer_size",
                &settings.flow_control_buffer.to_string(),
            ))
            .await?;
        Ok(())
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Graceful teardown; the reader reports the close back to the conductor.
    pub fn close(&self) {
        self.lifecycle.transition(LifecycleState::Disconnecting);
        let _ = self.shutdown.send(true);
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

async fn connect_transport(
    host: &HostAndPort,
    settings: &ClientConfig,
) -> Result<Box<dyn AsyncStream>, DcpError> {
    let connect = TcpStream::connect((host.host(), host.port()));
    let tcp = timeout(settings.socket_connect_timeout, connect)
        .await
        .map_err(|_| DcpError::Timeout)??;
    tcp.set_nodelay(true)?;
    if !settings.ssl_enabled {
        return Ok(Box::new(tcp));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = rustls::pki_types::ServerName::try_from(host.host().to_owned())
        .map_err(|cause| io::Error::new(io::ErrorKind::InvalidInput, cause))?;
    let connector = TlsConnector::from(Arc::new(tls));
    let stream = connector.connect(server_name, tcp).await?;
    Ok(Box::new(stream))
}

// ---------------------------------------------------------------------------
// I/O tasks
// ---------------------------------------------------------------------------

async fn write_loop(
    mut writer: WriteHalf<Box<dyn AsyncStream>>,
    mut out_rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = out_rx.recv() => match frame {
                None => break,
                Some(frame) => {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: ReadHalf<Box<dyn AsyncStream>>,
    dispatcher: Arc<Dispatcher>,
    demux: Arc<Demux>,
    mut shutdown: watch::Receiver<bool>,
    conductor: mpsc::UnboundedSender<ConductorMsg>,
    host: HostAndPort,
    lifecycle: Arc<Lifecycle>,
) {
    let mut graceful = false;
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    graceful = true;
                    break;
                }
            }
            raw = read_frame(&mut reader) => match raw {
                Ok(raw) => match DcpFrame::parse(raw) {
                    Ok(frame) => route_frame(&dispatcher, &demux, frame).await,
                    Err(cause) => {
                        // Framing stayed aligned (the length prefix was
                        // honored); drop the frame and report it.
                        warn!(host = %host, %cause, "dropping malformed frame");
                        demux.failure(-1, &cause.to_string());
                    }
                },
                Err(cause) => {
                    if cause.kind() != io::ErrorKind::UnexpectedEof {
                        warn!(host = %host, %cause, "connection read failed");
                    }
                    break;
                }
            },
        }
    }
    lifecycle.transition(LifecycleState::Disconnected);
    dispatcher.fail_all().await;
    let _ = conductor.send(ConductorMsg::ConnectionDown { host, graceful });
}

/// Route one frame exactly once: responses claim their pending request (with
/// connection-local table updates applied before the requester can observe
/// the response), everything else goes to the demultiplexer.
async fn route_frame(dispatcher: &Dispatcher, demux: &Demux, frame: DcpFrame) {
    if frame.magic() != Magic::Response {
        demux.handle(frame);
        return;
    }
    match dispatcher.complete(frame).await {
        Completion::Unclaimed(frame) => demux.handle(frame),
        Completion::Delivered {
            opcode: op,
            vbucket,
            frame,
        } => {
            if !frame.status().is_success() {
                return;
            }
            match op {
                opcode::DCP_STREAM_REQ => {
                    match frame.failover_log() {
                        Ok(entries) => demux.apply_failover_log(vbucket, &entries),
                        Err(cause) => {
                            debug!(vbucket, %cause, "stream-open response without failover log")
                        }
                    }
                    demux.stream_opened(vbucket);
                }
                opcode::DCP_FAILOVER_LOG => match frame.failover_log() {
                    Ok(entries) => demux.apply_failover_log(vbucket, &entries),
                    Err(cause) => {
                        warn!(vbucket, %cause, "unreadable failover log response");
                        demux.failure(i32::from(vbucket), &cause.to_string());
                    }
                },
                _ => {}
            }
        }
    }
}

/// Read exactly one length-prefixed frame off the wire.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Bytes> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let body_len =
        u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&header);
    buf.resize(HEADER_SIZE + body_len, 0);
    reader.read_exact(&mut buf[HEADER_SIZE..]).await?;
    Ok(buf.freeze())
}
