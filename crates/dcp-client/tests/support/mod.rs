//! Shared fakes for the integration suite: a scripted kv node speaking the
//! binary protocol and a minimal streaming-config HTTP endpoint.
#![allow(dead_code)]

use bytes::Bytes;
use dcp_client::wire::frame::{DcpFrame, HEADER_SIZE, Magic, opcode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Route test logs through `RUST_LOG` when debugging a failure.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---------------------------------------------------------------------------
// Frame plumbing
// ---------------------------------------------------------------------------

/// Read one length-prefixed frame off the socket.
pub async fn read_frame(stream: &mut TcpStream) -> DcpFrame {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.expect("frame header");
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let mut buf = vec![0u8; HEADER_SIZE + body_len];
    buf[..HEADER_SIZE].copy_from_slice(&header);
    stream
        .read_exact(&mut buf[HEADER_SIZE..])
        .await
        .expect("frame body");
    DcpFrame::parse(Bytes::from(buf)).expect("well-formed frame")
}

/// Wait until the peer closes the connection.
pub async fn wait_for_close(stream: &mut TcpStream) {
    let mut sink = [0u8; 256];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

pub fn response(op: u8, status: u16, opaque: u32, extras: &[u8], value: &[u8]) -> Vec<u8> {
    let body_len = extras.len() + value.len();
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.push(Magic::RESPONSE);
    buf.push(op);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.push(extras.len() as u8);
    buf.push(0);
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(value);
    buf
}

pub fn server_request(
    op: u8,
    vbucket: u16,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
    cas: u64,
) -> Vec<u8> {
    let body_len = extras.len() + key.len() + value.len();
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.push(Magic::REQUEST);
    buf.push(op);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.push(extras.len() as u8);
    buf.push(0);
    buf.extend_from_slice(&vbucket.to_be_bytes());
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());
    buf.extend_from_slice(&cas.to_be_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

pub fn snapshot_marker(vbucket: u16, start: u64, end: u64) -> Vec<u8> {
    let mut extras = Vec::with_capacity(20);
    extras.extend_from_slice(&start.to_be_bytes());
    extras.extend_from_slice(&end.to_be_bytes());
    extras.extend_from_slice(&0u32.to_be_bytes());
    server_request(opcode::DCP_SNAPSHOT_MARKER, vbucket, &extras, b"", b"", 0)
}

pub fn mutation(vbucket: u16, seqno: u64, key: &[u8], value: &[u8], cas: u64) -> Vec<u8> {
    let mut extras = Vec::with_capacity(31);
    extras.extend_from_slice(&seqno.to_be_bytes());
    extras.extend_from_slice(&1u64.to_be_bytes());
    extras.extend_from_slice(&[0u8; 15]);
    server_request(opcode::DCP_MUTATION, vbucket, &extras, key, value, cas)
}

pub fn failover_log_value(entries: &[(u64, u64)]) -> Vec<u8> {
    let mut value = Vec::with_capacity(entries.len() * 16);
    for (uuid, seqno) in entries {
        value.extend_from_slice(&uuid.to_be_bytes());
        value.extend_from_slice(&seqno.to_be_bytes());
    }
    value
}

/// Answer the SASL/open/control handshake with success responses.
pub async fn serve_handshake(stream: &mut TcpStream) {
    for _ in 0..3 {
        let frame = read_frame(stream).await;
        assert!(
            matches!(
                frame.opcode(),
                opcode::SASL_AUTH | opcode::DCP_OPEN | opcode::DCP_CONTROL
            ),
            "unexpected handshake opcode 0x{:02x}",
            frame.opcode()
        );
        stream
            .write_all(&response(frame.opcode(), 0, frame.opaque(), &[], b""))
            .await
            .expect("handshake response");
    }
}

// ---------------------------------------------------------------------------
// Config endpoint
// ---------------------------------------------------------------------------

/// One single-node config document with every partition owned by node 0.
pub fn config_json(rev: i64, kv_port: u16, partitions: usize) -> String {
    let entries = (0..partitions).map(|_| "[0]").collect::<Vec<_>>().join(",");
    format!(
        r#"{{"rev":{rev},"nodesExt":[{{"hostname":"$HOST","services":{{"kv":{kv_port},"mgmt":8091}}}}],"vBucketServerMap":{{"vBucketMap":[{entries}]}}}}"#
    )
}

/// Streaming-config endpoint that serves the given documents to every
/// connection and then holds the stream open.
pub async fn config_endpoint(documents: Vec<String>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind config endpoint");
    let port = listener.local_addr().expect("local addr").port();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let documents = documents.clone();
            tokio::spawn(async move {
                let mut head = [0u8; 1024];
                let _ = stream.read(&mut head).await;
                let mut body = String::new();
                for document in &documents {
                    body.push_str(document);
                    body.push_str("\n\n\n\n");
                }
                let _ = stream
                    .write_all(
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{body}"
                        )
                        .as_bytes(),
                    )
                    .await;
                // Keep the stream open; the real endpoint never terminates.
                wait_for_close(&mut stream).await;
            });
        }
    });
    (port, task)
}
