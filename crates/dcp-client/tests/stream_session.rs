//! End-to-end stream sessions against a scripted kv node.

mod support;

use dcp_client::wire::frame::opcode;
use dcp_client::wire::types::{SnapshotMarker, StreamOffset};
use dcp_client::{Client, ClientConfig, DcpEvent, FlowControlMode, HostAndPort};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

async fn recv_event(events: &mut tokio::sync::broadcast::Receiver<DcpEvent>) -> DcpEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

fn client_config(config_port: u16) -> ClientConfig {
    ClientConfig::new(
        vec![HostAndPort::new("127.0.0.1", config_port)],
        "bucket",
        "user",
        "pass",
    )
    .with_flow_control(FlowControlMode::Automatic, 1024, 0.5)
    .with_config_reconnect(Duration::from_millis(50), 3)
    .with_stream_reconnect(Duration::from_millis(50), 2)
}

#[tokio::test]
async fn snapshot_and_mutations_arrive_in_order_with_stamped_offsets() {
    support::init_tracing();
    let kv = TcpListener::bind("127.0.0.1:0").await.expect("bind kv");
    let kv_port = kv.local_addr().expect("local addr").port();

    let node = tokio::spawn(async move {
        let (mut stream, _) = kv.accept().await.expect("accept");
        support::serve_handshake(&mut stream).await;

        let open = support::read_frame(&mut stream).await;
        assert_eq!(open.opcode(), opcode::DCP_STREAM_REQ);
        assert_eq!(open.vbucket(), 7);
        let log = support::failover_log_value(&[(0xFEED, 0)]);
        stream
            .write_all(&support::response(
                opcode::DCP_STREAM_REQ,
                0,
                open.opaque(),
                &[],
                &log,
            ))
            .await
            .expect("stream-open response");

        let snapshot = support::snapshot_marker(7, 100, 200);
        let small = support::mutation(7, 150, b"a", b"v", 99);
        let large = support::mutation(7, 151, b"b", &[0x77; 600], 100);
        let total = (snapshot.len() + small.len() + large.len()) as u32;
        stream.write_all(&snapshot).await.expect("snapshot");
        stream.write_all(&small).await.expect("small mutation");
        stream.write_all(&large).await.expect("large mutation");

        // The large mutation pushes the acknowledged bytes past half the
        // 1024-byte buffer: exactly one buffer ack, carrying everything.
        let ack = support::read_frame(&mut stream).await;
        assert_eq!(ack.opcode(), opcode::DCP_BUFFER_ACK);
        assert_eq!(&ack.extras()[..4], &total.to_be_bytes());

        let observe = support::read_frame(&mut stream).await;
        assert_eq!(observe.opcode(), opcode::OBSERVE_SEQNO);
        assert_eq!(observe.vbucket(), 7);
        assert_eq!(&observe.value()[..], &0xFEEDu64.to_be_bytes());
        let mut state = Vec::new();
        state.push(0); // format
        state.extend_from_slice(&7u16.to_be_bytes());
        state.extend_from_slice(&0xFEEDu64.to_be_bytes());
        state.extend_from_slice(&151u64.to_be_bytes()); // persisted
        state.extend_from_slice(&151u64.to_be_bytes()); // current
        stream
            .write_all(&support::response(
                opcode::OBSERVE_SEQNO,
                0,
                observe.opaque(),
                &[],
                &state,
            ))
            .await
            .expect("observe response");

        support::wait_for_close(&mut stream).await;
    });

    let (config_port, endpoint) =
        support::config_endpoint(vec![support::config_json(1, kv_port, 8)]).await;
    let client = Client::new(client_config(config_port));
    let mut events = client.events();
    timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect in time")
        .expect("connect");
    assert_eq!(client.num_partitions(), Some(8));

    client.start_streaming([7]);

    match recv_event(&mut events).await {
        DcpEvent::FailoverLog { vbucket, entries } => {
            assert_eq!(vbucket, 7);
            assert_eq!(entries[0].uuid, 0xFEED);
        }
        other => panic!("expected FailoverLog, got: {other:?}"),
    }
    match recv_event(&mut events).await {
        DcpEvent::SnapshotDetails { vbucket, marker } => {
            assert_eq!(vbucket, 7);
            assert_eq!(marker, SnapshotMarker::new(100, 200, 0));
        }
        other => panic!("expected SnapshotDetails, got: {other:?}"),
    }
    match recv_event(&mut events).await {
        DcpEvent::Mutation {
            vbucket,
            offset,
            key,
            value,
            cas,
            ..
        } => {
            assert_eq!(vbucket, 7);
            assert_eq!(offset.vbuuid, 0xFEED);
            assert_eq!(offset.seqno, 150);
            assert_eq!(offset.snapshot, SnapshotMarker::new(100, 200, 0));
            assert_eq!(&key[..], b"a");
            assert_eq!(&value[..], b"v");
            assert_eq!(cas, 99);
        }
        other => panic!("expected Mutation, got: {other:?}"),
    }
    match recv_event(&mut events).await {
        DcpEvent::Mutation { offset, .. } => assert_eq!(offset.seqno, 151),
        other => panic!("expected second Mutation, got: {other:?}"),
    }

    // The client's resumable offset tracks the last delivered seqno.
    assert_eq!(client.offset(7).seqno, 151);

    let observed = timeout(Duration::from_secs(5), client.observe_seqno(7, 0xFEED))
        .await
        .expect("observe in time")
        .expect("observe response");
    assert_eq!(observed.vbuuid, 0xFEED);
    assert_eq!(observed.current_seqno, 151);

    client.stop().await;
    timeout(Duration::from_secs(5), node)
        .await
        .expect("node assertions in time")
        .expect("node task");
    endpoint.abort();
}

#[tokio::test]
async fn unhandled_rollback_surfaces_a_stream_failure() {
    support::init_tracing();
    let kv = TcpListener::bind("127.0.0.1:0").await.expect("bind kv");
    let kv_port = kv.local_addr().expect("local addr").port();

    let node = tokio::spawn(async move {
        let (mut stream, _) = kv.accept().await.expect("accept");
        support::serve_handshake(&mut stream).await;

        let open = support::read_frame(&mut stream).await;
        assert_eq!(open.opcode(), opcode::DCP_STREAM_REQ);
        assert_eq!(open.vbucket(), 3);
        // Requested resume point is seqno 500.
        assert_eq!(&open.extras()[8..16], &500u64.to_be_bytes());
        stream
            .write_all(&support::response(
                opcode::DCP_STREAM_REQ,
                0x23, // rollback
                open.opaque(),
                &[],
                &400u64.to_be_bytes(),
            ))
            .await
            .expect("rollback response");
        support::wait_for_close(&mut stream).await;
    });

    let (config_port, endpoint) =
        support::config_endpoint(vec![support::config_json(1, kv_port, 4)]).await;
    let client = Client::new(client_config(config_port));
    let mut events = client.events();
    timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect in time")
        .expect("connect");

    client.stream_partition(
        3,
        StreamOffset::new(0, 500, SnapshotMarker::new(500, 500, 0)),
    );

    match recv_event(&mut events).await {
        DcpEvent::Rollback {
            vbucket,
            seqno,
            action,
        } => {
            assert_eq!(vbucket, 3);
            assert_eq!(seqno, 400);
            // Deliberately do nothing with the action.
            drop(action);
        }
        other => panic!("expected Rollback, got: {other:?}"),
    }

    // Nobody resumed: the default handler fails the partition.
    match recv_event(&mut events).await {
        DcpEvent::StreamFailure { vbucket, .. } => assert_eq!(vbucket, 3),
        other => panic!("expected StreamFailure, got: {other:?}"),
    }

    client.stop().await;
    timeout(Duration::from_secs(5), node)
        .await
        .expect("node assertions in time")
        .expect("node task");
    endpoint.abort();
}

#[tokio::test]
async fn resumed_rollback_reopens_the_stream_at_the_server_point() {
    support::init_tracing();
    let kv = TcpListener::bind("127.0.0.1:0").await.expect("bind kv");
    let kv_port = kv.local_addr().expect("local addr").port();

    let node = tokio::spawn(async move {
        let (mut stream, _) = kv.accept().await.expect("accept");
        support::serve_handshake(&mut stream).await;

        let open = support::read_frame(&mut stream).await;
        assert_eq!(open.vbucket(), 1);
        stream
            .write_all(&support::response(
                opcode::DCP_STREAM_REQ,
                0x23,
                open.opaque(),
                &[],
                &250u64.to_be_bytes(),
            ))
            .await
            .expect("rollback response");

        // The resumed open lands at the server's rollback point.
        let reopened = support::read_frame(&mut stream).await;
        assert_eq!(reopened.opcode(), opcode::DCP_STREAM_REQ);
        assert_eq!(&reopened.extras()[8..16], &250u64.to_be_bytes());
        let log = support::failover_log_value(&[(0xBEEF, 250)]);
        stream
            .write_all(&support::response(
                opcode::DCP_STREAM_REQ,
                0,
                reopened.opaque(),
                &[],
                &log,
            ))
            .await
            .expect("reopen response");
        support::wait_for_close(&mut stream).await;
    });

    let (config_port, endpoint) =
        support::config_endpoint(vec![support::config_json(1, kv_port, 4)]).await;
    let client = Client::new(client_config(config_port));
    let mut events = client.events();
    timeout(Duration::from_secs(5), client.connect())
        .await
        .expect("connect in time")
        .expect("connect");

    client.stream_partition(
        1,
        StreamOffset::new(0, 500, SnapshotMarker::new(500, 500, 0)),
    );

    match recv_event(&mut events).await {
        DcpEvent::Rollback { seqno, action, .. } => {
            assert_eq!(seqno, 250);
            action.resume();
        }
        other => panic!("expected Rollback, got: {other:?}"),
    }
    match recv_event(&mut events).await {
        DcpEvent::FailoverLog { vbucket, entries } => {
            assert_eq!(vbucket, 1);
            assert_eq!(entries[0].uuid, 0xBEEF);
        }
        other => panic!("expected FailoverLog, got: {other:?}"),
    }

    client.stop().await;
    timeout(Duration::from_secs(5), node)
        .await
        .expect("node assertions in time")
        .expect("node task");
    endpoint.abort();
}
