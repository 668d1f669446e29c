//! Unit tests for the `client` module: send routing, pool replay and
//! lifecycle transitions, driven through a scripted mock transport.
//! `client` 模块的单元测试：发送路由、发送池重放与生命周期翻转，
//! 全部通过脚本化的模拟传输来驱动。

use super::{
    Client, ConnectionState, driver,
    lifecycle::{HandlerSet, Lifecycle},
    open_file_request, send_pool::SendPool,
};
use crate::{
    config::{Config, Endpoint},
    error::{Error, Result},
    handler::{
        event::{EventSource, EventStage},
        file::{FileHandler, FileStage},
        rpc::{RpcHandler, RpcRequest, RpcStage},
    },
    pipeline::Pipeline,
    protocol::{FrameSplitter, Message, RecipientKind, encode_frame},
    transport::Transport,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::{
    collections::HashSet,
    io::Write as _,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

/// A scripted in-memory transport for driving the connection driver
/// without a real socket.
#[derive(Debug)]
struct MockTransport {
    inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    written_tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize> {
        match self.inbound_rx.recv().await {
            Some(bytes) => {
                buf.extend_from_slice(&bytes);
                Ok(bytes.len())
            }
            None => Ok(0),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.written_tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| Error::ChannelClosed)
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:9999".parse().unwrap())
    }
}

/// The test's side of a [`MockTransport`]: injects inbound wire bytes and
/// reassembles everything the driver writes back into messages.
struct MockRemote {
    inbound_tx: Option<mpsc::UnboundedSender<Bytes>>,
    written_rx: mpsc::UnboundedReceiver<Bytes>,
    splitter: FrameSplitter,
    buf: BytesMut,
}

fn mock_pair() -> (MockTransport, MockRemote) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let transport = MockTransport {
        inbound_rx,
        written_tx,
    };
    let remote = MockRemote {
        inbound_tx: Some(inbound_tx),
        written_rx,
        splitter: FrameSplitter::new(),
        buf: BytesMut::new(),
    };
    (transport, remote)
}

impl MockRemote {
    fn send_message(&self, message: &Message) {
        self.send_raw(encode_frame(message).expect("test message must encode"));
    }

    fn send_raw(&self, bytes: Bytes) {
        self.inbound_tx
            .as_ref()
            .expect("remote already closed")
            .send(bytes)
            .expect("driver hung up on the remote");
    }

    /// Closes the connection from the peer side; the driver sees EOF.
    fn close(&mut self) {
        self.inbound_tx = None;
    }

    async fn next_message(&mut self) -> Message {
        loop {
            if let Some(frame) = self
                .splitter
                .next_frame(&mut self.buf)
                .expect("driver wrote a malformed frame")
            {
                return Message::decode(frame).expect("driver wrote an undecodable message");
            }
            let chunk = tokio::time::timeout(Duration::from_secs(5), self.written_rx.recv())
                .await
                .expect("timed out waiting for the driver to write")
                .expect("driver closed before writing the expected message");
            self.buf.extend_from_slice(&chunk);
        }
    }

    /// Like [`next_message`](Self::next_message) but skips keep-alive traffic.
    async fn next_payload_message(&mut self) -> Message {
        loop {
            match self.next_message().await {
                Message::Ping | Message::Pong => continue,
                other => return other,
            }
        }
    }

    /// Resolves once the driver has dropped its transport.
    async fn until_closed(&mut self) {
        while tokio::time::timeout(Duration::from_secs(5), self.written_rx.recv())
            .await
            .expect("timed out waiting for the driver to hang up")
            .is_some()
        {}
    }
}

/// A transport whose writes never complete, like a peer that stopped
/// draining its receive buffer.
#[derive(Debug)]
struct StalledTransport {
    _inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl StalledTransport {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            _inbound_tx: tx,
            inbound_rx: rx,
        }
    }
}

#[async_trait]
impl Transport for StalledTransport {
    async fn read(&mut self, _buf: &mut BytesMut) -> Result<usize> {
        // The peer goes silent; only writes are attempted in this scenario.
        self.inbound_rx.recv().await;
        Ok(0)
    }

    async fn write(&mut self, _buf: &[u8]) -> Result<()> {
        // A full send buffer that never drains.
        std::future::pending().await
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:9998".parse().unwrap())
    }
}

fn mock_client() -> Client<MockTransport> {
    Client::builder("mock.invalid", 1).build_with::<MockTransport>()
}

/// Drives the full install path (handlers, pipeline, pump, driver) against
/// a scripted transport, standing in for a successful dial.
fn connect_mock(client: &Client<MockTransport>) -> MockRemote {
    let (transport, remote) = mock_pair();
    let generation = client
        .inner
        .begin_start()
        .expect("the connect claim should be accepted");
    driver::install_connection(&client.inner, transport, generation)
        .expect("installing the connection should succeed");
    remote
}

async fn wait_for_state<T: Transport>(client: &Client<T>, expected: ConnectionState) {
    for _ in 0..2000 {
        if client.state() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "client never reached {:?}, still {:?}",
        expected,
        client.state()
    );
}

fn temp_file_with(contents: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file.flush().unwrap();
    file
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// --- Threading ---

#[test]
fn test_shared_handles_are_send_and_sync() {
    // The client and everything the driver task owns cross thread
    // boundaries on the runtime; losing either bound breaks every spawn
    // site at once.
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Client<MockTransport>>();
    assert_send_sync::<Arc<Lifecycle>>();
    assert_send_sync::<RpcHandler>();
    assert_send_sync::<FileHandler>();
    assert_send_sync::<Pipeline>();
}

// --- State machine ---

#[test]
fn test_start_claims_are_exclusive() {
    let lifecycle = Lifecycle::new(
        Endpoint::new("localhost", 1),
        Config::default(),
        Arc::new(EventSource::new(Vec::new())),
        None,
    );

    // 1. First claim wins, second is rejected while the first is in flight.
    let generation = lifecycle.begin_start().unwrap();
    assert_eq!(lifecycle.state(), ConnectionState::Connecting);
    assert!(matches!(
        lifecycle.begin_start(),
        Err(Error::AlreadyStarted)
    ));

    // 2. A failed attempt rolls back and frees the claim.
    lifecycle.connect_failed(generation);
    assert_eq!(lifecycle.state(), ConnectionState::Unconnected);
    let next = lifecycle.begin_start().unwrap();
    assert!(next > generation, "each claim gets a fresh generation");
}

#[test]
fn test_stale_usable_signal_is_ignored() {
    let lifecycle = Lifecycle::new(
        Endpoint::new("localhost", 1),
        Config::default(),
        Arc::new(EventSource::new(Vec::new())),
        None,
    );
    let stale = lifecycle.begin_start().unwrap();
    lifecycle.connect_failed(stale);
    let _fresh = lifecycle.begin_start().unwrap();

    // A usable signal carrying the superseded generation must not flip the
    // state of the newer attempt.
    let (control_tx, _control_rx) = mpsc::unbounded_channel();
    let (file_tx, _file_rx) = mpsc::unbounded_channel();
    let handlers = HandlerSet {
        rpc: Arc::new(RpcHandler::new(control_tx, Duration::from_secs(10))),
        file: FileHandler::new(file_tx),
    };
    lifecycle.on_connection_usable(stale, handlers);
    assert_eq!(lifecycle.state(), ConnectionState::Connecting);
}

#[test]
fn test_send_pool_preserves_insertion_order() {
    let mut pool = SendPool::default();
    for uri in ["first", "second", "third"] {
        pool.push_rpc(RpcRequest::new(uri, Bytes::new()), Box::new(|_| {}));
    }
    let file_a = temp_file_with(b"a");
    let file_b = temp_file_with(b"b");
    for file in [&file_a, &file_b] {
        let request =
            open_file_request(file.path(), RecipientKind::Server, String::new()).unwrap();
        pool.push_file(request, Box::new(|_| {}));
    }
    assert_eq!(pool.rpc_len(), 3);
    assert_eq!(pool.file_len(), 2);

    let (files, rpcs) = pool.take_all();
    let uris: Vec<_> = rpcs.iter().map(|q| q.request.uri.as_str()).collect();
    assert_eq!(uris, ["first", "second", "third"]);
    assert_eq!(files.len(), 2);
    assert_eq!(pool.rpc_len(), 0, "take_all must leave the pool empty");
    assert_eq!(pool.file_len(), 0);
}

#[test]
fn test_pipeline_stage_order_is_fixed() {
    let (control_tx, _control_rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::assemble(
        FileStage::new(std::env::temp_dir(), None),
        RpcStage::new(Arc::new(RpcHandler::new(control_tx, Duration::from_secs(10)))),
        EventStage::new(Arc::new(EventSource::new(Vec::new()))),
    );
    assert_eq!(
        pipeline.stage_names(),
        ["heartbeat", "file", "rpc", "event", "business"]
    );
}

// --- Queueing and replay ---

#[tokio::test]
async fn test_queued_rpcs_replay_in_order_on_connect() {
    // 1. Setup: three sends while nothing is connected.
    let client = mock_client();
    assert_eq!(client.state(), ConnectionState::Unconnected);

    let mut receivers = Vec::new();
    for uri in ["queued/1", "queued/2", "queued/3"] {
        let (tx, rx) = oneshot::channel();
        client.send_rpc(RpcRequest::new(uri, Bytes::from_static(b"payload")), move |result| {
            let _ = tx.send(result);
        });
        receivers.push(rx);
    }

    // 2. Action: the connection comes up.
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    // 3. Verification: the backlog arrives in insertion order and every
    // callback resolves once the responses come back.
    for expected in ["queued/1", "queued/2", "queued/3"] {
        match remote.next_payload_message().await {
            Message::RpcRequest { id, uri, body } => {
                assert_eq!(uri, expected);
                assert_eq!(body, Bytes::from_static(b"payload"));
                remote.send_message(&Message::rpc_response(id, 200, Bytes::from_static(b"ok")));
            }
            other => panic!("expected an rpc request, got {:?}", other),
        }
    }
    for rx in receivers {
        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.code, 200);
        assert_eq!(response.body, Bytes::from_static(b"ok"));
    }
}

#[tokio::test]
async fn test_usable_connection_forwards_directly() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("direct", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });

    match remote.next_payload_message().await {
        Message::RpcRequest { id, uri, .. } => {
            assert_eq!(uri, "direct");
            remote.send_message(&Message::rpc_response(id, 204, Bytes::new()));
        }
        other => panic!("expected an rpc request, got {:?}", other),
    }
    assert_eq!(rx.await.unwrap().unwrap().code, 204);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_are_all_delivered() {
    // Hammer the routing decision from many tasks at once; every request
    // must surface exactly once on the wire and every callback must fire.
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    const N: usize = 32;
    let mut receivers = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..N {
        let client = client.clone();
        let (tx, rx) = oneshot::channel();
        receivers.push(rx);
        tasks.push(tokio::spawn(async move {
            client.send_rpc(RpcRequest::new(format!("job/{i}"), Bytes::new()), move |result| {
                let _ = tx.send(result);
            });
        }));
    }
    for joined in futures::future::join_all(tasks).await {
        joined.unwrap();
    }

    let mut ids = HashSet::new();
    let mut uris = HashSet::new();
    for _ in 0..N {
        match remote.next_payload_message().await {
            Message::RpcRequest { id, uri, .. } => {
                assert!(ids.insert(id), "correlation id {} reused", id);
                assert!(uris.insert(uri.clone()), "request {} delivered twice", uri);
                remote.send_message(&Message::rpc_response(id, 200, Bytes::new()));
            }
            other => panic!("expected an rpc request, got {:?}", other),
        }
    }
    let expected: HashSet<_> = (0..N).map(|i| format!("job/{i}")).collect();
    assert_eq!(uris, expected);
    for rx in receivers {
        assert!(rx.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_sends_queue_again_after_close_and_replay_on_reconnect() {
    // 1. A live connection goes away.
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;
    remote.close();
    wait_for_state(&client, ConnectionState::Closed).await;

    // 2. A send in the closed state queues instead of failing.
    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("after/close", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });

    // 3. The queued entry survives into the next successful attempt.
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;
    match remote.next_payload_message().await {
        Message::RpcRequest { id, uri, .. } => {
            assert_eq!(uri, "after/close");
            remote.send_message(&Message::rpc_response(id, 200, Bytes::new()));
        }
        other => panic!("expected an rpc request, got {:?}", other),
    }
    assert!(rx.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_outstanding_rpc_fails_when_connection_closes() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("doomed", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });
    // The request reaches the wire, then the peer disappears.
    let _ = remote.next_payload_message().await;
    remote.close();

    match rx.await.unwrap() {
        Err(Error::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {:?}", other),
    }
    wait_for_state(&client, ConnectionState::Closed).await;
}

#[tokio::test(start_paused = true)]
async fn test_rpc_times_out_without_response() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("silence", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });
    let _ = remote.next_payload_message().await;

    // No response ever arrives; virtual time runs until the expiry sweep.
    match rx.await.unwrap() {
        Err(Error::RpcTimeout) => {}
        other => panic!("expected RpcTimeout, got {:?}", other),
    }
}

// --- Heartbeat ---

#[tokio::test]
async fn test_inbound_ping_is_answered_with_pong() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::Ping);
    assert_eq!(remote.next_message().await, Message::Pong);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_pings_then_times_out() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    // 1. Read silence first produces a probe...
    assert_eq!(remote.next_message().await, Message::Ping);

    // 2. ...and continued silence eventually kills the connection.
    wait_for_state(&client, ConnectionState::Closed).await;
}

// --- Malformed input ---

#[tokio::test]
async fn test_malformed_frame_closes_the_connection() {
    let client = mock_client();
    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    // A frame length far past the allowed maximum.
    remote.send_raw(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF]));
    wait_for_state(&client, ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_out_of_sequence_chunk_closes_the_connection() {
    let save_dir = tempfile::tempdir().unwrap();
    let client = Client::builder("mock.invalid", 1)
        .save_dir(save_dir.path())
        .build_with::<MockTransport>();
    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::file_start(
        5,
        RecipientKind::Broadcast,
        "",
        "x.bin",
        100,
    ));
    remote.send_message(&Message::file_chunk(5, 999, Bytes::from_static(b"hole")));
    wait_for_state(&client, ConnectionState::Closed).await;

    // The half-written file must not survive the failed transfer.
    let leftover = save_dir.path().join("x.bin");
    for _ in 0..500 {
        if !leftover.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("partial file was left behind at {:?}", leftover);
}

// --- File transfer ---

#[tokio::test]
async fn test_send_file_rejects_missing_and_non_regular_paths() {
    let client = mock_client();

    let bogus = PathBuf::from("/definitely/not/here.bin");
    match client.send_file(&bogus, RecipientKind::Server, "", |_| {}) {
        Err(Error::FileNotFound { path }) => assert_eq!(path, bogus),
        other => panic!("expected FileNotFound, got {:?}", other),
    }

    // A directory is not a sendable file either.
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        client.send_file(dir.path(), RecipientKind::Server, "", |_| {}),
        Err(Error::FileNotFound { .. })
    ));

    // The check does not depend on the connection state.
    let _remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;
    assert!(matches!(
        client.send_file(&bogus, RecipientKind::Server, "", |_| {}),
        Err(Error::FileNotFound { .. })
    ));
}

#[tokio::test]
async fn test_send_file_streams_start_chunks_end_in_order() {
    let contents = patterned_bytes(150 * 1024);
    let file = temp_file_with(&contents);
    let expected_name = file.path().file_name().unwrap().to_str().unwrap().to_owned();

    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    let (tx, rx) = oneshot::channel();
    client
        .send_file(file.path(), RecipientKind::Client, "peer-7", move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    // 1. The announcement comes first and carries the metadata.
    let announced_id = match remote.next_payload_message().await {
        Message::FileStart {
            transfer_id,
            recipient_kind,
            recipient_id,
            name,
            size,
        } => {
            assert_eq!(recipient_kind, RecipientKind::Client);
            assert_eq!(recipient_id, "peer-7");
            assert_eq!(name, expected_name);
            assert_eq!(size, contents.len() as u64);
            transfer_id
        }
        other => panic!("expected a file start, got {:?}", other),
    };

    // 2. Chunks follow with contiguous offsets until the end marker.
    let mut reassembled = Vec::new();
    loop {
        match remote.next_payload_message().await {
            Message::FileChunk {
                transfer_id,
                offset,
                data,
            } => {
                assert_eq!(transfer_id, announced_id);
                assert_eq!(offset, reassembled.len() as u64, "chunk out of order");
                reassembled.extend_from_slice(&data);
            }
            Message::FileEnd { transfer_id } => {
                assert_eq!(transfer_id, announced_id);
                break;
            }
            other => panic!("unexpected message mid-transfer: {:?}", other),
        }
    }
    assert_eq!(reassembled, contents);
    assert!(rx.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_queued_file_replays_after_connect() {
    let contents = patterned_bytes(1024);
    let file = temp_file_with(&contents);

    // Queued while unconnected, streamed after the connection comes up.
    let client = mock_client();
    let (tx, rx) = oneshot::channel();
    client
        .send_file(file.path(), RecipientKind::Server, "", move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    assert!(matches!(
        remote.next_payload_message().await,
        Message::FileStart { .. }
    ));
    let mut sent = 0usize;
    loop {
        match remote.next_payload_message().await {
            Message::FileChunk { data, .. } => sent += data.len(),
            Message::FileEnd { .. } => break,
            other => panic!("unexpected message mid-transfer: {:?}", other),
        }
    }
    assert_eq!(sent, contents.len());
    assert!(rx.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_inbound_file_is_saved_and_reported() {
    let save_dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client = Client::builder("mock.invalid", 1)
        .save_dir(save_dir.path())
        .on_file_received(move |received| {
            let _ = seen_tx.send(received);
        })
        .build_with::<MockTransport>();

    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::file_start(
        11,
        RecipientKind::Broadcast,
        "",
        "hello.bin",
        11,
    ));
    remote.send_message(&Message::file_chunk(11, 0, Bytes::from_static(b"hello ")));
    remote.send_message(&Message::file_chunk(11, 6, Bytes::from_static(b"world")));
    remote.send_message(&Message::file_end(11));

    let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("timed out waiting for the saved file")
        .unwrap();
    assert_eq!(received.name, "hello.bin");
    assert_eq!(received.size, 11);
    assert_eq!(received.path, save_dir.path().join("hello.bin"));
    let saved = tokio::fs::read(&received.path).await.unwrap();
    assert_eq!(saved, b"hello world");
}

#[tokio::test]
async fn test_inbound_file_name_is_sanitized() {
    let save_dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client = Client::builder("mock.invalid", 1)
        .save_dir(save_dir.path())
        .on_file_received(move |received| {
            let _ = seen_tx.send(received);
        })
        .build_with::<MockTransport>();

    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::file_start(
        12,
        RecipientKind::Broadcast,
        "",
        "../../escape.bin",
        4,
    ));
    remote.send_message(&Message::file_chunk(12, 0, Bytes::from_static(b"data")));
    remote.send_message(&Message::file_end(12));

    let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .expect("timed out waiting for the saved file")
        .unwrap();
    assert_eq!(received.name, "escape.bin");
    assert_eq!(
        received.path.parent().unwrap(),
        save_dir.path(),
        "the file must land inside the configured save directory"
    );
}

#[tokio::test]
async fn test_concurrent_same_name_transfers_do_not_clobber() {
    // Two interleaved pushes announcing the same file name must both
    // survive to disk with their own contents.
    let save_dir = tempfile::tempdir().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let client = Client::builder("mock.invalid", 1)
        .save_dir(save_dir.path())
        .on_file_received(move |received| {
            let _ = seen_tx.send(received);
        })
        .build_with::<MockTransport>();

    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::file_start(21, RecipientKind::Broadcast, "", "dup.bin", 4));
    remote.send_message(&Message::file_start(22, RecipientKind::Broadcast, "", "dup.bin", 4));
    remote.send_message(&Message::file_chunk(21, 0, Bytes::from_static(b"AA")));
    remote.send_message(&Message::file_chunk(22, 0, Bytes::from_static(b"BB")));
    remote.send_message(&Message::file_chunk(21, 2, Bytes::from_static(b"aa")));
    remote.send_message(&Message::file_chunk(22, 2, Bytes::from_static(b"bb")));
    remote.send_message(&Message::file_end(21));
    remote.send_message(&Message::file_end(22));

    let mut contents = Vec::new();
    for _ in 0..2 {
        let received = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("timed out waiting for a saved file")
            .unwrap();
        assert_eq!(received.name, "dup.bin", "both report the announced name");
        assert_eq!(received.path.parent().unwrap(), save_dir.path());
        contents.push(tokio::fs::read(&received.path).await.unwrap());
    }
    contents.sort();
    assert_eq!(contents, [b"AAaa".to_vec(), b"BBbb".to_vec()]);
}

// --- Events ---

#[tokio::test]
async fn test_events_fan_out_in_registration_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = seen.clone();
    let second = seen.clone();
    let client = Client::builder("mock.invalid", 1)
        .listener(move |event: &crate::handler::ServerEvent| {
            first.lock().unwrap().push(format!("first:{}", event.name));
        })
        .listener(move |event: &crate::handler::ServerEvent| {
            second.lock().unwrap().push(format!("second:{}", event.name));
        })
        .build_with::<MockTransport>();

    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::event("alpha", Bytes::new()));
    remote.send_message(&Message::event("beta", Bytes::new()));

    for _ in 0..500 {
        if seen.lock().unwrap().len() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let order = seen.lock().unwrap().clone();
    assert_eq!(
        order,
        ["first:alpha", "second:alpha", "first:beta", "second:beta"],
        "listeners must fire in registration order, events in arrival order"
    );
}

// --- Fault isolation ---

#[tokio::test]
async fn test_panicking_listener_closes_the_connection() {
    // A listener that panics must take its connection down cleanly, not
    // strand the client in a usable state behind a dead driver.
    let client = Client::builder("mock.invalid", 1)
        .listener(|event: &crate::handler::ServerEvent| {
            if event.name == "boom" {
                panic!("listener exploded");
            }
        })
        .build_with::<MockTransport>();

    let remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    remote.send_message(&Message::event("boom", Bytes::new()));
    wait_for_state(&client, ConnectionState::Closed).await;

    // The failure behaves like any other close: later sends queue again.
    let (tx, mut rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("after/boom", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });
    assert!(rx.try_recv().is_err(), "the send must queue, not fail");
}

#[tokio::test(start_paused = true)]
async fn test_panicking_timeout_callback_still_closes_the_connection() {
    // Timeout callbacks run on the driver task outside the stage chain; a
    // panic there must still end in the closed transition.
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    client.send_rpc(RpcRequest::new("kaboom", Bytes::new()), |_| {
        panic!("user callback exploded");
    });
    let _ = remote.next_payload_message().await;

    // No response ever arrives; the expiry sweep fires the panicking
    // callback.
    wait_for_state(&client, ConnectionState::Closed).await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_times_out_and_closes() {
    // A peer that accepts bytes but never drains them must not wedge the
    // driver forever; the write deadline turns it into a normal close.
    let client = Client::builder("mock.invalid", 1).build_with::<StalledTransport>();
    let generation = client
        .inner
        .begin_start()
        .expect("the connect claim should be accepted");
    driver::install_connection(&client.inner, StalledTransport::new(), generation)
        .expect("installing the connection should succeed");
    wait_for_state(&client, ConnectionState::Usable).await;

    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("into/the/void", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });

    wait_for_state(&client, ConnectionState::Closed).await;
    assert!(matches!(rx.await, Ok(Err(Error::ConnectionClosed))));
}

#[tokio::test]
async fn test_oversize_rpc_fails_the_callback_not_the_connection() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    // A uri its u16 length prefix cannot describe.
    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("x".repeat(70_000), Bytes::new()), move |result| {
        let _ = tx.send(result);
    });
    match rx.await.unwrap() {
        Err(Error::MessageTooLarge) => {}
        other => panic!("expected MessageTooLarge, got {:?}", other),
    }

    // The connection itself is unharmed.
    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("still/alive", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });
    match remote.next_payload_message().await {
        Message::RpcRequest { id, uri, .. } => {
            assert_eq!(uri, "still/alive");
            remote.send_message(&Message::rpc_response(id, 200, Bytes::new()));
        }
        other => panic!("expected an rpc request, got {:?}", other),
    }
    assert_eq!(rx.await.unwrap().unwrap().code, 200);
    assert_eq!(client.state(), ConnectionState::Usable);
}

// --- Release ---

#[tokio::test]
async fn test_release_abandons_queued_callbacks_uninvoked() {
    let client = mock_client();

    let (rpc_tx, rpc_rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("never", Bytes::new()), move |result| {
        let _ = rpc_tx.send(result);
    });
    let file = temp_file_with(b"never sent");
    let (file_tx, file_rx) = oneshot::channel();
    client
        .send_file(file.path(), RecipientKind::Server, "", move |result| {
            let _ = file_tx.send(result);
        })
        .unwrap();

    client.release();
    assert!(client.is_released());
    assert_eq!(client.state(), ConnectionState::Closed);

    // Both callbacks were dropped without ever being invoked.
    assert!(rpc_rx.await.is_err());
    assert!(file_rx.await.is_err());

    // Later sends are accepted and lead nowhere.
    client.send_rpc(RpcRequest::new("void", Bytes::new()), |_| {});
    assert!(client
        .send_file(file.path(), RecipientKind::Server, "", |_| {})
        .is_ok());

    // Release is idempotent and start stays rejected.
    client.release();
    let pending = {
        // Claiming directly is equivalent to what `start` does first.
        client.inner.begin_start()
    };
    assert!(matches!(pending, Err(Error::Released)));
}

#[tokio::test]
async fn test_release_severs_a_live_connection() {
    let client = mock_client();
    let mut remote = connect_mock(&client);
    wait_for_state(&client, ConnectionState::Usable).await;

    let (tx, rx) = oneshot::channel();
    client.send_rpc(RpcRequest::new("in-flight", Bytes::new()), move |result| {
        let _ = tx.send(result);
    });
    let _ = remote.next_payload_message().await;

    client.release();
    remote.until_closed().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    // Released means abandoned, not failed: the callback never fires.
    assert!(rx.await.is_err());
}
