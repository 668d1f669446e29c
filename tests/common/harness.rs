//! tests/common/harness.rs
use bytes::BytesMut;
use petrel_client::client::{Client, ConnectionState};
use petrel_client::protocol::{FrameSplitter, Message, encode_frame};
use std::sync::Once;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Initializes tracing for tests, ensuring it's only done once.
pub fn init_tracing() {
    static TRACING_INIT: Once = Once::new();
    TRACING_INIT.call_once(|| {
        let filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "petrel_client=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .init();
    });
}

/// A scripted stand-in for the real server: one TCP listener on an
/// OS-assigned port, accepting connections that speak the framed protocol.
pub struct TestServer {
    listener: TcpListener,
    pub port: u16,
}

impl TestServer {
    /// Binds a fresh listener on a port chosen by the OS, so parallel
    /// tests never collide.
    pub async fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// A client wired to this server with default configuration.
    pub fn client(&self) -> Client {
        Client::builder("127.0.0.1", self.port).build()
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, remote_addr) = self.listener.accept().await.unwrap();
        tracing::info!("[TestServer] accepted connection from {}", remote_addr);
        ServerConn {
            stream,
            splitter: FrameSplitter::new(),
            buf: BytesMut::new(),
        }
    }
}

/// One accepted connection, with framing helpers for both directions.
pub struct ServerConn {
    stream: TcpStream,
    splitter: FrameSplitter,
    buf: BytesMut,
}

impl ServerConn {
    /// Reads the next message, keep-alive traffic included.
    pub async fn recv_message(&mut self) -> Message {
        loop {
            if let Some(frame) = self
                .splitter
                .next_frame(&mut self.buf)
                .expect("client sent a malformed frame")
            {
                return Message::decode(frame).expect("client sent an undecodable message");
            }
            let n = self
                .stream
                .read_buf(&mut self.buf)
                .await
                .expect("read from client failed");
            assert!(n > 0, "client closed the connection mid-message");
        }
    }

    /// Reads the next message that is not keep-alive traffic.
    pub async fn recv_payload_message(&mut self) -> Message {
        loop {
            match self.recv_message().await {
                Message::Ping | Message::Pong => continue,
                other => return other,
            }
        }
    }

    pub async fn send_message(&mut self, message: &Message) {
        let frame = encode_frame(message).expect("test message must encode");
        self.stream
            .write_all(&frame)
            .await
            .expect("write to client failed");
    }

    /// Asserts that the client hangs up within the read timeout.
    pub async fn expect_eof(mut self) {
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for the client to hang up")
                .expect("read from client failed");
            if n == 0 {
                return;
            }
        }
    }

    /// Drops the connection without any protocol goodbye.
    pub async fn close(mut self) {
        self.stream
            .shutdown()
            .await
            .expect("tcp shutdown towards the client failed");
    }
}

/// Polls until the client reaches `expected`, failing after a few seconds.
pub async fn wait_for_state(client: &Client, expected: ConnectionState) {
    for _ in 0..500 {
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
