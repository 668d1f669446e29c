//! Transport layer abstraction for the client connection.
//!
//! This module abstracts the underlying byte stream, so the connection
//! driver never touches a concrete socket type. Production code uses TCP;
//! tests drive the same driver through scripted in-memory transports.
//!
//! 客户端连接的传输层抽象。
//!
//! 此模块抽象底层字节流，使连接驱动永远不接触具体的套接字类型。
//! 生产代码使用TCP，测试则通过脚本化的内存传输驱动同一个驱动器。

use crate::{
    config::Endpoint,
    error::Result,
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::{fmt::Debug, net::SocketAddr};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// A bidirectional byte-stream transport carrying one connection.
///
/// 承载单个连接的双向字节流传输。
#[async_trait]
pub trait Transport: Send + Debug + 'static {
    /// Reads more bytes off the stream, appending them to `buf`.
    ///
    /// Blocks until at least one byte arrives. Returns the number of bytes
    /// read; `0` means the peer closed the connection.
    ///
    /// 从流上读取更多字节并追加到 `buf` 末尾。
    ///
    /// 会阻塞直到至少有一个字节到达。返回读取的字节数；`0` 表示对端已关闭连接。
    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize>;

    /// Writes the whole buffer to the peer.
    ///
    /// 将整个缓冲区写给对端。
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Shuts the write side down, flushing anything still pending.
    ///
    /// 关闭写端，并冲刷尚未发出的数据。
    async fn shutdown(&mut self) -> Result<()>;

    /// Returns the remote address this transport is connected to.
    ///
    /// 返回此传输连接到的远端地址。
    fn peer_addr(&self) -> Result<SocketAddr>;
}

/// A transport that can be created by connecting to an [`Endpoint`].
///
/// This extends the `Transport` trait with the ability to create a new
/// transport by dialing out.
///
/// 可通过连接到 [`Endpoint`] 创建的传输。
///
/// 该trait扩展了 `Transport`，增加了主动拨号创建新传输的能力。
#[async_trait]
pub trait ConnectTransport: Transport + Sized {
    /// Connects a new transport to the given endpoint.
    ///
    /// 连接到给定端点并创建新的传输。
    async fn connect(endpoint: &Endpoint) -> Result<Self>;
}

/// TCP implementation of the transport abstraction.
///
/// 传输抽象的TCP实现。
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Wraps an already-connected TCP stream.
    ///
    /// 包装一个已连接的TCP流。
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn read(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = self.stream.read_buf(buf).await?;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}

#[async_trait]
impl ConnectTransport for TcpTransport {
    async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        Self::from_stream(stream)
    }
}
