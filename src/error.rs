//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use std::path::PathBuf;
use thiserror::Error;

/// The primary error type for the multiplexed client library.
/// 多路复用客户端库的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error occurred.
    /// 发生了底层的I/O错误。
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connect attempt was rejected before the socket became usable.
    /// 连接尝试在套接字可用之前被拒绝。
    #[error("Connect attempt failed: {0}")]
    Connect(std::io::Error),

    /// The connect attempt did not complete within the connect timeout.
    /// 连接尝试未在连接超时时间内完成。
    #[error("Connect attempt timed out")]
    ConnectTimeout,

    /// The file given to a send call could not be opened as a regular file.
    /// 传给发送调用的文件无法作为普通文件打开。
    #[error("File not found: {}", .path.display())]
    FileNotFound {
        /// The path as the caller passed it.
        /// 调用方传入的原始路径。
        path: PathBuf,
    },

    /// The message cannot fit a single wire frame: a string field longer
    /// than its u16 length prefix can carry, or a total size past the
    /// frame limit.
    ///
    /// 消息无法装进单个线上帧：字符串字段超出其u16长度前缀的表示范围，
    /// 或总大小超过帧上限。
    #[error("Message too large to send")]
    MessageTooLarge,

    /// Received bytes were inconsistent with the frame envelope. This is
    /// fatal to the connection carrying them.
    ///
    /// 接收到的字节与帧封装不一致。这对承载它们的连接是致命的。
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// A pipeline stage failed while processing an inbound frame.
    /// 管道阶段在处理入站帧时失败。
    #[error("Pipeline stage '{0}' failed")]
    HandlerDispatch(&'static str),

    /// The connection was closed by the peer or torn down locally.
    /// 连接被对端关闭或在本地被拆除。
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection timed out due to read inactivity.
    /// 连接因长时间没有读到数据而超时。
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// No response arrived for an RPC request within the response timeout.
    /// RPC请求在响应超时时间内没有等到响应。
    #[error("RPC response timed out")]
    RpcTimeout,

    /// An internal channel for communication between tasks was closed unexpectedly.
    /// 用于任务间通信的内部通道意外关闭。
    #[error("Internal channel is broken")]
    ChannelClosed,

    /// `start` was called while an attempt or a live connection already exists.
    /// 在已有连接尝试或存活连接时调用了 `start`。
    #[error("Client is already started")]
    AlreadyStarted,

    /// The client has been released and performs no further work.
    /// 客户端已被释放，不再执行任何工作。
    #[error("Client has been released")]
    Released,
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;
