//! 定义了客户端和协议的可配置参数。
//! Defines configurable parameters for the client and the protocol.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// The remote endpoint a client talks to. Fixed for the lifetime of the
/// client; there is no way to re-point a built client elsewhere.
///
/// 客户端通信的远端端点。在客户端整个生命周期内固定，
/// 已构建的客户端无法被重新指向其他地址。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP address of the server.
    /// 服务端的主机名或IP地址。
    pub host: String,
    /// TCP port of the server.
    /// 服务端的TCP端口。
    pub port: u16,
}

impl Endpoint {
    /// Creates a new endpoint.
    /// 创建一个新的端点。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A structure containing all configurable parameters for a client.
///
/// 包含客户端所有可配置参数的结构体。
#[derive(Debug, Clone)]
pub struct Config {
    /// The fixed upper bound for a single connect attempt. Attempts that
    /// take longer fail; there is no retry inside the library.
    /// 单次连接尝试的固定时间上限。超过该时间的尝试即告失败，库内不做重试。
    pub connect_timeout: Duration,

    /// Keep-alive and read-idle parameters.
    /// 保活与读空闲相关参数。
    pub idle: IdleConfig,

    /// RPC-related parameters.
    /// RPC相关参数。
    pub rpc: RpcConfig,

    /// File-transfer-related parameters.
    /// 文件传输相关参数。
    pub file: FileConfig,
}

/// Keep-alive and read-idle parameters.
///
/// 保活与读空闲相关参数。
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Read silence after which the client sends a keep-alive probe.
    /// Measured from the last byte read off the socket.
    /// 客户端发送保活探测前允许的读静默时长。从套接字上最后读到字节起计。
    pub ping_interval: Duration,

    /// Read silence after which the connection is declared dead and closed.
    /// Must be comfortably larger than `ping_interval`. Also bounds a
    /// single outbound write; a write that cannot complete within it closes
    /// the connection the same way.
    /// 超过该读静默时长后连接被判定死亡并关闭。应明显大于 `ping_interval`。
    /// 单次出站写入也以它为上限，无法在其内完成的写入同样导致连接关闭。
    pub read_timeout: Duration,
}

/// RPC-related parameters.
///
/// RPC相关参数。
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// How long an outstanding request may wait for its response before its
    /// callback is failed.
    /// 一个在途请求等待响应的最长时间，超时后其回调以失败结束。
    pub response_timeout: Duration,
}

/// File-transfer-related parameters.
///
/// 文件传输相关参数。
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Payload size of a single file-chunk message.
    /// 单个文件分块消息的载荷大小。
    pub chunk_size: usize,

    /// Capacity of the bounded channel between the chunk reader and the
    /// connection writer. This is what throttles disk reads to socket speed.
    /// 分块读取端与连接写入端之间有界通道的容量。它把磁盘读取节流到套接字速度。
    pub chunk_buffer: usize,

    /// Directory where inbound files are saved.
    /// 入站文件的保存目录。
    pub save_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1000),
            idle: IdleConfig::default(),
            rpc: RpcConfig::default(),
            file: FileConfig::default(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(4),
            read_timeout: Duration::from_secs(12),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            chunk_buffer: 8,
            save_dir: std::env::temp_dir(),
        }
    }
}
