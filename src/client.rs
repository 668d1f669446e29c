//! The client module, containing the user-facing handle and the connection
//! machinery behind it.
//! client 模块，包含面向用户的句柄以及其背后的连接机制。

pub mod lifecycle;

pub(crate) mod driver;
pub(crate) mod send_pool;

use crate::{
    config::{Config, Endpoint},
    error::{Error, Result},
    handler::{
        event::{EventListener, EventSource},
        file::{FileReceivedCallback, FileRequest, ReceivedFile},
        rpc::{RpcRequest, RpcResponse},
    },
    protocol::RecipientKind,
    transport::{ConnectTransport, TcpTransport, Transport},
};
use lifecycle::Lifecycle;
use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::oneshot;
use tracing::{info, warn};

pub use lifecycle::ConnectionState;

#[cfg(test)]
mod tests;

/// The handle returned by [`Client::start`]. Await [`wait`](Self::wait) for
/// the outcome of the connect attempt; dropping the handle detaches from
/// the attempt without cancelling it.
///
/// [`Client::start`] 返回的句柄。等待 [`wait`](Self::wait) 以获知连接尝试
/// 的结果；丢弃该句柄只是与尝试脱钩，并不会取消它。
pub struct PendingConnection {
    rx: oneshot::Receiver<Result<()>>,
}

impl PendingConnection {
    /// Resolves once the connect attempt has succeeded or failed.
    /// 在连接尝试成功或失败后返回。
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ChannelClosed),
        }
    }
}

/// A persistent client multiplexing RPC calls, file transfers and server
/// events over one framed TCP connection.
///
/// The handle is cheap to clone and every clone drives the same underlying
/// connection. Send calls never block and never fail for lack of a
/// connection: while none is usable they queue, and the backlog replays in
/// order the moment a connection comes up. Connecting is explicit via
/// [`start`](Client::start); a lost connection is never redialed by the
/// library.
///
/// 在一条分帧TCP连接上多路复用RPC调用、文件传输与服务端事件的持久客户端。
///
/// 句柄克隆成本低，所有克隆驱动同一个底层连接。发送调用永不阻塞，也永不
/// 因没有连接而失败：没有可用连接时它们入池，连接一旦建立积压即按序重放。
/// 连接需通过 [`start`](Client::start) 显式发起；连接断开后库不会自行重拨。
pub struct Client<T: Transport = TcpTransport> {
    pub(crate) inner: Arc<Lifecycle>,
    _marker: PhantomData<T>,
}

impl<T: Transport> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl Client {
    /// Starts a builder for a client of the given server endpoint.
    /// 为给定服务端端点开始构建一个客户端。
    pub fn builder(host: impl Into<String>, port: u16) -> ClientBuilder {
        ClientBuilder::new(host, port)
    }
}

impl<T: ConnectTransport> Client<T> {
    /// Launches one connect attempt against the configured endpoint.
    ///
    /// Returns immediately; the attempt runs on a spawned task and is
    /// bounded by the configured connect timeout. While it runs the client
    /// is `Connecting` and sends keep queueing. On success the queued
    /// backlog replays and the state becomes `Usable`; on failure the state
    /// falls back to `Unconnected` and the backlog stays queued.
    ///
    /// Fails with `AlreadyStarted` when an attempt or a live connection
    /// already exists, and with `Released` after [`release`](Client::release).
    /// Must be called from within a Tokio runtime.
    ///
    /// 对已配置的端点发起一次连接尝试。
    ///
    /// 立即返回；尝试在派生任务上运行，并受配置的连接超时约束。尝试期间
    /// 客户端处于 `Connecting`，发送继续入池。成功后积压按序重放、状态变为
    /// `Usable`；失败则状态回落到 `Unconnected`，积压原地保留。
    ///
    /// 当已存在尝试或存活连接时以 `AlreadyStarted` 失败；在
    /// [`release`](Client::release) 之后以 `Released` 失败。
    /// 必须在Tokio运行时内调用。
    pub fn start(&self) -> PendingConnection {
        let (tx, rx) = oneshot::channel();
        let generation = match self.inner.begin_start() {
            Ok(generation) => generation,
            Err(e) => {
                let _ = tx.send(Err(e));
                return PendingConnection { rx };
            }
        };

        let lifecycle = self.inner.clone();
        info!(endpoint = %lifecycle.endpoint, generation, "starting connection attempt");
        tokio::spawn(async move {
            let result = connect_attempt::<T>(&lifecycle, generation).await;
            if let Err(e) = &result {
                warn!(endpoint = %lifecycle.endpoint, error = %e, "connect attempt failed");
                lifecycle.connect_failed(generation);
            }
            let _ = tx.send(result);
        });
        PendingConnection { rx }
    }
}

impl<T: Transport> Client<T> {
    /// Sends one RPC request. Never blocks.
    ///
    /// The callback fires at most once: with the response; with
    /// `RpcTimeout` when none arrives in time; with `MessageTooLarge` when
    /// the request cannot fit a single wire frame; or with
    /// `ConnectionClosed` when the connection goes down first. After
    /// [`release`](Client::release) the callback is quietly dropped
    /// instead.
    ///
    /// 发送一个RPC请求。永不阻塞。
    ///
    /// 回调至多触发一次：携带响应；或在响应未及时到达时携带 `RpcTimeout`；
    /// 或在请求无法装进单个线上帧时携带 `MessageTooLarge`；或在连接先行
    /// 断开时携带 `ConnectionClosed`。在 [`release`](Client::release)
    /// 之后回调会被静默丢弃。
    pub fn send_rpc<F>(&self, request: RpcRequest, callback: F)
    where
        F: FnOnce(Result<RpcResponse>) + Send + Sync + 'static,
    {
        self.inner.route_rpc(request, Box::new(callback));
    }

    /// Sends one file, best effort. Never blocks past opening the file.
    ///
    /// The only synchronous failure is `FileNotFound`, when the path cannot
    /// be opened as a regular file; it is checked here, in the caller,
    /// regardless of connection state. Everything after that is reported
    /// through the callback, which fires at most once.
    ///
    /// 发送一个文件，尽力而为。除打开文件之外永不阻塞。
    ///
    /// 唯一的同步失败是 `FileNotFound`：当路径无法作为普通文件打开时返回，
    /// 且无论连接状态如何都会在此处（调用方处）检查。此后的一切结果都经由
    /// 至多触发一次的回调报告。
    pub fn send_file<F>(
        &self,
        path: impl AsRef<Path>,
        recipient_kind: RecipientKind,
        recipient_id: impl Into<String>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let request = open_file_request(path.as_ref(), recipient_kind, recipient_id.into())?;
        self.inner.route_file(request, Box::new(callback));
        Ok(())
    }

    /// Current externally visible connection state.
    /// 当前对外可见的连接状态。
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// The endpoint this client talks to.
    /// 此客户端通信的端点。
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Whether [`release`](Client::release) has been called.
    /// [`release`](Client::release) 是否已被调用。
    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }

    /// Tears the client down for good. Idempotent, affects every clone.
    ///
    /// The connection closes, in-flight transfers stop, and every pending
    /// callback, queued or outstanding, is dropped without being invoked.
    /// Later sends still return normally but their requests go nowhere.
    ///
    /// 彻底拆除客户端。幂等，作用于所有克隆。
    ///
    /// 连接关闭、传输中途停止，所有未决回调（无论已入池还是在途）都被直接
    /// 丢弃而不会被调用。之后的发送调用仍正常返回，但请求不会去往任何地方。
    pub fn release(&self) {
        self.inner.release();
    }
}

async fn connect_attempt<T: ConnectTransport>(
    lifecycle: &Arc<Lifecycle>,
    generation: u64,
) -> Result<()> {
    let endpoint = lifecycle.endpoint.clone();
    let connect = T::connect(&endpoint);
    let transport = match tokio::time::timeout(lifecycle.config.connect_timeout, connect).await {
        Ok(Ok(transport)) => transport,
        Ok(Err(Error::Io(e))) => return Err(Error::Connect(e)),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(Error::ConnectTimeout),
    };
    driver::install_connection(lifecycle, transport, generation)
}

/// Opens the file synchronously and captures the metadata the transfer
/// announcement needs. Any failure here collapses into `FileNotFound`.
///
/// 同步打开文件并采集传输宣告所需的元数据。此处的任何失败都归并为
/// `FileNotFound`。
fn open_file_request(
    path: &Path,
    recipient_kind: RecipientKind,
    recipient_id: String,
) -> Result<FileRequest> {
    let not_found = || Error::FileNotFound {
        path: path.to_path_buf(),
    };
    let file = std::fs::File::open(path).map_err(|_| not_found())?;
    let metadata = file.metadata().map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .unwrap_or_else(|| String::from("unnamed"));
    Ok(FileRequest {
        file,
        name,
        size: metadata.len(),
        recipient_kind,
        recipient_id,
    })
}

/// Fluent configuration for a [`Client`]. Everything is fixed at
/// [`build`](Self::build); a built client cannot be re-pointed or re-tuned.
///
/// [`Client`] 的流式配置。一切在 [`build`](Self::build) 时定格；
/// 已构建的客户端无法被重新指向或重新调参。
pub struct ClientBuilder {
    endpoint: Endpoint,
    config: Config,
    listeners: Vec<Box<dyn EventListener>>,
    file_received: Option<FileReceivedCallback>,
}

impl ClientBuilder {
    fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::new(host, port),
            config: Config::default(),
            listeners: Vec::new(),
            file_received: None,
        }
    }

    /// Replaces the tunables wholesale.
    /// 整体替换可调参数。
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Directory where inbound files are saved.
    /// 入站文件的保存目录。
    pub fn save_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file.save_dir = dir.into();
        self
    }

    /// Registers a listener for server-pushed events. Listeners fire in
    /// registration order and live as long as the client.
    ///
    /// 注册一个服务端推送事件的监听器。监听器按注册顺序触发，
    /// 并与客户端同生共死。
    pub fn listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Sets the hook invoked after each inbound file has been fully saved.
    /// 设置每个入站文件完整落盘后调用的钩子。
    pub fn on_file_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(ReceivedFile) + Send + Sync + 'static,
    {
        self.file_received = Some(Arc::new(hook));
        self
    }

    /// Builds the production TCP client.
    /// 构建生产环境下的TCP客户端。
    pub fn build(self) -> Client {
        self.build_with::<TcpTransport>()
    }

    /// Builds a client over a custom transport implementation.
    /// 基于自定义传输实现构建客户端。
    pub fn build_with<T: Transport>(self) -> Client<T> {
        let events = Arc::new(EventSource::new(self.listeners));
        let inner = Arc::new(Lifecycle::new(
            self.endpoint,
            self.config,
            events,
            self.file_received,
        ));
        Client {
            inner,
            _marker: PhantomData,
        }
    }
}
