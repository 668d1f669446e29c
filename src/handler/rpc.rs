//! RPC处理：关联ID分配、响应匹配与请求超时。
//! RPC handling: correlation-id allocation, response matching and request
//! timeouts.

use crate::{
    error::{Error, Result},
    pipeline::{Stage, StageContext, StageDecision},
    protocol::{MAX_FRAME_LENGTH, Message},
};
use bytes::Bytes;
use dashmap::DashMap;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, warn};

/// An application RPC request: a routing uri plus an opaque payload.
/// 一个应用层RPC请求：一个路由uri加一段不透明载荷。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    /// Routing key the server dispatches on.
    /// 服务端据以分发的路由键。
    pub uri: String,
    /// Opaque request payload.
    /// 不透明的请求载荷。
    pub body: Bytes,
}

impl RpcRequest {
    /// Creates a new request.
    /// 创建一个新的请求。
    pub fn new(uri: impl Into<String>, body: Bytes) -> Self {
        Self {
            uri: uri.into(),
            body,
        }
    }
}

/// A successful RPC response.
/// 一个成功的RPC响应。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    /// Application status code.
    /// 应用层状态码。
    pub code: u16,
    /// Opaque response payload.
    /// 不透明的响应载荷。
    pub body: Bytes,
}

/// The callback invoked at most once with the outcome of an RPC request.
/// Lives in the shared correlation map until claimed, hence `Send + Sync`.
///
/// 以RPC请求的结果至多调用一次的回调。在被认领之前存放于共享的关联表中，
/// 因此要求 `Send + Sync`。
pub type RpcCallback = Box<dyn FnOnce(Result<RpcResponse>) + Send + Sync + 'static>;

struct PendingRpc {
    callback: RpcCallback,
    deadline: Instant,
}

/// Per-connection RPC handler: owns the correlation map and the submission
/// path onto the wire.
///
/// `submit` never blocks; it records the callback and pushes the request
/// message into the unbounded control channel. At-most-once invocation is
/// structural: whichever path removes a map entry is the only holder of its
/// `FnOnce`.
///
/// 每个连接的RPC处理器：持有关联表以及把请求送上网络的提交路径。
///
/// `submit` 永不阻塞；它记录回调并把请求消息推入无界控制通道。
/// 回调至多调用一次由结构保证：从表中移除条目的那条路径是其 `FnOnce`
/// 的唯一持有者。
pub(crate) struct RpcHandler {
    outbound: mpsc::UnboundedSender<Message>,
    pending: DashMap<u32, PendingRpc>,
    next_id: AtomicU32,
    response_timeout: Duration,
    closed: AtomicBool,
}

impl RpcHandler {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<Message>, response_timeout: Duration) -> Self {
        Self {
            outbound,
            pending: DashMap::new(),
            // Random starting point so ids from consecutive connections
            // don't collide in server-side logs.
            next_id: AtomicU32::new(rand::random()),
            response_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Submits one request. The callback fires later with the response, a
    /// timeout, or a connection failure; a request too large for a single
    /// frame is refused through the callback without touching the wire.
    ///
    /// 提交一个请求。回调稍后以响应、超时或连接失败的结果被调用；
    /// 无法装进单个帧的请求经由回调拒绝，不会触及网络。
    pub(crate) fn submit(&self, request: RpcRequest, callback: RpcCallback) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, uri = %request.uri, "rpc request submitted");

        let message = Message::rpc_request(id, request.uri, request.body);
        let fits = matches!(message.encoded_len(), Ok(len) if len <= MAX_FRAME_LENGTH);
        if !fits {
            warn!(id, "rpc request does not fit a single frame; refused");
            callback(Err(Error::MessageTooLarge));
            return;
        }

        let deadline = Instant::now() + self.response_timeout;
        self.pending.insert(id, PendingRpc { callback, deadline });
        if self.outbound.send(message).is_err() || self.closed.load(Ordering::SeqCst) {
            // The driver is gone or going; take the entry back and fail it.
            if let Some((_, pending)) = self.pending.remove(&id) {
                (pending.callback)(Err(Error::ConnectionClosed));
            }
        }
    }

    /// Resolves one inbound response. Returns `false` when the id is
    /// unknown, which happens after the request already timed out.
    ///
    /// 结算一个入站响应。当ID未知时返回 `false`，
    /// 这通常发生在请求已经超时之后。
    fn resolve(&self, id: u32, response: RpcResponse) -> bool {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                (pending.callback)(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fails every request whose deadline has passed. Driven by the
    /// connection driver's timer tick.
    ///
    /// 使所有已过截止时间的请求失败。由连接驱动的定时器触发。
    pub(crate) fn expire(&self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();
        for id in expired {
            if let Some((_, pending)) = self.pending.remove(&id) {
                warn!(id, "rpc request timed out");
                (pending.callback)(Err(Error::RpcTimeout));
            }
        }
    }

    /// Fails every outstanding request with `ConnectionClosed`. Called when
    /// the connection goes down.
    ///
    /// 以 `ConnectionClosed` 使所有在途请求失败。在连接断开时调用。
    pub(crate) fn fail_all(&self) {
        // The flag first: a submit racing this sweep then cleans up after
        // itself instead of leaving its entry in a map nobody reads again.
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                (pending.callback)(Err(Error::ConnectionClosed));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

/// Pipeline stage matching inbound responses to outstanding requests.
/// 将入站响应匹配到在途请求的管道阶段。
pub(crate) struct RpcStage {
    handler: Arc<RpcHandler>,
}

impl RpcStage {
    pub(crate) fn new(handler: Arc<RpcHandler>) -> Self {
        Self { handler }
    }
}

impl Stage for RpcStage {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn on_inbound(&mut self, message: Message, _ctx: &mut StageContext<'_>) -> Result<StageDecision> {
        match message {
            Message::RpcResponse { id, code, body } => {
                if !self.handler.resolve(id, RpcResponse { code, body }) {
                    debug!(id, "response for an rpc id no longer outstanding");
                }
                Ok(StageDecision::Consumed)
            }
            other => Ok(StageDecision::Forward(other)),
        }
    }
}
