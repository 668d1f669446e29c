//! 连接生命周期管理：状态翻转、发送路由与发送池重放。
//! Connection lifecycle management: state flips, send routing and send-pool
//! replay.
//!
//! This is the heart of the client. Every send call makes its
//! check-and-route decision inside one critical section over the lifecycle
//! state, so a state flip can never slip between the check and the enqueue;
//! the usable flip and the pool swap happen in that same critical section.
//! No lock is ever held across an `.await` or a user callback.
//!
//! 这里是客户端的心脏。每个发送调用都在同一个临界区内完成对生命周期状态的
//! 检查与路由决策，因此状态翻转绝不会插进检查与入池之间；可用翻转与发送池
//! 换出也发生在同一个临界区里。任何锁都不会跨越 `.await` 或用户回调持有。

use super::send_pool::SendPool;
use crate::{
    config::{Config, Endpoint},
    error::{Error, Result},
    handler::{
        event::EventSource,
        file::{FileCallback, FileHandler, FileReceivedCallback, FileRequest},
        rpc::{RpcCallback, RpcHandler, RpcRequest},
    },
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

/// The externally observable connection state.
/// 对外可观察的连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt has ever succeeded or is in flight. Also the
    /// state after a failed attempt.
    /// 从未有连接尝试成功或在途。失败的尝试之后也回到这个状态。
    Unconnected,
    /// A connect attempt is in flight.
    /// 一次连接尝试正在进行。
    Connecting,
    /// The connection is established; sends are forwarded directly.
    /// 连接已建立，发送被直接转发。
    Usable,
    /// A previous connection went away, or the client was released. Sends
    /// queue again until the next successful `start`.
    /// 先前的连接已断开，或客户端已被释放。发送重新入池，直到下一次
    /// `start` 成功。
    Closed,
}

/// The handler set installed while a connection is usable.
/// 连接可用期间安装的处理器集合。
#[derive(Clone)]
pub(crate) struct HandlerSet {
    pub(crate) rpc: Arc<RpcHandler>,
    pub(crate) file: FileHandler,
}

/// Handles to one connection's background tasks, kept for teardown.
struct ConnectionTasks {
    shutdown: oneshot::Sender<()>,
    pump: JoinHandle<()>,
}

/// Everything the lifecycle guards with its single lock.
struct LifecycleInner {
    state: ConnectionState,
    /// Bumped by every `start` claim and by `release`; stale connection
    /// attempts identify themselves by carrying an old value.
    generation: u64,
    released: bool,
    pool: SendPool,
    handlers: Option<HandlerSet>,
    tasks: Option<ConnectionTasks>,
}

/// The connection lifecycle manager shared by every clone of the client
/// handle and by the connection driver.
///
/// 由客户端句柄的每个克隆以及连接驱动共享的连接生命周期管理器。
pub(crate) struct Lifecycle {
    pub(crate) endpoint: Endpoint,
    pub(crate) config: Config,
    pub(crate) events: Arc<EventSource>,
    pub(crate) file_received: Option<FileReceivedCallback>,
    inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
    pub(crate) fn new(
        endpoint: Endpoint,
        config: Config,
        events: Arc<EventSource>,
        file_received: Option<FileReceivedCallback>,
    ) -> Self {
        Self {
            endpoint,
            config,
            events,
            file_received,
            inner: Mutex::new(LifecycleInner {
                state: ConnectionState::Unconnected,
                generation: 0,
                released: false,
                pool: SendPool::default(),
                handlers: None,
                tasks: None,
            }),
        }
    }

    /// A poisoned lock only means some holder panicked; the state itself
    /// stays structurally valid, so keep going.
    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current externally visible state.
    /// 当前对外可见的状态。
    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn is_released(&self) -> bool {
        self.lock().released
    }

    /// Claims the right to run one connect attempt. Returns the generation
    /// the attempt must carry through all of its later signals.
    ///
    /// 认领一次连接尝试的执行权。返回该次尝试在其后续所有信号中必须携带的
    /// 代数。
    pub(crate) fn begin_start(&self) -> Result<u64> {
        let mut inner = self.lock();
        if inner.released {
            return Err(Error::Released);
        }
        match inner.state {
            ConnectionState::Connecting | ConnectionState::Usable => {
                return Err(Error::AlreadyStarted);
            }
            ConnectionState::Unconnected | ConnectionState::Closed => {}
        }
        inner.generation += 1;
        inner.state = ConnectionState::Connecting;
        Ok(inner.generation)
    }

    /// Rolls a failed connect attempt back to `Unconnected`. Queued
    /// requests stay queued for the next attempt.
    ///
    /// 将失败的连接尝试回滚到 `Unconnected`。已入池的请求继续留待下一次
    /// 尝试。
    pub(crate) fn connect_failed(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation
            && inner.state == ConnectionState::Connecting
            && !inner.released
        {
            inner.state = ConnectionState::Unconnected;
        }
    }

    /// Registers one connection's background tasks so `release` can tear
    /// them down. Returns `false` when the attempt is stale (released or
    /// superseded); the caller must then abandon the connection.
    ///
    /// 登记一个连接的后台任务，以便 `release` 能够拆除它们。当该次尝试已经
    /// 过期（已释放或被取代）时返回 `false`，调用方必须放弃这个连接。
    pub(crate) fn register_tasks(
        &self,
        generation: u64,
        shutdown: oneshot::Sender<()>,
        pump: JoinHandle<()>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.released || inner.generation != generation {
            pump.abort();
            return false;
        }
        inner.tasks = Some(ConnectionTasks { shutdown, pump });
        true
    }

    /// The one-shot usable transition: installs the handler set, flips the
    /// flag and swaps the queued requests out, all in one critical section.
    /// The snapshot is then replayed outside the lock, files first, then
    /// RPCs, each sequence in its original insertion order.
    ///
    /// A send racing this transition either made it into the snapshot or
    /// observes `Usable` and forwards directly; it can never do both, and
    /// never neither.
    ///
    /// 一次性的可用翻转：在同一个临界区内安装处理器集合、翻转标志并换出已
    /// 入池的请求。随后在锁外重放快照：先文件后RPC，每条序列保持其原始入池
    /// 顺序。
    ///
    /// 与该翻转竞速的发送要么进入了快照，要么观察到 `Usable` 而直接转发；
    /// 绝不会两者皆有，也绝不会两者皆无。
    pub(crate) fn on_connection_usable(&self, generation: u64, handlers: HandlerSet) {
        let (files, rpcs) = {
            let mut inner = self.lock();
            if inner.released
                || inner.generation != generation
                || inner.state != ConnectionState::Connecting
            {
                debug!(generation, "stale usable signal ignored");
                return;
            }
            inner.state = ConnectionState::Usable;
            inner.handlers = Some(handlers.clone());
            inner.pool.take_all()
        };

        info!(
            endpoint = %self.endpoint,
            files = files.len(),
            rpcs = rpcs.len(),
            "connection usable; replaying queued requests"
        );
        for queued in files {
            handlers.file.submit(queued.request, queued.callback);
        }
        for queued in rpcs {
            handlers.rpc.submit(queued.request, queued.callback);
        }
    }

    /// The closed transition. Outstanding RPC callbacks are failed with
    /// `ConnectionClosed`; sends already handed to the file pump fail
    /// through its closed channels. The send pool is left untouched so its
    /// entries survive into the next successful attempt.
    ///
    /// 关闭翻转。在途RPC回调以 `ConnectionClosed` 失败；已交给文件泵的发送
    /// 经由其已关闭的通道失败。发送池原样保留，其中的条目将活到下一次成功
    /// 的尝试。
    pub(crate) fn on_connection_closed(&self, generation: u64, reason: &Error) {
        let handlers = {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(generation, "stale closed signal ignored");
                return;
            }
            inner.state = ConnectionState::Closed;
            inner.tasks = None;
            inner.handlers.take()
        };

        warn!(endpoint = %self.endpoint, reason = %reason, "connection closed");
        if let Some(handlers) = handlers {
            handlers.rpc.fail_all();
        }
    }

    /// Routes one RPC send: forwards when usable, queues otherwise. The
    /// whole decision sits inside the state lock; the actual submission
    /// runs after the lock is dropped.
    ///
    /// 路由一个RPC发送：可用时转发，否则入池。整个决策位于状态锁内；
    /// 实际提交在锁释放之后执行。
    pub(crate) fn route_rpc(&self, request: RpcRequest, callback: RpcCallback) {
        let mut inner = self.lock();
        if inner.released {
            // Accepted and dropped; the callback is abandoned at return,
            // after the lock is gone.
            drop(inner);
            return;
        }
        if inner.state == ConnectionState::Usable {
            if let Some(rpc) = inner.handlers.as_ref().map(|h| h.rpc.clone()) {
                drop(inner);
                rpc.submit(request, callback);
                return;
            }
        }
        inner.pool.push_rpc(request, callback);
    }

    /// Routes one file send; same discipline as [`route_rpc`](Self::route_rpc).
    /// 路由一个文件发送；准则与 [`route_rpc`](Self::route_rpc) 相同。
    pub(crate) fn route_file(&self, request: FileRequest, callback: FileCallback) {
        let mut inner = self.lock();
        if inner.released {
            drop(inner);
            return;
        }
        if inner.state == ConnectionState::Usable {
            if let Some(file) = inner.handlers.as_ref().map(|h| h.file.clone()) {
                drop(inner);
                file.submit(request, callback);
                return;
            }
        }
        inner.pool.push_file(request, callback);
    }

    /// Tears the client down for good. Idempotent. Everything pending, the
    /// queued requests and every uninvoked callback included, is abandoned
    /// without notification; the connection tasks are told to stop and the
    /// pump is aborted mid-transfer if necessary.
    ///
    /// 彻底拆除客户端。幂等。所有未决之物（包括已入池的请求和每个尚未调用
    /// 的回调）都被直接放弃、不作任何通知；连接任务被要求停止，必要时文件
    /// 泵在传输中途被中止。
    pub(crate) fn release(&self) {
        let (tasks, handlers, abandoned) = {
            let mut inner = self.lock();
            if inner.released {
                return;
            }
            inner.released = true;
            inner.generation += 1;
            inner.state = ConnectionState::Closed;
            let abandoned = inner.pool.take_all();
            (inner.tasks.take(), inner.handlers.take(), abandoned)
        };

        info!(endpoint = %self.endpoint, "client released");
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(());
            tasks.pump.abort();
        }
        // Queued entries and handler maps drop here, outside the lock;
        // none of their callbacks is ever invoked.
        drop(abandoned);
        drop(handlers);
    }
}
