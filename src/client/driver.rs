//! 单个连接的装配与I/O驱动任务。
//! Per-connection wiring and the I/O driver task.

use super::lifecycle::{HandlerSet, Lifecycle};
use crate::{
    error::{Error, Result},
    handler::{
        event::EventStage,
        file::{FileHandler, FilePump, FileStage},
        rpc::{RpcHandler, RpcStage},
    },
    pipeline::{Pipeline, StageContext},
    protocol::Message,
    transport::Transport,
};
use bytes::BytesMut;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, info, trace, warn};

/// Granularity of the driver's timer branch (idle checks, RPC expiry).
/// 驱动定时器分支的粒度（空闲检查、RPC超时扫描）。
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Spare buffer capacity kept ready ahead of each socket read.
/// 每次套接字读取前预留的空余缓冲容量。
const READ_CHUNK: usize = 16 * 1024;

/// Wires a freshly connected transport into a running connection: channels,
/// handler set, pipeline, pump and the driver task itself. The usable
/// notification fires exactly once, from the driver, after the chain is
/// assembled and before any frame is processed.
///
/// 把一个刚建立的传输装配成运行中的连接：通道、处理器集合、管道、泵以及
/// 驱动任务本身。可用通知由驱动恰好发出一次，时点在链组装完成之后、任何
/// 帧被处理之前。
pub(crate) fn install_connection<T: Transport>(
    lifecycle: &Arc<Lifecycle>,
    transport: T,
    generation: u64,
) -> Result<()> {
    let config = &lifecycle.config;

    // Control plane is unbounded so submissions never block; file chunks
    // ride the bounded data channel, which is what throttles disk reads.
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (data_tx, data_rx) = mpsc::channel(config.file.chunk_buffer);
    let (file_tx, file_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let rpc = Arc::new(RpcHandler::new(
        control_tx.clone(),
        config.rpc.response_timeout,
    ));
    let handlers = HandlerSet {
        rpc: rpc.clone(),
        file: FileHandler::new(file_tx),
    };

    let pump = FilePump::new(file_rx, data_tx, config.file.chunk_size);
    let pump_task = tokio::spawn(pump.run());

    if !lifecycle.register_tasks(generation, shutdown_tx, pump_task) {
        // Released or superseded while we were connecting. The transport
        // drops here and the socket closes with it.
        return Err(Error::Released);
    }

    let pipeline = Pipeline::assemble(
        FileStage::new(
            config.file.save_dir.clone(),
            lifecycle.file_received.clone(),
        ),
        RpcStage::new(rpc.clone()),
        EventStage::new(lifecycle.events.clone()),
    );
    debug!(stages = ?pipeline.stage_names(), "pipeline assembled");

    let driver = ConnectionDriver {
        lifecycle: lifecycle.clone(),
        generation,
        transport,
        pipeline,
        rpc,
        control_tx,
        control_rx,
        data_rx,
        shutdown_rx,
        ping_interval: config.idle.ping_interval,
        read_timeout: config.idle.read_timeout,
    };
    tokio::spawn(driver.run(handlers));
    Ok(())
}

/// The per-connection I/O task: feeds inbound bytes to the pipeline, writes
/// outbound messages, and runs the timer branch for heartbeats, read-idle
/// expiry and RPC timeouts.
///
/// 每个连接的I/O任务：把入站字节喂给管道、写出出站消息，并运行负责心跳、
/// 读空闲超时和RPC超时的定时器分支。
struct ConnectionDriver<T: Transport> {
    lifecycle: Arc<Lifecycle>,
    generation: u64,
    transport: T,
    pipeline: Pipeline,
    rpc: Arc<RpcHandler>,
    control_tx: mpsc::UnboundedSender<Message>,
    control_rx: mpsc::UnboundedReceiver<Message>,
    data_rx: mpsc::Receiver<Message>,
    shutdown_rx: oneshot::Receiver<()>,
    ping_interval: Duration,
    read_timeout: Duration,
}

impl<T: Transport> ConnectionDriver<T> {
    async fn run(self, handlers: HandlerSet) {
        let ConnectionDriver {
            lifecycle,
            generation,
            mut transport,
            mut pipeline,
            rpc,
            control_tx,
            mut control_rx,
            mut data_rx,
            mut shutdown_rx,
            ping_interval,
            read_timeout,
        } = self;

        // If anything on this task unwinds, the closed transition must
        // still run; a dead driver behind a `Usable` state would swallow
        // every later send.
        let mut close_guard = CloseGuard {
            lifecycle: lifecycle.clone(),
            generation,
            armed: true,
        };

        // The usable flip happens before the first frame can possibly be
        // dispatched; the replayed backlog goes out ahead of new traffic.
        lifecycle.on_connection_usable(generation, handlers);

        let peer = transport.peer_addr().ok();
        info!(peer = ?peer, "connection driver running");

        let mut read_buf = BytesMut::with_capacity(READ_CHUNK);
        let mut last_read = Instant::now();
        let mut last_ping = Instant::now();
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        let reason: Error = loop {
            read_buf.reserve(READ_CHUNK);
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("driver shutdown requested");
                    break Error::Released;
                }
                read = transport.read(&mut read_buf) => {
                    match read {
                        Ok(0) => break Error::ConnectionClosed,
                        Ok(n) => {
                            trace!(bytes = n, "read from transport");
                            last_read = Instant::now();
                            let mut ctx = StageContext::new(&control_tx);
                            if let Err(e) = pipeline.feed(&mut read_buf, &mut ctx) {
                                break e;
                            }
                        }
                        Err(e) => break e,
                    }
                }
                Some(message) = control_rx.recv() => {
                    if let Err(e) = write_message(&mut transport, &pipeline, &message, read_timeout).await {
                        break e;
                    }
                }
                Some(message) = data_rx.recv() => {
                    if let Err(e) = write_message(&mut transport, &pipeline, &message, read_timeout).await {
                        break e;
                    }
                }
                _ = tick.tick() => {
                    if lifecycle.is_released() {
                        break Error::Released;
                    }
                    let idle = last_read.elapsed();
                    if idle >= read_timeout {
                        warn!(idle_ms = idle.as_millis() as u64, "read-idle timeout expired");
                        break Error::ConnectionTimeout;
                    }
                    if idle >= ping_interval && last_ping.elapsed() >= ping_interval {
                        last_ping = Instant::now();
                        if let Err(e) = write_message(&mut transport, &pipeline, &Message::Ping, read_timeout).await {
                            break e;
                        }
                    }
                    rpc.expire(Instant::now());
                }
            }
        };

        // Close both queues before the state flips: a submit racing the
        // teardown then fails its send and cleans up after itself, while
        // everything already queued is swept by the closed transition.
        control_rx.close();
        data_rx.close();

        let _ = transport.shutdown().await;
        debug!(reason = %reason, "connection driver stopped");
        close_guard.armed = false;
        lifecycle.on_connection_closed(generation, &reason);
    }
}

/// Runs the closed transition when the driver task unwinds instead of
/// reaching its normal teardown: a panicking user callback must not leave
/// the client stuck `Usable` behind a dead task.
///
/// 当驱动任务在到达正常拆除逻辑之前展开时，执行关闭转换：用户回调的panic
/// 不能让客户端卡在一个背后已无任务的 `Usable` 状态。
struct CloseGuard {
    lifecycle: Arc<Lifecycle>,
    generation: u64,
    armed: bool,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if self.armed {
            self.lifecycle
                .on_connection_closed(self.generation, &Error::ConnectionClosed);
        }
    }
}

/// Writes one message within `limit`. A peer that stops draining its socket
/// must not wedge the driver loop forever.
///
/// 在 `limit` 时间内写出一条消息。停止排空其套接字的对端不能让驱动循环
/// 永远卡死。
async fn write_message<T: Transport>(
    transport: &mut T,
    pipeline: &Pipeline,
    message: &Message,
    limit: Duration,
) -> Result<()> {
    trace!(kind = %message.kind(), "outbound message");
    let frame = pipeline.encode(message)?;
    match tokio::time::timeout(limit, transport.write(&frame)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(kind = %message.kind(), "write stalled past the timeout");
            Err(Error::ConnectionTimeout)
        }
    }
}
