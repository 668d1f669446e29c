//! 协议处理管道：按固定顺序组装的处理阶段链。
//! The protocol processing pipeline: a chain of stages assembled in a fixed
//! order.
//!
//! Inbound bytes pass through the frame splitter first (stages only ever see
//! whole frames), then the decoder, then every semantic stage in order, with
//! the business stage last as the catch-all. Outbound messages pass through
//! the encoder only; no semantic stage sees them.
//!
//! 入站字节先经过帧切分器（各阶段只会看到完整的帧），然后是解码器，
//! 随后按顺序经过各语义阶段，业务阶段位于末尾兜底。
//! 出站消息只经过编码器，任何语义阶段都不会看到它们。

use crate::{
    error::{Error, Result},
    handler::{event::EventStage, file::FileStage, heartbeat::HeartbeatStage, rpc::RpcStage},
    protocol::{self, FrameSplitter, Message},
};
use bytes::{Bytes, BytesMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// What a stage decided about one inbound message.
/// 一个阶段对一条入站消息做出的决定。
pub(crate) enum StageDecision {
    /// The stage claimed the message; no later stage sees it.
    /// 该阶段认领了这条消息，后续阶段不会再看到它。
    Consumed,
    /// The message is handed to the next stage in the chain.
    /// 这条消息交给链中的下一个阶段。
    Forward(Message),
}

/// Context handed to stages while they process inbound messages.
///
/// Stages use it to emit outbound messages (a pong answering a ping, for
/// example) without ever blocking the connection driver.
///
/// 阶段在处理入站消息时获得的上下文。
///
/// 阶段通过它发出出站消息（例如用pong应答ping），且永远不会阻塞连接驱动。
pub(crate) struct StageContext<'a> {
    outbound: &'a mpsc::UnboundedSender<Message>,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(outbound: &'a mpsc::UnboundedSender<Message>) -> Self {
        Self { outbound }
    }

    /// Queues a message for transmission on this connection. A send failure
    /// only happens while the driver is tearing down, so it is ignored.
    ///
    /// 将一条消息排入此连接的发送队列。发送失败只会发生在驱动拆除期间，
    /// 因此直接忽略。
    pub(crate) fn send(&self, message: Message) {
        let _ = self.outbound.send(message);
    }
}

/// One named stage of the inbound processing chain. Stages are owned by the
/// pipeline, which is borrowed across await points on the driver task, so
/// they must be `Sync` as well as `Send`.
///
/// 入站处理链中的一个具名阶段。阶段由管道持有，而管道会在驱动任务的
/// await点之间被借用，因此除 `Send` 外还必须是 `Sync`。
pub(crate) trait Stage: Send + Sync {
    /// The name used in pipeline diagnostics.
    /// 用于管道诊断的名称。
    fn name(&self) -> &'static str;

    /// Processes one inbound message.
    /// 处理一条入站消息。
    fn on_inbound(&mut self, message: Message, ctx: &mut StageContext<'_>) -> Result<StageDecision>;
}

/// The per-connection processing pipeline.
///
/// 每个连接的处理管道。
pub(crate) struct Pipeline {
    splitter: FrameSplitter,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Assembles the stage chain for one connection. The order is fixed
    /// here and cannot be changed afterwards.
    ///
    /// 为一个连接组装阶段链。顺序在此固定，此后无法更改。
    pub(crate) fn assemble(file: FileStage, rpc: RpcStage, event: EventStage) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(HeartbeatStage::new()),
            Box::new(file),
            Box::new(rpc),
            Box::new(event),
            Box::new(BusinessStage::new()),
        ];
        Self {
            splitter: FrameSplitter::new(),
            stages,
        }
    }

    /// The ordered stage names, for diagnostics.
    /// 按顺序排列的阶段名称，用于诊断。
    pub(crate) fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Feeds freshly read bytes through the splitter, the decoder and the
    /// stage chain. Complete frames are consumed from `buf`; a trailing
    /// partial frame stays for the next read.
    ///
    /// 将新读取的字节送入切分器、解码器和阶段链。
    /// 完整的帧会从 `buf` 中消费掉，末尾不完整的帧留待下一次读取。
    pub(crate) fn feed(&mut self, buf: &mut BytesMut, ctx: &mut StageContext<'_>) -> Result<()> {
        while let Some(frame) = self.splitter.next_frame(buf)? {
            let message = Message::decode(frame)?;
            trace!(kind = %message.kind(), "inbound message");
            self.dispatch(message, ctx)?;
        }
        Ok(())
    }

    /// Runs one decoded message down the stage chain in order. A panic out
    /// of a stage (user listener code runs inside them) is caught here and
    /// reported as that stage's failure instead of unwinding the driver.
    ///
    /// 让一条已解码的消息按顺序流经阶段链。阶段抛出的panic（用户监听器
    /// 代码在阶段内运行）在此被捕获，记作该阶段的失败，而不会让驱动
    /// 任务展开。
    fn dispatch(&mut self, message: Message, ctx: &mut StageContext<'_>) -> Result<()> {
        let mut current = message;
        for stage in &mut self.stages {
            // A failed or panicked stage is fatal to its connection; the
            // pipeline is dropped without being used again.
            let outcome = catch_unwind(AssertUnwindSafe(|| stage.on_inbound(current, ctx)));
            match outcome {
                Ok(Ok(StageDecision::Consumed)) => return Ok(()),
                Ok(Ok(StageDecision::Forward(next))) => current = next,
                Ok(Err(e)) => {
                    error!(stage = stage.name(), error = %e, "stage failed while processing a frame");
                    return Err(Error::HandlerDispatch(stage.name()));
                }
                Err(_) => {
                    error!(stage = stage.name(), "stage panicked while processing a frame");
                    return Err(Error::HandlerDispatch(stage.name()));
                }
            }
        }
        debug!("message fell through every stage");
        Ok(())
    }

    /// Encodes one outbound message into a complete wire frame. Refuses
    /// messages that cannot fit a single frame.
    ///
    /// 将一条出站消息编码为一个完整的线上帧。无法装进单个帧的消息会被
    /// 拒绝。
    pub(crate) fn encode(&self, message: &Message) -> Result<Bytes> {
        protocol::encode_frame(message)
    }
}

/// The terminal catch-all stage. It claims whatever no earlier stage
/// claimed, so unknown-but-well-formed traffic never kills the connection.
///
/// 链末端的兜底阶段。它认领所有前面阶段未认领的消息，
/// 因此格式正确但未知的流量不会导致连接被关闭。
pub(crate) struct BusinessStage;

impl BusinessStage {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Stage for BusinessStage {
    fn name(&self) -> &'static str {
        "business"
    }

    fn on_inbound(&mut self, message: Message, _ctx: &mut StageContext<'_>) -> Result<StageDecision> {
        debug!(kind = %message.kind(), "message reached the business stage unclaimed");
        Ok(StageDecision::Consumed)
    }
}
