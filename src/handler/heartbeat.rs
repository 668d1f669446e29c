//! 心跳处理：在管道内应答服务端的保活探测。
//! Heartbeat handling: answers the server's keep-alive probes inside the
//! pipeline.
//!
//! Only the reactive half lives here. Initiating pings after read silence
//! and closing the connection on read-idle expiry are timer work and belong
//! to the connection driver.
//!
//! 这里只包含被动应答的一半。读静默后主动发出ping以及读空闲超时后关闭连接
//! 属于定时器工作，由连接驱动负责。

use crate::{
    error::Result,
    pipeline::{Stage, StageContext, StageDecision},
    protocol::Message,
};
use tracing::trace;

/// Pipeline stage answering pings and absorbing pongs.
/// 应答ping并吸收pong的管道阶段。
pub(crate) struct HeartbeatStage;

impl HeartbeatStage {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl Stage for HeartbeatStage {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    fn on_inbound(&mut self, message: Message, ctx: &mut StageContext<'_>) -> Result<StageDecision> {
        match message {
            Message::Ping => {
                trace!("answering ping");
                ctx.send(Message::Pong);
                Ok(StageDecision::Consumed)
            }
            Message::Pong => {
                // Any read already refreshes the idle clock; the pong needs
                // no further bookkeeping.
                trace!("pong received");
                Ok(StageDecision::Consumed)
            }
            other => Ok(StageDecision::Forward(other)),
        }
    }
}
