//! 服务端事件分发：监听器注册与按序扇出。
//! Server event dispatch: listener registration and in-order fan-out.

use crate::{
    error::Result,
    pipeline::{Stage, StageContext, StageDecision},
    protocol::Message,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// An event pushed by the server.
/// 服务端推送的一个事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    /// The event name chosen by the server.
    /// 服务端选定的事件名称。
    pub name: String,
    /// Opaque event payload.
    /// 不透明的事件载荷。
    pub data: Bytes,
}

/// A listener invoked for every inbound server event, in arrival order.
///
/// Listeners are registered on the builder before the client exists and
/// live as long as the client; there is no deregistration. They run on the
/// connection driver task, so heavy work should be handed off elsewhere.
///
/// 对每个入站服务端事件按到达顺序调用的监听器。
///
/// 监听器在客户端创建前通过构建器注册，并与客户端同生共死，没有注销机制。
/// 它们运行在连接驱动任务上，繁重的工作应当移交到别处执行。
pub trait EventListener: Send + Sync {
    /// Called once per inbound event.
    /// 每个入站事件调用一次。
    fn on_event(&self, event: &ServerEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event)
    }
}

/// The registered listener set. Immutable once built; fan-out preserves
/// registration order for each event.
///
/// 已注册的监听器集合。构建后不可变；扇出时对每个事件保持注册顺序。
pub(crate) struct EventSource {
    listeners: Vec<Box<dyn EventListener>>,
}

impl EventSource {
    pub(crate) fn new(listeners: Vec<Box<dyn EventListener>>) -> Self {
        Self { listeners }
    }

    /// Hands one event to every listener, in registration order.
    /// 按注册顺序把一个事件交给每个监听器。
    pub(crate) fn dispatch(&self, event: &ServerEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

/// Pipeline stage fanning inbound events out to the listener set.
/// 将入站事件扇出给监听器集合的管道阶段。
pub(crate) struct EventStage {
    source: Arc<EventSource>,
}

impl EventStage {
    pub(crate) fn new(source: Arc<EventSource>) -> Self {
        Self { source }
    }
}

impl Stage for EventStage {
    fn name(&self) -> &'static str {
        "event"
    }

    fn on_inbound(&mut self, message: Message, _ctx: &mut StageContext<'_>) -> Result<StageDecision> {
        match message {
            Message::Event { name, data } => {
                let event = ServerEvent { name, data };
                debug!(name = %event.name, "dispatching server event");
                self.source.dispatch(&event);
                Ok(StageDecision::Consumed)
            }
            other => Ok(StageDecision::Forward(other)),
        }
    }
}
