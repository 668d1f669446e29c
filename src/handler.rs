//! The handler module, containing the per-channel protocol handlers.
//! handler 模块，包含各个通道的协议处理器。

pub mod event;
pub mod file;
pub(crate) mod heartbeat;
pub mod rpc;

pub use event::{EventListener, ServerEvent};
pub use file::{FileCallback, ReceivedFile};
pub use rpc::{RpcCallback, RpcRequest, RpcResponse};
