//! The protocol module, containing the message model and the frame codec.
//! protocol 模块，包含消息模型与帧编解码的定义。

pub mod codec;
pub mod kind;
pub mod message;

pub use codec::{FrameSplitter, MAX_FRAME_LENGTH, encode_frame};
pub use kind::Kind;
pub use message::{Message, RecipientKind};
