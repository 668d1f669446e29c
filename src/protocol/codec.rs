//! 帧封装的编解码：TCP字节流的切分与消息的封帧。
//! Frame envelope codec: splitting the TCP byte stream and framing messages.

use super::message::Message;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The maximum length of a single frame, counted after the total-length
/// prefix. A frame claiming more than this is malformed and fatal to the
/// connection carrying it.
///
/// 单个帧的最大长度（不含总长度前缀）。
/// 声称超过该值的帧视为畸形帧，对承载它的连接是致命的。
pub const MAX_FRAME_LENGTH: usize = 2 * 1024 * 1024;

/// Splits a raw inbound byte stream into complete frames.
///
/// The envelope is `[total_len: u32][header_len: u32][header][body]`,
/// big-endian; `total_len` counts everything after itself. A partial frame
/// stays in the buffer untouched until the rest of its bytes arrive.
///
/// 将入站原始字节流切分成完整的帧。
///
/// 帧封装为 `[total_len: u32][header_len: u32][header][body]`，大端序；
/// `total_len` 统计其自身之后的所有字节。
/// 不完整的帧会原样留在缓冲区中，直到其余字节到达。
#[derive(Debug, Default)]
pub struct FrameSplitter;

impl FrameSplitter {
    /// Creates a new splitter.
    /// 创建一个新的切分器。
    pub fn new() -> Self {
        Self
    }

    /// Extracts the next complete frame's content from `buf`, or `None` if
    /// only a partial frame has arrived so far. The returned bytes start at
    /// the header-length field; the total-length prefix is consumed.
    ///
    /// 从 `buf` 中取出下一个完整帧的内容；若目前只到达了不完整的帧则返回
    /// `None`。返回的字节从头部长度字段开始，总长度前缀已被消费。
    pub fn next_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total < 4 {
            return Err(Error::MalformedFrame("frame length below minimum"));
        }
        if total > MAX_FRAME_LENGTH {
            return Err(Error::MalformedFrame("frame length exceeds maximum"));
        }
        if buf.len() < 4 + total {
            return Ok(None);
        }
        buf.advance(4);
        Ok(Some(buf.split_to(total).freeze()))
    }
}

/// Encodes one message into a single wire frame, total-length prefix
/// included. Fails with [`Error::MessageTooLarge`] for messages a peer
/// would reject as exceeding [`MAX_FRAME_LENGTH`].
///
/// 将一条消息编码成单个线上帧，包含总长度前缀。超过 [`MAX_FRAME_LENGTH`]、
/// 会被对端拒绝的消息以 [`Error::MessageTooLarge`] 失败。
pub fn encode_frame(message: &Message) -> Result<Bytes> {
    let mut content = BytesMut::with_capacity(128);
    message.encode(&mut content)?;
    if content.len() > MAX_FRAME_LENGTH {
        return Err(Error::MessageTooLarge);
    }
    let mut frame = BytesMut::with_capacity(4 + content.len());
    frame.put_u32(content.len() as u32);
    frame.extend_from_slice(&content);
    Ok(frame.freeze())
}
