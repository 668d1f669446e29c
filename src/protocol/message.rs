//! 定义了协议中可以在网络上传输的完整消息。
//! Defines the complete protocol messages that can travel on the network.

use super::kind::Kind;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// The recipient class of a file transfer. One byte on the wire.
/// 文件传输的接收方类别，网络传输中占一个字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecipientKind {
    /// The server itself stores the file.
    /// 服务端自身保存该文件。
    Server = 0x00,
    /// One connected client, addressed by recipient id.
    /// 由接收方ID指定的某个已连接客户端。
    Client = 0x01,
    /// Every connected client.
    /// 所有已连接的客户端。
    Broadcast = 0x02,
}

impl RecipientKind {
    /// 从一个字节尝试转换成 `RecipientKind`。
    /// Tries to convert a byte into a `RecipientKind`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(RecipientKind::Server),
            0x01 => Some(RecipientKind::Client),
            0x02 => Some(RecipientKind::Broadcast),
            _ => None,
        }
    }
}

impl fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecipientKind::Server => "SERVER",
            RecipientKind::Client => "CLIENT",
            RecipientKind::Broadcast => "BROADCAST",
        };
        write!(f, "{}", s)
    }
}

/// A complete protocol message.
///
/// On the wire a message is carried inside one frame:
/// `[total_len: u32][header_len: u32][header][body]`, big-endian, where
/// `total_len` counts everything after itself. The header starts with the
/// [`Kind`] byte followed by kind-specific fields; the body is the opaque
/// payload of the message, if it has one.
///
/// 一条完整的协议消息。
///
/// 网络上一条消息承载于一个帧中：
/// `[total_len: u32][header_len: u32][header][body]`，大端序，
/// 其中 `total_len` 统计其自身之后的所有字节。头部以 [`Kind`] 字节开始，
/// 后随各类型自己的字段；body 是消息的不透明载荷（如果有）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keep-alive probe.
    /// 保活探测。
    Ping,
    /// Answer to a [`Ping`](Message::Ping).
    /// 对 [`Ping`](Message::Ping) 的应答。
    Pong,
    /// An RPC request. `id` correlates the response to this request.
    /// 一个RPC请求。`id` 用于把响应关联回该请求。
    RpcRequest {
        /// Correlation id, unique among outstanding requests.
        id: u32,
        /// Routing key the server dispatches on.
        uri: String,
        /// Opaque request payload.
        body: Bytes,
    },
    /// An RPC response.
    /// 一个RPC响应。
    RpcResponse {
        /// Correlation id copied from the request.
        id: u32,
        /// Application status code.
        code: u16,
        /// Opaque response payload.
        body: Bytes,
    },
    /// Announces a file transfer and its metadata.
    /// 宣告一次文件传输及其元数据。
    FileStart {
        /// Identifies the transfer in following chunk and end messages.
        transfer_id: u32,
        /// Who the server should route the file to.
        recipient_kind: RecipientKind,
        /// Target client id; meaningful for [`RecipientKind::Client`] only.
        recipient_id: String,
        /// Base file name, no directory components.
        name: String,
        /// Announced size in bytes.
        size: u64,
    },
    /// One slice of file data.
    /// 一段文件数据。
    FileChunk {
        /// The transfer this chunk belongs to.
        transfer_id: u32,
        /// Byte offset of this chunk within the file.
        offset: u64,
        /// The chunk data itself.
        data: Bytes,
    },
    /// Marks a file transfer as complete.
    /// 标记一次文件传输结束。
    FileEnd {
        /// The finished transfer.
        transfer_id: u32,
    },
    /// A server-pushed event.
    /// 服务端推送的事件。
    Event {
        /// Event name chosen by the server.
        name: String,
        /// Opaque event payload.
        data: Bytes,
    },
}

impl Message {
    // --- Smart Constructors ---
    // These keep the header fields and the body consistent at the call site.
    // 这些构造函数保证头部字段与body在调用点上保持一致。

    /// Creates a new RPC request message.
    /// 创建一个新的RPC请求消息。
    pub fn rpc_request(id: u32, uri: impl Into<String>, body: Bytes) -> Self {
        Message::RpcRequest {
            id,
            uri: uri.into(),
            body,
        }
    }

    /// Creates a new RPC response message.
    /// 创建一个新的RPC响应消息。
    pub fn rpc_response(id: u32, code: u16, body: Bytes) -> Self {
        Message::RpcResponse { id, code, body }
    }

    /// Creates a new file transfer announcement.
    /// 创建一个新的文件传输宣告消息。
    pub fn file_start(
        transfer_id: u32,
        recipient_kind: RecipientKind,
        recipient_id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
    ) -> Self {
        Message::FileStart {
            transfer_id,
            recipient_kind,
            recipient_id: recipient_id.into(),
            name: name.into(),
            size,
        }
    }

    /// Creates a new file chunk message.
    /// 创建一个新的文件分块消息。
    pub fn file_chunk(transfer_id: u32, offset: u64, data: Bytes) -> Self {
        Message::FileChunk {
            transfer_id,
            offset,
            data,
        }
    }

    /// Creates a new end-of-transfer message.
    /// 创建一个新的传输结束消息。
    pub fn file_end(transfer_id: u32) -> Self {
        Message::FileEnd { transfer_id }
    }

    /// Creates a new server event message.
    /// 创建一个新的服务端事件消息。
    pub fn event(name: impl Into<String>, data: Bytes) -> Self {
        Message::Event {
            name: name.into(),
            data,
        }
    }

    // --- End of Smart Constructors ---

    /// 获取消息的类型字节。
    /// Gets the kind of the message.
    pub fn kind(&self) -> Kind {
        match self {
            Message::Ping => Kind::Ping,
            Message::Pong => Kind::Pong,
            Message::RpcRequest { .. } => Kind::RpcRequest,
            Message::RpcResponse { .. } => Kind::RpcResponse,
            Message::FileStart { .. } => Kind::FileStart,
            Message::FileChunk { .. } => Kind::FileChunk,
            Message::FileEnd { .. } => Kind::FileEnd,
            Message::Event { .. } => Kind::Event,
        }
    }

    /// Returns the opaque body of the message, if it carries one.
    /// 返回消息的不透明body（如果有）。
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            Message::RpcRequest { body, .. } => Some(body),
            Message::RpcResponse { body, .. } => Some(body),
            Message::FileChunk { data, .. } => Some(data),
            Message::Event { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Encodes the message as `[header_len][header][body]`, everything a
    /// frame carries after its total-length prefix. Fails with
    /// [`Error::MessageTooLarge`] when a string field exceeds its u16
    /// length prefix; nothing is written to `buf` in that case.
    ///
    /// 将消息编码为 `[header_len][header][body]`，
    /// 即一个帧在总长度前缀之后承载的全部内容。字符串字段超出其u16长度
    /// 前缀时以 [`Error::MessageTooLarge`] 失败；此时不会向 `buf` 写入
    /// 任何内容。
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let mut header = BytesMut::with_capacity(64);
        header.put_u8(self.kind() as u8);
        match self {
            Message::Ping | Message::Pong => {}
            Message::RpcRequest { id, uri, .. } => {
                header.put_u32(*id);
                put_string(&mut header, uri)?;
            }
            Message::RpcResponse { id, code, .. } => {
                header.put_u32(*id);
                header.put_u16(*code);
            }
            Message::FileStart {
                transfer_id,
                recipient_kind,
                recipient_id,
                name,
                size,
            } => {
                header.put_u32(*transfer_id);
                header.put_u8(*recipient_kind as u8);
                put_string(&mut header, recipient_id)?;
                put_string(&mut header, name)?;
                header.put_u64(*size);
            }
            Message::FileChunk {
                transfer_id,
                offset,
                ..
            } => {
                header.put_u32(*transfer_id);
                header.put_u64(*offset);
            }
            Message::FileEnd { transfer_id } => {
                header.put_u32(*transfer_id);
            }
            Message::Event { name, .. } => {
                put_string(&mut header, name)?;
            }
        }
        buf.put_u32(header.len() as u32);
        buf.put_slice(&header);
        if let Some(body) = self.body() {
            buf.put_slice(body);
        }
        Ok(())
    }

    /// Computes the exact number of bytes [`Message::encode`] would produce,
    /// without encoding. Fails the same way `encode` does.
    ///
    /// 计算 [`Message::encode`] 将产生的确切字节数，但不实际编码。
    /// 失败条件与 `encode` 相同。
    pub fn encoded_len(&self) -> Result<usize> {
        let string_field = |s: &str| {
            if s.len() > u16::MAX as usize {
                Err(Error::MessageTooLarge)
            } else {
                Ok(2 + s.len())
            }
        };
        let header = match self {
            Message::Ping | Message::Pong => 1,
            Message::RpcRequest { uri, .. } => 1 + 4 + string_field(uri)?,
            Message::RpcResponse { .. } => 1 + 4 + 2,
            Message::FileStart {
                recipient_id, name, ..
            } => 1 + 4 + 1 + string_field(recipient_id)? + string_field(name)? + 8,
            Message::FileChunk { .. } => 1 + 4 + 8,
            Message::FileEnd { .. } => 1 + 4,
            Message::Event { name, .. } => 1 + string_field(name)?,
        };
        let body = self.body().map_or(0, |b| b.len());
        Ok(4 + header + body)
    }

    /// Decodes one message from the content of a complete frame (everything
    /// after the total-length prefix). Consumes the whole buffer; trailing
    /// bytes past the header become the message body.
    ///
    /// 从一个完整帧的内容（总长度前缀之后的全部字节）解码出一条消息。
    /// 整个缓冲区都会被消费；头部之后的剩余字节成为消息的body。
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.remaining() < 4 {
            return Err(Error::MalformedFrame("frame too short for header length"));
        }
        let header_len = frame.get_u32() as usize;
        if header_len == 0 {
            return Err(Error::MalformedFrame("empty message header"));
        }
        if header_len > frame.remaining() {
            return Err(Error::MalformedFrame("header length exceeds frame"));
        }
        let mut header = frame.split_to(header_len);
        let body = frame;

        let kind = get_u8(&mut header)
            .and_then(Kind::from_u8)
            .ok_or(Error::MalformedFrame("unknown message kind"))?;

        match kind {
            Kind::Ping => Ok(Message::Ping),
            Kind::Pong => Ok(Message::Pong),
            Kind::RpcRequest => {
                let id = get_u32(&mut header)?;
                let uri = get_string(&mut header)?;
                Ok(Message::RpcRequest { id, uri, body })
            }
            Kind::RpcResponse => {
                let id = get_u32(&mut header)?;
                let code = get_u16(&mut header)?;
                Ok(Message::RpcResponse { id, code, body })
            }
            Kind::FileStart => {
                let transfer_id = get_u32(&mut header)?;
                let recipient_kind = get_u8(&mut header)
                    .and_then(RecipientKind::from_u8)
                    .ok_or(Error::MalformedFrame("unknown recipient kind"))?;
                let recipient_id = get_string(&mut header)?;
                let name = get_string(&mut header)?;
                let size = get_u64(&mut header)?;
                Ok(Message::FileStart {
                    transfer_id,
                    recipient_kind,
                    recipient_id,
                    name,
                    size,
                })
            }
            Kind::FileChunk => {
                let transfer_id = get_u32(&mut header)?;
                let offset = get_u64(&mut header)?;
                Ok(Message::FileChunk {
                    transfer_id,
                    offset,
                    data: body,
                })
            }
            Kind::FileEnd => {
                let transfer_id = get_u32(&mut header)?;
                Ok(Message::FileEnd { transfer_id })
            }
            Kind::Event => {
                let name = get_string(&mut header)?;
                Ok(Message::Event { name, data: body })
            }
        }
    }
}

/// Writes a u16-length-prefixed UTF-8 string field. Refuses strings the
/// prefix cannot describe instead of truncating the length.
///
/// 写入一个带u16长度前缀的UTF-8字符串字段。前缀无法描述的字符串会被
/// 拒绝，而不是截断其长度。
fn put_string<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::MessageTooLarge);
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Option<u8> {
    if buf.remaining() < 1 {
        return None;
    }
    Some(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(Error::MalformedFrame("truncated header field"));
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::MalformedFrame("truncated header field"));
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::MalformedFrame("truncated header field"));
    }
    Ok(buf.get_u64())
}

/// Reads a u16-length-prefixed UTF-8 string field.
/// 读取一个带u16长度前缀的UTF-8字符串字段。
fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::MalformedFrame("truncated string field"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::MalformedFrame("string field is not valid UTF-8"))
}
