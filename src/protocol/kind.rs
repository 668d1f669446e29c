//! 定义协议的所有消息类型。
//! Defines all message kinds for the protocol.

use std::fmt;

/// The kind of a message. The first byte of the message header on the wire.
/// 消息类型，消息头在网络传输中的第一个字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// Keep-alive probe.
    /// 保活探测。
    Ping = 0x01,
    /// Answer to a `Ping`.
    /// 对 `Ping` 的应答。
    Pong = 0x02,
    /// RPC request carrying a correlation id.
    /// 携带关联ID的RPC请求。
    RpcRequest = 0x10,
    /// RPC response carrying the correlation id of its request.
    /// 携带其请求关联ID的RPC响应。
    RpcResponse = 0x11,
    /// Announces a file transfer and its metadata.
    /// 宣告一次文件传输及其元数据。
    FileStart = 0x20,
    /// One slice of file data at a given offset.
    /// 位于给定偏移处的一段文件数据。
    FileChunk = 0x21,
    /// Marks a file transfer as complete.
    /// 标记一次文件传输结束。
    FileEnd = 0x22,
    /// Server-pushed event.
    /// 服务端推送的事件。
    Event = 0x30,
}

impl Kind {
    /// 从一个字节尝试转换成 `Kind`。
    /// Tries to convert a byte into a `Kind`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Kind::Ping),
            0x02 => Some(Kind::Pong),
            0x10 => Some(Kind::RpcRequest),
            0x11 => Some(Kind::RpcResponse),
            0x20 => Some(Kind::FileStart),
            0x21 => Some(Kind::FileChunk),
            0x22 => Some(Kind::FileEnd),
            0x30 => Some(Kind::Event),
            _ => None,
        }
    }

    /// 检查该类型是否属于文件传输通道。
    /// Checks if the kind belongs to the file-transfer channel.
    pub fn is_file(&self) -> bool {
        matches!(self, Kind::FileStart | Kind::FileChunk | Kind::FileEnd)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Ping => "PING",
            Kind::Pong => "PONG",
            Kind::RpcRequest => "RPC-REQ",
            Kind::RpcResponse => "RPC-RESP",
            Kind::FileStart => "FILE-START",
            Kind::FileChunk => "FILE-CHUNK",
            Kind::FileEnd => "FILE-END",
            Kind::Event => "EVENT",
        };
        write!(f, "{}", s)
    }
}
