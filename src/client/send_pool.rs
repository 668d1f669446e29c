//! 连接可用之前暂存请求的发送池。
//! The send pool holding requests issued before the connection is usable.

use crate::handler::{
    file::{FileCallback, FileRequest},
    rpc::{RpcCallback, RpcRequest},
};
use tracing::debug;

/// One queued RPC request awaiting replay.
/// 一个等待重放的已入池RPC请求。
pub(crate) struct QueuedRpc {
    pub(crate) request: RpcRequest,
    pub(crate) callback: RpcCallback,
}

/// One queued file send awaiting replay. The file is already open.
/// 一个等待重放的已入池文件发送。文件已被打开。
pub(crate) struct QueuedFile {
    pub(crate) request: FileRequest,
    pub(crate) callback: FileCallback,
}

/// Requests accepted while no connection was usable.
///
/// Two independent FIFO sequences, one per request type; insertion order is
/// preserved exactly within each. The pool is unbounded: the send API
/// promises to never block and never reject, and the expected volume is
/// control-plane sized.
///
/// 在没有可用连接时受理的请求。
///
/// 两条彼此独立的FIFO序列，每种请求类型一条；各自内部严格保持入池顺序。
/// 发送池无界：发送API承诺永不阻塞、永不拒绝，而预期的量级也只是控制面
/// 流量的规模。
#[derive(Default)]
pub(crate) struct SendPool {
    files: Vec<QueuedFile>,
    rpcs: Vec<QueuedRpc>,
}

impl SendPool {
    /// Appends an RPC request to its sequence.
    /// 将一个RPC请求追加到其序列末尾。
    pub(crate) fn push_rpc(&mut self, request: RpcRequest, callback: RpcCallback) {
        debug!(uri = %request.uri, queued = self.rpcs.len() + 1, "rpc queued until the connection is usable");
        self.rpcs.push(QueuedRpc { request, callback });
    }

    /// Appends a file send to its sequence.
    /// 将一个文件发送追加到其序列末尾。
    pub(crate) fn push_file(&mut self, request: FileRequest, callback: FileCallback) {
        debug!(file = %request.name, queued = self.files.len() + 1, "file queued until the connection is usable");
        self.files.push(QueuedFile { request, callback });
    }

    /// Swaps the whole pool contents out, leaving it empty. The caller
    /// replays the snapshot outside the state lock.
    ///
    /// 将发送池的全部内容换出，使其清空。调用方在状态锁之外重放该快照。
    pub(crate) fn take_all(&mut self) -> (Vec<QueuedFile>, Vec<QueuedRpc>) {
        (
            std::mem::take(&mut self.files),
            std::mem::take(&mut self.rpcs),
        )
    }

    #[cfg(test)]
    pub(crate) fn rpc_len(&self) -> usize {
        self.rpcs.len()
    }

    #[cfg(test)]
    pub(crate) fn file_len(&self) -> usize {
        self.files.len()
    }
}
