//! 文件传输处理：出站分块发送与入站落盘。
//! File transfer handling: outbound chunked sending and inbound saving.
//!
//! Outbound sends are serialized through one pump task per connection, so
//! chunks of different files never interleave on the wire. The pump reads
//! the disk at most one chunk ahead of the socket: the bounded channel
//! between pump and driver is the throttle.
//!
//! 出站发送经由每个连接唯一的泵任务串行化，不同文件的分块绝不会在线上交错。
//! 泵的磁盘读取最多领先套接字一个分块：泵与驱动之间的有界通道就是节流阀。

use crate::{
    error::{Error, Result},
    pipeline::{Stage, StageContext, StageDecision},
    protocol::{MAX_FRAME_LENGTH, Message, RecipientKind},
};
use bytes::{Bytes, BytesMut};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};

/// The callback invoked at most once with the outcome of a file send.
/// 以文件发送结果至多调用一次的回调。
pub type FileCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// A fully saved inbound file.
/// 一个已完整落盘的入站文件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// The sanitized file name the peer announced.
    /// 对端宣告的、已净化的文件名。
    pub name: String,
    /// The full path of the saved file. Its file name can differ from
    /// `name` when two concurrent transfers announced the same name.
    ///
    /// 已保存文件的完整路径。当两个并发传输宣告了相同的名字时，
    /// 其文件名可能与 `name` 不同。
    pub path: PathBuf,
    /// Bytes actually written.
    /// 实际写入的字节数。
    pub size: u64,
}

/// The hook invoked after each inbound file has been fully saved.
/// 每个入站文件完整落盘后调用的钩子。
pub(crate) type FileReceivedCallback = Arc<dyn Fn(ReceivedFile) + Send + Sync>;

/// An accepted outbound file send. The file is already open; opening is the
/// caller's synchronous, fallible step.
///
/// 一个已受理的出站文件发送。文件已被打开；打开文件是调用方同步的、
/// 可失败的步骤。
pub(crate) struct FileRequest {
    pub(crate) file: std::fs::File,
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) recipient_kind: RecipientKind,
    pub(crate) recipient_id: String,
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("recipient_kind", &self.recipient_kind)
            .field("recipient_id", &self.recipient_id)
            .finish_non_exhaustive()
    }
}

/// One send traveling from the submit path to the pump.
pub(crate) struct FileSend {
    request: FileRequest,
    callback: FileCallback,
}

/// The submission handle for outbound file sends. Cheap to clone; all
/// clones feed the same pump in submission order.
///
/// 出站文件发送的提交句柄。克隆成本低；所有克隆按提交顺序喂给同一个泵。
#[derive(Clone)]
pub(crate) struct FileHandler {
    commands: mpsc::UnboundedSender<FileSend>,
}

impl FileHandler {
    pub(crate) fn new(commands: mpsc::UnboundedSender<FileSend>) -> Self {
        Self { commands }
    }

    /// Hands one send to the pump. Never blocks. If the pump is already
    /// gone, or the announcement cannot fit a single frame, the callback is
    /// failed right here.
    ///
    /// 把一个发送交给泵。永不阻塞。如果泵已经不在了，或者宣告无法装进
    /// 单个帧，回调就地以失败结束。
    pub(crate) fn submit(&self, request: FileRequest, callback: FileCallback) {
        debug!(file = %request.name, size = request.size, "file send submitted");
        // The announcement's string fields must fit their u16 length
        // prefixes.
        if request.name.len() > u16::MAX as usize
            || request.recipient_id.len() > u16::MAX as usize
        {
            callback(Err(Error::MessageTooLarge));
            return;
        }
        if let Err(rejected) = self.commands.send(FileSend { request, callback }) {
            (rejected.0.callback)(Err(Error::ConnectionClosed));
        }
    }
}

/// The per-connection pump task: pulls accepted sends off the command
/// channel one at a time and streams each file as start, chunks, end.
///
/// 每个连接的泵任务：从命令通道逐个取出已受理的发送，
/// 并把每个文件以开始、分块、结束的形式流式发出。
pub(crate) struct FilePump {
    commands: mpsc::UnboundedReceiver<FileSend>,
    data: mpsc::Sender<Message>,
    chunk_size: usize,
}

impl FilePump {
    pub(crate) fn new(
        commands: mpsc::UnboundedReceiver<FileSend>,
        data: mpsc::Sender<Message>,
        chunk_size: usize,
    ) -> Self {
        Self {
            commands,
            data,
            // A chunk plus its framing must stay inside one frame.
            chunk_size: chunk_size.clamp(1, MAX_FRAME_LENGTH - 64),
        }
    }

    /// Runs until every submission handle is dropped.
    /// 运行到所有提交句柄都被丢弃为止。
    pub(crate) async fn run(mut self) {
        while let Some(send) = self.commands.recv().await {
            let name = send.request.name.clone();
            match self.stream(send.request).await {
                Ok(sent) => {
                    debug!(file = %name, bytes = sent, "file transfer complete");
                    (send.callback)(Ok(()));
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "file transfer failed");
                    (send.callback)(Err(e));
                }
            }
        }
        debug!("file pump finished");
    }

    async fn stream(&mut self, request: FileRequest) -> Result<u64> {
        let transfer_id: u32 = rand::random();
        let mut file = fs::File::from_std(request.file);

        self.send(Message::file_start(
            transfer_id,
            request.recipient_kind,
            request.recipient_id,
            request.name,
            request.size,
        ))
        .await?;

        let mut offset = 0u64;
        loop {
            let mut chunk = BytesMut::with_capacity(self.chunk_size);
            let n = file.read_buf(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.send(Message::file_chunk(transfer_id, offset, chunk.freeze()))
                .await?;
            offset += n as u64;
        }

        self.send(Message::file_end(transfer_id)).await?;
        Ok(offset)
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.data
            .send(message)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// One inbound transfer currently being written to disk.
struct InboundTransfer {
    chunks: mpsc::UnboundedSender<WriterCommand>,
    expected_offset: u64,
    path: PathBuf,
}

enum WriterCommand {
    Chunk(Bytes),
    Finish,
}

/// Pipeline stage receiving files pushed over the connection.
///
/// The stage itself only validates and forwards; the actual disk writes
/// happen on a spawned writer task per transfer, keeping the driver free to
/// read the socket.
///
/// 接收经连接推送而来的文件的管道阶段。
///
/// 阶段本身只做校验与转发；真正的磁盘写入在每个传输各自派生的写任务上
/// 进行，使驱动始终能腾出手来读套接字。
pub(crate) struct FileStage {
    save_dir: PathBuf,
    received: Option<FileReceivedCallback>,
    transfers: HashMap<u32, InboundTransfer>,
}

impl FileStage {
    pub(crate) fn new(save_dir: PathBuf, received: Option<FileReceivedCallback>) -> Self {
        Self {
            save_dir,
            received,
            transfers: HashMap::new(),
        }
    }
}

impl Stage for FileStage {
    fn name(&self) -> &'static str {
        "file"
    }

    fn on_inbound(&mut self, message: Message, _ctx: &mut StageContext<'_>) -> Result<StageDecision> {
        match message {
            Message::FileStart {
                transfer_id,
                name,
                size,
                ..
            } => {
                let name = sanitize_file_name(&name, transfer_id);
                let mut path = self.save_dir.join(&name);
                if self.transfers.values().any(|t| t.path == path) {
                    // Same name already being written by another transfer;
                    // divert this one so neither truncates the other.
                    path = self.save_dir.join(format!("{name}.{transfer_id:08x}"));
                }
                debug!(transfer_id, file = %name, size, "inbound file transfer started");

                let (tx, rx) = mpsc::unbounded_channel();
                let writer = InboundWriter {
                    name,
                    path: path.clone(),
                    announced_size: size,
                    chunks: rx,
                    received: self.received.clone(),
                };
                tokio::spawn(writer.run());

                let previous = self.transfers.insert(
                    transfer_id,
                    InboundTransfer {
                        chunks: tx,
                        expected_offset: 0,
                        path,
                    },
                );
                if previous.is_some() {
                    warn!(transfer_id, "transfer id reused; dropping the previous transfer");
                }
                Ok(StageDecision::Consumed)
            }
            Message::FileChunk {
                transfer_id,
                offset,
                data,
            } => {
                let Some(transfer) = self.transfers.get_mut(&transfer_id) else {
                    debug!(transfer_id, "chunk for an unknown transfer");
                    return Ok(StageDecision::Consumed);
                };
                if offset != transfer.expected_offset {
                    return Err(Error::MalformedFrame("file chunk offset out of sequence"));
                }
                transfer.expected_offset += data.len() as u64;
                if transfer.chunks.send(WriterCommand::Chunk(data)).is_err() {
                    warn!(transfer_id, "inbound file writer is gone; dropping the transfer");
                    self.transfers.remove(&transfer_id);
                }
                Ok(StageDecision::Consumed)
            }
            Message::FileEnd { transfer_id } => {
                match self.transfers.remove(&transfer_id) {
                    Some(transfer) => {
                        let _ = transfer.chunks.send(WriterCommand::Finish);
                    }
                    None => debug!(transfer_id, "end for an unknown transfer"),
                }
                Ok(StageDecision::Consumed)
            }
            other => Ok(StageDecision::Forward(other)),
        }
    }
}

/// The writer task for one inbound transfer. A transfer that never sees its
/// end marker (connection loss, writer replaced) leaves no partial file
/// behind.
///
/// 单个入站传输的写任务。没有等到结束标记的传输（连接断开、写任务被替换）
/// 不会留下残缺文件。
struct InboundWriter {
    name: String,
    path: PathBuf,
    announced_size: u64,
    chunks: mpsc::UnboundedReceiver<WriterCommand>,
    received: Option<FileReceivedCallback>,
}

impl InboundWriter {
    async fn run(mut self) {
        match self.write_to_disk().await {
            Ok(Some(written)) => {
                if written != self.announced_size {
                    warn!(
                        file = %self.name,
                        announced = self.announced_size,
                        written,
                        "inbound file size differs from its announcement"
                    );
                }
                info!(file = %self.name, path = %self.path.display(), written, "inbound file saved");
                if let Some(received) = &self.received {
                    received(ReceivedFile {
                        name: self.name.clone(),
                        path: self.path.clone(),
                        size: written,
                    });
                }
            }
            Ok(None) => {
                warn!(file = %self.name, "inbound transfer ended early; removing the partial file");
                let _ = fs::remove_file(&self.path).await;
            }
            Err(e) => {
                warn!(file = %self.name, error = %e, "failed to write inbound file; removing it");
                let _ = fs::remove_file(&self.path).await;
            }
        }
    }

    /// Writes chunks until the finish marker. Returns the byte count on a
    /// finished transfer, `None` when the channel closed before the marker.
    ///
    /// 写入分块直到收到结束标记。传输完成时返回字节数；
    /// 若通道在标记之前关闭则返回 `None`。
    async fn write_to_disk(&mut self) -> Result<Option<u64>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&self.path).await?;
        let mut written = 0u64;
        while let Some(command) = self.chunks.recv().await {
            match command {
                WriterCommand::Chunk(data) => {
                    file.write_all(&data).await?;
                    written += data.len() as u64;
                }
                WriterCommand::Finish => {
                    file.flush().await?;
                    return Ok(Some(written));
                }
            }
        }
        Ok(None)
    }
}

/// Reduces a peer-supplied file name to a bare name with no directory
/// components. Falls back to a name derived from the transfer id when
/// nothing safe is left.
///
/// 把对端提供的文件名收敛为不含任何目录成分的裸文件名。
/// 当没有任何安全部分可用时，退回到由传输ID导出的名字。
fn sanitize_file_name(name: &str, transfer_id: u32) -> String {
    let name = name.replace('\\', "/");
    Path::new(&name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| *n != "." && *n != "..")
        .map(str::to_owned)
        .unwrap_or_else(|| format!("transfer-{transfer_id}"))
}
