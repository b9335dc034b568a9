use crate::extent::{ExtentReader, ExtentWriter};
use crate::packet::{
    Completion, ExtentId, Opcode, PacketHeader, PacketOutcome, PacketReceipt, PartitionId, RequestId, WireMessage,
};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;

/// Terminal error recorded on a packet and delivered through its completion.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("I/O error talking to data partition")]
    Io,
    #[error("operation not permitted: writer limit reached")]
    PermissionDenied,
    #[error("out of resources for a new session")]
    ResourceExhausted,
    #[error("packet dropped before completion")]
    Cancelled,
    #[error("no writable data partition")]
    NoPartition,
}

impl PacketError {
    /// Errno the kernel client would have surfaced for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            PacketError::Io => 5,
            PacketError::PermissionDenied => 1,
            PacketError::ResourceExhausted => 12,
            PacketError::Cancelled => 125,
            PacketError::NoPartition => 28,
        }
    }
}

/// Session a packet was routed through after recovery, so later packets can reuse it.
#[derive(Clone)]
pub(crate) enum PacketOwner {
    Writer(Arc<ExtentWriter>),
    Reader(Arc<ExtentReader>),
}

impl fmt::Debug for PacketOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketOwner::Writer(writer) => write!(f, "Writer(extent {})", writer.extent_id()),
            PacketOwner::Reader(reader) => write!(f, "Reader(extent {})", reader.extent_id()),
        }
    }
}

pub struct Packet {
    request: WireMessage,
    reply: Option<WireMessage>,
    pub(crate) retry_count: u32,
    pub(crate) error: Option<PacketError>,
    pub(crate) owner: Option<PacketOwner>,
    completion: Option<Completion>,
}

impl Packet {
    pub(crate) fn new(mut header: PacketHeader, arg: Bytes, data: Bytes) -> Self {
        header.arg_len = arg.len() as u32;
        Packet {
            request: WireMessage { header, arg, data },
            reply: None,
            retry_count: 0,
            error: None,
            owner: None,
            completion: None,
        }
    }

    /// Write of `data` at file offset `kernel_offset`. Partition and extent fields are filled in
    /// by the writer the packet is routed to.
    pub(crate) fn new_write(request_id: RequestId, kernel_offset: u64, data: Bytes) -> Self {
        let mut header = PacketHeader::new(Opcode::Write, request_id);
        header.kernel_offset = kernel_offset;
        header.size = data.len() as u32;
        header.crc = crc32fast::hash(&data);

        Packet::new(header, Bytes::new(), data)
    }

    pub(crate) fn new_stream_read(
        request_id: RequestId,
        partition_id: PartitionId,
        extent_id: ExtentId,
        extent_offset: u64,
        kernel_offset: u64,
        len: u32,
    ) -> Self {
        let mut header = PacketHeader::new(Opcode::StreamRead, request_id);
        header.partition_id = partition_id;
        header.extent_id = extent_id;
        header.extent_offset = extent_offset;
        header.kernel_offset = kernel_offset;
        header.size = len;

        Packet::new(header, Bytes::new(), Bytes::new())
    }

    pub(crate) fn new_create_extent(request_id: RequestId, partition_id: PartitionId, followers: &[String]) -> Self {
        let mut header = PacketHeader::new(Opcode::CreateExtent, request_id);
        header.partition_id = partition_id;
        let (arg, remaining_followers) = follower_arg(followers);
        header.remaining_followers = remaining_followers;

        Packet::new(header, arg, Bytes::new())
    }

    pub(crate) fn attach_completion(&mut self) -> PacketReceipt {
        let (completion, receipt) =
            Completion::new(self.request.header.request_id, self.request.header.kernel_offset);
        self.completion = Some(completion);

        receipt
    }

    pub fn request(&self) -> &WireMessage {
        &self.request
    }

    pub fn request_id(&self) -> RequestId {
        self.request.header.request_id
    }

    pub fn kernel_offset(&self) -> u64 {
        self.request.header.kernel_offset
    }

    /// Bytes this packet covers: written payload for writes, requested length for reads.
    pub fn len(&self) -> u64 {
        self.request.header.size as u64
    }

    pub fn reply(&self) -> Option<&WireMessage> {
        self.reply.as_ref()
    }

    /// Transports call this from `recv`.
    pub fn set_reply(&mut self, reply: WireMessage) {
        self.reply = Some(reply);
    }

    pub(crate) fn clear_reply(&mut self) {
        self.reply = None;
    }

    /// A reply is usable when it answers this request and reports success.
    pub(crate) fn reply_ok(&self) -> bool {
        match &self.reply {
            Some(reply) => {
                reply.header.request_id == self.request.header.request_id && reply.header.result_code.is_ok()
            }
            None => false,
        }
    }

    /// Data length of a read reply that does not cover exactly the requested range.
    pub(crate) fn read_reply_mismatch(&self) -> Option<usize> {
        if self.request.header.opcode != Opcode::StreamRead {
            return None;
        }
        match &self.reply {
            Some(reply) if reply.data.len() as u64 != self.len() => Some(reply.data.len()),
            _ => None,
        }
    }

    pub(crate) fn retarget(
        &mut self,
        partition_id: PartitionId,
        extent_id: ExtentId,
        extent_offset: u64,
        followers: &[String],
    ) {
        let (arg, remaining_followers) = follower_arg(followers);
        let header = &mut self.request.header;
        header.partition_id = partition_id;
        header.extent_id = extent_id;
        header.extent_offset = extent_offset;
        header.remaining_followers = remaining_followers;
        header.arg_len = arg.len() as u32;
        self.request.arg = arg;
        self.reply = None;
    }

    pub(crate) fn fail(&mut self, error: PacketError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Delivers the outcome and consumes the packet.
    pub(crate) fn complete(mut self) {
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => return,
        };

        let result = match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self.reply.take().map(|reply| reply.data).unwrap_or_default()),
        };

        completion.deliver(PacketOutcome {
            request_id: self.request.header.request_id,
            kernel_offset: self.request.header.kernel_offset,
            retry_count: self.retry_count,
            result,
            owner: self.owner.take(),
        });
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("request", &self.request.header)
            .field("retry_count", &self.retry_count)
            .field("error", &self.error)
            .finish()
    }
}

/// Follower addresses as the data node expects them: each terminated by '/'.
pub(crate) fn follower_arg(followers: &[String]) -> (Bytes, u8) {
    let mut arg = BytesMut::new();
    for follower in followers {
        arg.extend_from_slice(follower.as_bytes());
        arg.extend_from_slice(b"/");
    }

    (arg.freeze(), followers.len() as u8)
}
