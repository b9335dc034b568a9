//! Wire-level unit of the extent protocol: headers, framing, and the in-memory `Packet` that the
//! writer and reader pipelines move between their queues.
mod codec;
mod completion;
mod header;
mod ids;
mod packet;

pub use codec::CodecError;
pub use codec::PacketCodec;
pub use codec::WireMessage;
pub use header::Opcode;
pub use header::PacketHeader;
pub use header::ResultCode;
pub use header::HEADER_SIZE;
pub use ids::ExtentId;
pub use ids::Inode;
pub use ids::PartitionId;
pub use ids::RequestId;
pub use packet::Packet;
pub use packet::PacketError;

pub(crate) use completion::Completion;
pub(crate) use completion::PacketOutcome;
pub(crate) use completion::PacketReceipt;
pub(crate) use ids::RequestIdGenerator;
pub(crate) use packet::PacketOwner;
