mod api;
mod cache;
mod extent;
mod meta;
mod packet;
mod partition;
mod transport;

#[cfg(test)]
mod test_utils;

pub use api::try_create_extent_client;
pub use api::ExtentClient;
pub use api::ExtentClientConfig;
pub use api::ExtentClientCreationError;
pub use api::ExtentClientOptions;
pub use cache::CacheError;
pub use cache::CacheSegment;
pub use cache::ExtentCache;
pub use cache::ExtentDescriptor;
pub use extent::ExtentStream;
pub use extent::FlushError;
pub use extent::ReaderCreateError;
pub use extent::StreamError;
pub use extent::WriterCreateError;
pub use meta::AllocateError;
pub use meta::ExtentAllocator;
pub use meta::MasterClient;
pub use meta::MasterError;
pub use meta::MetaClient;
pub use meta::MetaError;
pub use packet::CodecError;
pub use packet::ExtentId;
pub use packet::Inode;
pub use packet::Opcode;
pub use packet::Packet;
pub use packet::PacketCodec;
pub use packet::PacketError;
pub use packet::PacketHeader;
pub use packet::PartitionId;
pub use packet::RequestId;
pub use packet::ResultCode;
pub use packet::WireMessage;
pub use packet::HEADER_SIZE;
pub use partition::parse_data_partitions_reply;
pub use partition::DataPartition;
pub use partition::DataPartitionView;
pub use partition::PartitionError;
pub use partition::TableUpdate;
pub use partition::PARTITION_READ_ONLY;
pub use partition::PARTITION_READ_WRITE;
pub use transport::Connector;
pub use transport::TcpConnector;
pub use transport::TcpTransport;
pub use transport::Transport;
pub use transport::TransportError;
