mod data_partition;
mod refresh;
mod table;
mod view;

pub use data_partition::DataPartition;
pub use data_partition::PartitionError;
pub use table::PartitionTable;
pub use table::TableUpdate;
pub use view::parse_data_partitions_reply;
pub use view::DataPartitionView;
pub use view::PARTITION_READ_ONLY;
pub use view::PARTITION_READ_WRITE;

pub(crate) use data_partition::WriterAdmission;
pub(crate) use refresh::refresh_partitions;
pub(crate) use refresh::spawn_partition_refresh;
pub(crate) use refresh::PartitionRefreshHandle;
