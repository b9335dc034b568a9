use crate::cache::ExtentDescriptor;
use crate::packet::Inode;
use crate::partition::DataPartitionView;

/// Durable record of which extents make up each file.
#[async_trait::async_trait]
pub trait MetaClient: Send + Sync {
    /// Records `extent` for `inode` and drops `discards`, which `extent` superseded.
    async fn append_extent(
        &self,
        inode: Inode,
        extent: &ExtentDescriptor,
        discards: &[ExtentDescriptor],
    ) -> Result<(), MetaError>;

    async fn get_extents(&self, inode: Inode) -> Result<Vec<ExtentDescriptor>, MetaError>;
}

/// Source of data partition topology.
#[async_trait::async_trait]
pub trait MasterClient: Send + Sync {
    async fn get_data_partitions(&self) -> Result<Vec<DataPartitionView>, MasterError>;
}

#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("metadata service unavailable: {0}")]
    Unavailable(String),
    #[error("inode {0} not found")]
    NotFound(Inode),
    #[error("metadata service rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("master service unavailable: {0}")]
    Unavailable(String),
    #[error("master replied with code {code}: {msg}")]
    BadReply { code: u32, msg: String },
    #[error("malformed master reply")]
    Json(#[from] serde_json::Error),
}
