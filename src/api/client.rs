use crate::cache::ExtentCache;
use crate::extent::{ClientShared, ExtentStream, StreamContext, StreamError};
use crate::meta::{MasterClient, MasterError};
use crate::packet::{Inode, PartitionId};
use crate::partition::{refresh_partitions, DataPartition, PartitionRefreshHandle, TableUpdate};
use std::sync::Arc;

/// Entry point for file I/O against the data partitions of one volume. Dropping the client stops
/// the background partition refresh.
pub struct ExtentClient {
    shared: Arc<ClientShared>,
    master: Arc<dyn MasterClient>,
    _refresh_handle: PartitionRefreshHandle,
}

impl ExtentClient {
    pub(super) fn new(
        shared: Arc<ClientShared>,
        master: Arc<dyn MasterClient>,
        refresh_handle: PartitionRefreshHandle,
    ) -> Self {
        ExtentClient {
            shared,
            master,
            _refresh_handle: refresh_handle,
        }
    }

    /// Opens `inode` with the extents the metadata service has committed for it.
    pub async fn open_stream(&self, inode: Inode) -> Result<ExtentStream, StreamError> {
        let extents = self.shared.meta.get_extents(inode).await?;

        let mut cache = ExtentCache::new();
        for extent in extents {
            cache.append(extent, false, &mut Vec::new())?;
        }
        slog::debug!(self.shared.logger, "Opened inode {} with {} extents", inode, cache.len());

        Ok(ExtentStream::new(StreamContext::new(inode, self.shared.clone(), cache)))
    }

    pub fn partition(&self, id: PartitionId) -> Option<Arc<DataPartition>> {
        self.shared.partitions.get(id)
    }

    pub fn partition_count(&self) -> usize {
        self.shared.partitions.len()
    }

    /// Re-fetches partitions now instead of waiting for the next periodic refresh.
    pub async fn refresh_partitions(&self) -> Result<TableUpdate, MasterError> {
        refresh_partitions(&self.shared.logger, self.master.as_ref(), &self.shared.partitions).await
    }
}
