use crate::extent::{do_extent_request, ExtentRequestError};
use crate::packet::{ExtentId, Inode, Packet, RequestIdGenerator};
use crate::partition::{DataPartition, PartitionTable};
use crate::transport::Connector;
use rand::seq::SliceRandom;
use std::sync::Arc;

const MAX_ALLOCATE_ATTEMPTS: usize = 3;

/// Hands out fresh extents for writers, including recovery writers.
#[async_trait::async_trait]
pub trait ExtentAllocator: Send + Sync {
    async fn allocate_extent(&self, inode: Inode) -> Result<(Arc<DataPartition>, ExtentId), AllocateError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("no writable data partition")]
    NoWritablePartition,
    #[error("extent creation failed on {attempts} partitions")]
    Exhausted { attempts: usize },
    #[error("allocation rejected: {0}")]
    Rejected(String),
}

/// Creates extents directly on a randomly chosen writable partition's primary replica.
pub(crate) struct PartitionExtentAllocator {
    logger: slog::Logger,
    partitions: Arc<PartitionTable>,
    connector: Arc<dyn Connector>,
    request_ids: Arc<RequestIdGenerator>,
    rdma: bool,
}

impl PartitionExtentAllocator {
    pub(crate) fn new(
        logger: slog::Logger,
        partitions: Arc<PartitionTable>,
        connector: Arc<dyn Connector>,
        request_ids: Arc<RequestIdGenerator>,
        rdma: bool,
    ) -> Self {
        PartitionExtentAllocator {
            logger,
            partitions,
            connector,
            request_ids,
            rdma,
        }
    }

    async fn create_extent(&self, partition: &DataPartition) -> Result<ExtentId, ExtentRequestError> {
        let mut packet = Packet::new_create_extent(
            self.request_ids.next(),
            partition.id(),
            partition.follower_addrs(self.rdma),
        );
        let primary = &partition.members_for(self.rdma)[0];
        do_extent_request(self.connector.as_ref(), primary, &mut packet).await?;

        let reply = packet.reply().ok_or(ExtentRequestError::NoReply)?;
        Ok(reply.header.extent_id)
    }
}

#[async_trait::async_trait]
impl ExtentAllocator for PartitionExtentAllocator {
    async fn allocate_extent(&self, inode: Inode) -> Result<(Arc<DataPartition>, ExtentId), AllocateError> {
        let mut candidates = self.partitions.writable();
        if candidates.is_empty() {
            return Err(AllocateError::NoWritablePartition);
        }
        {
            let mut rng = rand::thread_rng();
            candidates.shuffle(&mut rng);
        }

        let mut attempts = 0;
        for partition in candidates.into_iter().take(MAX_ALLOCATE_ATTEMPTS) {
            attempts += 1;
            match self.create_extent(&partition).await {
                Ok(extent_id) => {
                    slog::debug!(
                        self.logger,
                        "Created extent {} on partition {} for inode {}",
                        extent_id,
                        partition.id(),
                        inode
                    );
                    return Ok((partition, extent_id));
                }
                Err(e) => {
                    slog::warn!(
                        self.logger,
                        "Failed to create extent on partition {}: {:?}",
                        partition.id(),
                        e
                    );
                }
            }
        }

        Err(AllocateError::Exhausted { attempts })
    }
}
