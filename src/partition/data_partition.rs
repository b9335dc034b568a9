use crate::packet::PartitionId;
use crate::partition::{DataPartitionView, PARTITION_READ_WRITE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("partition {0} has no members")]
    NoMembers(PartitionId),
    #[error("leader index {index} out of range for partition {partition} with {members} members")]
    LeaderOutOfRange {
        partition: PartitionId,
        index: usize,
        members: usize,
    },
    #[error("partition {partition} already has {limit} writers")]
    WriterLimit { partition: PartitionId, limit: usize },
}

/// Ordered replica set of one data partition. Shared by every session addressing it; members
/// never change for the lifetime of the value; a membership change produces a new value.
#[derive(Debug)]
pub struct DataPartition {
    id: PartitionId,
    epoch: u64,
    writable: bool,
    members: Vec<String>,
    follower_addrs: Vec<String>,
    rdma_members: Vec<String>,
    rdma_follower_addrs: Vec<String>,
    leader_idx: Mutex<usize>,
    writers: AtomicUsize,
    max_writers: usize,
}

impl DataPartition {
    pub fn new(id: PartitionId, members: Vec<String>, max_writers: usize) -> Result<Self, PartitionError> {
        DataPartition::build(id, 0, true, members, 0, max_writers, None)
    }

    pub fn from_view(
        view: &DataPartitionView,
        max_writers: usize,
        rdma_port: Option<u16>,
    ) -> Result<Self, PartitionError> {
        let leader_idx = view
            .hosts
            .iter()
            .position(|host| host == &view.leader_addr)
            .unwrap_or(0);

        DataPartition::build(
            PartitionId::new(view.partition_id),
            view.epoch,
            view.status == PARTITION_READ_WRITE,
            view.hosts.clone(),
            leader_idx,
            max_writers,
            rdma_port,
        )
    }

    fn build(
        id: PartitionId,
        epoch: u64,
        writable: bool,
        members: Vec<String>,
        leader_idx: usize,
        max_writers: usize,
        rdma_port: Option<u16>,
    ) -> Result<Self, PartitionError> {
        if members.is_empty() {
            return Err(PartitionError::NoMembers(id));
        }

        let follower_addrs = members[1..].to_vec();
        let rdma_members: Vec<String> = match rdma_port {
            Some(port) => members.iter().map(|member| with_port(member, port)).collect(),
            None => members.clone(),
        };
        let rdma_follower_addrs = rdma_members[1..].to_vec();

        Ok(DataPartition {
            id,
            epoch,
            writable,
            members,
            follower_addrs,
            rdma_members,
            rdma_follower_addrs,
            leader_idx: Mutex::new(leader_idx),
            writers: AtomicUsize::new(0),
            max_writers,
        })
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Replica addresses a connection should use, for the plain or the RDMA transport.
    pub fn members_for(&self, rdma: bool) -> &[String] {
        if rdma {
            &self.rdma_members
        } else {
            &self.members
        }
    }

    /// Followers the primary forwards writes to, as carried in a packet's arg.
    pub fn follower_addrs(&self, rdma: bool) -> &[String] {
        if rdma {
            &self.rdma_follower_addrs
        } else {
            &self.follower_addrs
        }
    }

    pub fn leader_idx(&self) -> usize {
        *self.leader_idx.lock().expect("DataPartition.leader_idx() mutex guard poison")
    }

    pub fn set_leader(&self, index: usize) -> Result<(), PartitionError> {
        if index >= self.members.len() {
            return Err(PartitionError::LeaderOutOfRange {
                partition: self.id,
                index,
                members: self.members.len(),
            });
        }

        *self.leader_idx.lock().expect("DataPartition.set_leader() mutex guard poison") = index;
        Ok(())
    }

    pub fn outstanding_writers(&self) -> usize {
        self.writers.load(Ordering::SeqCst)
    }

    pub fn max_writers(&self) -> usize {
        self.max_writers
    }

    /// Counts a new writer session against this partition's ceiling. Rejects, never waits.
    pub(crate) fn admit_writer(self: &Arc<Self>) -> Result<WriterAdmission, PartitionError> {
        let max_writers = self.max_writers;
        self.writers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < max_writers {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .map_err(|_| PartitionError::WriterLimit {
                partition: self.id,
                limit: max_writers,
            })?;

        Ok(WriterAdmission {
            partition: self.clone(),
        })
    }

    /// Replica indices to try, visiting every member exactly once. A stride sharing a factor
    /// with the member count would skip replicas, so it falls back to 1.
    pub fn failover_order(&self, start: usize, stride: usize) -> Vec<usize> {
        let n = self.members.len();
        let mut step = stride % n;
        if step == 0 || gcd(step, n) != 1 {
            step = 1;
        }

        (0..n).map(|i| (start + i * step) % n).collect()
    }

    pub(crate) fn same_layout(&self, view: &DataPartitionView) -> bool {
        self.members == view.hosts && self.writable == (view.status == PARTITION_READ_WRITE)
    }
}

/// Held by a writer session for its lifetime.
#[derive(Debug)]
pub(crate) struct WriterAdmission {
    partition: Arc<DataPartition>,
}

impl Drop for WriterAdmission {
    fn drop(&mut self) {
        self.partition.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn with_port(addr: &str, port: u16) -> String {
    let host = match addr.rfind(':') {
        Some(idx) => &addr[..idx],
        None => addr,
    };

    format!("{}:{}", host, port)
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
