use crate::packet::PartitionId;
use crate::partition::{DataPartition, DataPartitionView};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Current view of the volume's data partitions.
pub struct PartitionTable {
    partitions: RwLock<HashMap<PartitionId, Arc<DataPartition>>>,
    max_writers_per_partition: usize,
    rdma_port: Option<u16>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TableUpdate {
    pub added: usize,
    pub replaced: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl PartitionTable {
    pub fn new(max_writers_per_partition: usize, rdma_port: Option<u16>) -> Self {
        PartitionTable {
            partitions: RwLock::new(HashMap::new()),
            max_writers_per_partition,
            rdma_port,
        }
    }

    pub fn get(&self, id: PartitionId) -> Option<Arc<DataPartition>> {
        self.partitions
            .read()
            .expect("PartitionTable.get() lock poison")
            .get(&id)
            .cloned()
    }

    pub fn writable(&self) -> Vec<Arc<DataPartition>> {
        let mut writable: Vec<Arc<DataPartition>> = self
            .partitions
            .read()
            .expect("PartitionTable.writable() lock poison")
            .values()
            .filter(|partition| partition.is_writable())
            .cloned()
            .collect();
        writable.sort_by_key(|partition| partition.id());

        writable
    }

    pub fn len(&self) -> usize {
        self.partitions.read().expect("PartitionTable.len() lock poison").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the table contents with `views`. Partitions whose layout is unchanged keep their
    /// existing `Arc` so leader hints and writer counts survive; sessions holding a replaced
    /// partition keep using the old value until they finish.
    pub fn update(&self, views: &[DataPartitionView]) -> TableUpdate {
        let mut result = TableUpdate::default();
        let mut partitions = self.partitions.write().expect("PartitionTable.update() lock poison");
        let mut next = HashMap::with_capacity(views.len());

        for view in views {
            let id = PartitionId::new(view.partition_id);
            match partitions.remove(&id) {
                Some(existing) if existing.same_layout(view) => {
                    next.insert(id, existing);
                }
                existing => match DataPartition::from_view(view, self.max_writers_per_partition, self.rdma_port) {
                    Ok(partition) => {
                        if existing.is_some() {
                            result.replaced += 1;
                        } else {
                            result.added += 1;
                        }
                        next.insert(id, Arc::new(partition));
                    }
                    Err(_) => {
                        result.skipped += 1;
                        if let Some(existing) = existing {
                            next.insert(id, existing);
                        }
                    }
                },
            }
        }

        result.removed = partitions.len();
        *partitions = next;

        result
    }
}
