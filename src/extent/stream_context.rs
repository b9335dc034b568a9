use crate::cache::ExtentCache;
use crate::extent::{ExtentWriter, WorkerPool};
use crate::meta::{ExtentAllocator, MetaClient};
use crate::packet::{Inode, RequestIdGenerator};
use crate::partition::PartitionTable;
use crate::transport::Connector;
use std::sync::{Arc, Mutex};

/// Knobs the sessions consult while running.
#[derive(Clone, Debug)]
pub(crate) struct SessionOptions {
    pub(crate) request_retry_max: u32,
    pub(crate) max_writers_per_stream: usize,
    pub(crate) reader_failover_stride: usize,
    pub(crate) packet_size: usize,
    pub(crate) extent_size: u64,
    pub(crate) enable_rdma: bool,
}

/// Collaborators shared by every stream of one client.
pub(crate) struct ClientShared {
    pub(crate) logger: slog::Logger,
    pub(crate) options: SessionOptions,
    pub(crate) meta: Arc<dyn MetaClient>,
    pub(crate) allocator: Arc<dyn ExtentAllocator>,
    pub(crate) write_connector: Arc<dyn Connector>,
    pub(crate) read_connector: Arc<dyn Connector>,
    pub(crate) partitions: Arc<PartitionTable>,
    pub(crate) pool: WorkerPool,
    pub(crate) request_ids: Arc<RequestIdGenerator>,
}

/// State of one open file that its writer and reader sessions reach back into.
pub(crate) struct StreamContext {
    pub(crate) inode: Inode,
    pub(crate) logger: slog::Logger,
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) cache: Mutex<ExtentCache>,
    writers: Mutex<Vec<Arc<ExtentWriter>>>,
}

impl StreamContext {
    pub(crate) fn new(inode: Inode, shared: Arc<ClientShared>, cache: ExtentCache) -> Arc<Self> {
        let logger = shared.logger.new(slog::o!("Inode" => inode.as_u64()));

        Arc::new(StreamContext {
            inode,
            logger,
            shared,
            cache: Mutex::new(cache),
            writers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn writer_count(&self) -> usize {
        self.writers
            .lock()
            .expect("StreamContext.writer_count() mutex guard poison")
            .len()
    }

    /// Registers a writer so stream-level flush and close reach it. Fails at the stream's ceiling.
    pub(crate) fn register_writer(&self, writer: Arc<ExtentWriter>) -> Result<(), usize> {
        let limit = self.shared.options.max_writers_per_stream;
        let mut writers = self
            .writers
            .lock()
            .expect("StreamContext.register_writer() mutex guard poison");
        if writers.len() >= limit {
            return Err(limit);
        }
        writers.push(writer);

        Ok(())
    }

    pub(crate) fn unregister_writer(&self, writer: &Arc<ExtentWriter>) {
        self.writers
            .lock()
            .expect("StreamContext.unregister_writer() mutex guard poison")
            .retain(|registered| !Arc::ptr_eq(registered, writer));
    }

    /// Registered writers, in registration order.
    pub(crate) fn writers(&self) -> Vec<Arc<ExtentWriter>> {
        self.writers
            .lock()
            .expect("StreamContext.writers() mutex guard poison")
            .clone()
    }

    /// Unregisters writers for which `keep` is false and returns them.
    pub(crate) fn retain_writers<F>(&self, keep: F) -> Vec<Arc<ExtentWriter>>
    where
        F: Fn(&Arc<ExtentWriter>) -> bool,
    {
        let mut writers = self
            .writers
            .lock()
            .expect("StreamContext.retain_writers() mutex guard poison");
        let (kept, removed): (Vec<_>, Vec<_>) = writers.drain(..).partition(|writer| keep(writer));
        *writers = kept;

        removed
    }
}
