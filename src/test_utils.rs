//! In-memory replicas, metadata and master services for unit tests.
use crate::cache::{ExtentCache, ExtentDescriptor};
use crate::extent::{ClientShared, SessionOptions, StreamContext, WorkerPool};
use crate::meta::{AllocateError, ExtentAllocator, MasterClient, MasterError, MetaClient, MetaError};
use crate::packet::{
    ExtentId, Inode, Opcode, Packet, PacketOutcome, PacketReceipt, PartitionId, RequestId, RequestIdGenerator,
    ResultCode, WireMessage,
};
use crate::partition::{DataPartition, DataPartitionView, PartitionTable, PARTITION_READ_WRITE};
use crate::transport::{Connector, Transport, TransportError};
use bytes::Bytes;
use slog::Drain;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub(crate) fn test_logger() -> slog::Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();

    slog::Logger::root(drain, slog::o!())
}

/// Drain that keeps every record's level and message for assertions.
#[derive(Clone, Default)]
pub(crate) struct LogCapture {
    records: Arc<Mutex<Vec<(slog::Level, String)>>>,
}

impl LogCapture {
    /// Logger that prints like `test_logger` and also records into this capture.
    pub(crate) fn logger(&self) -> slog::Logger {
        let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();

        slog::Logger::root(slog::Duplicate::new(drain, self.clone()).fuse(), slog::o!())
    }

    pub(crate) fn level_of(&self, message: &str) -> Option<slog::Level> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|(_, recorded)| recorded == message)
            .map(|(level, _)| *level)
    }
}

impl Drain for LogCapture {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &slog::Record<'_>, _: &slog::OwnedKVList) -> Result<(), slog::Never> {
        self.records
            .lock()
            .unwrap()
            .push((record.level(), record.msg().to_string()));
        Ok(())
    }
}

pub(crate) fn options() -> SessionOptions {
    SessionOptions {
        request_retry_max: 5,
        max_writers_per_stream: 16,
        reader_failover_stride: 1,
        packet_size: 4096,
        extent_size: 1024 * 1024,
        enable_rdma: false,
    }
}

/// Waits for a packet outcome, failing the test instead of hanging.
pub(crate) async fn wait(receipt: PacketReceipt) -> PacketOutcome {
    tokio::time::timeout(Duration::from_secs(5), receipt.wait())
        .await
        .expect("Unexpected timeout")
}

#[derive(Clone, Debug)]
pub(crate) enum ReplicaBehavior {
    Healthy,
    Unreachable,
    FailSend,
    ExhaustedSend,
    DropReply,
    Reject(ResultCode),
    /// Replies `Ok` to reads with only this many bytes.
    ShortRead(usize),
    /// Replies `Ok` to reads with this many extra bytes.
    LongRead(usize),
}

#[derive(Default)]
struct ReplicaSet {
    behaviors: Mutex<HashMap<String, ReplicaBehavior>>,
    requests: Mutex<Vec<(String, WireMessage)>>,
    connects: Mutex<Vec<String>>,
    connect_attempts: AtomicUsize,
    closes: Mutex<HashMap<String, usize>>,
    extents: Mutex<HashMap<(String, u64, u64), Vec<u8>>>,
    next_extent_id: AtomicU64,
}

impl ReplicaSet {
    fn behavior(&self, host: &str) -> ReplicaBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or(ReplicaBehavior::Healthy)
    }

    /// Executes `request` the way a data node would and returns the reply.
    fn serve(&self, host: &str, request: &WireMessage) -> WireMessage {
        let mut header = request.header.clone();
        header.result_code = ResultCode::Ok;
        let mut data = Bytes::new();

        match request.header.opcode {
            Opcode::Write => {
                let followers = String::from_utf8_lossy(&request.arg).to_string();
                let hosts = std::iter::once(host).chain(followers.split('/').filter(|h| !h.is_empty()));
                for replica in hosts {
                    self.store(replica, request);
                }
            }
            Opcode::CreateExtent => {
                let id = 1000 + self.next_extent_id.fetch_add(1, Ordering::SeqCst);
                header.extent_id = ExtentId::new(id);
            }
            Opcode::StreamRead => {
                let key = (
                    host.to_string(),
                    request.header.partition_id.as_u64(),
                    request.header.extent_id.as_u64(),
                );
                let stored = self.extents.lock().unwrap().get(&key).cloned().unwrap_or_default();
                let start = request.header.extent_offset as usize;
                let mut chunk = vec![0u8; request.header.size as usize];
                if start < stored.len() {
                    let end = std::cmp::min(stored.len(), start + chunk.len());
                    chunk[..end - start].copy_from_slice(&stored[start..end]);
                }
                data = Bytes::from(chunk);
            }
        }

        header.size = data.len() as u32;
        header.crc = crc32fast::hash(&data);
        WireMessage {
            header,
            arg: Bytes::new(),
            data,
        }
    }

    fn store(&self, host: &str, request: &WireMessage) {
        let key = (
            host.to_string(),
            request.header.partition_id.as_u64(),
            request.header.extent_id.as_u64(),
        );
        let start = request.header.extent_offset as usize;
        let end = start + request.data.len();
        let mut extents = self.extents.lock().unwrap();
        let stored = extents.entry(key).or_default();
        if stored.len() < end {
            stored.resize(end, 0);
        }
        stored[start..end].copy_from_slice(&request.data);
    }
}

/// Connector to in-memory replicas keyed by address. Each replica keeps the bytes written to
/// its extents and serves reads from them.
pub(crate) struct MockConnector {
    replicas: Arc<ReplicaSet>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MockConnector {
            replicas: Arc::new(ReplicaSet::default()),
        })
    }

    pub(crate) fn set_behavior(&self, host: &str, behavior: ReplicaBehavior) {
        self.replicas
            .behaviors
            .lock()
            .unwrap()
            .insert(host.to_string(), behavior);
    }

    /// Requests `host` received, in arrival order.
    pub(crate) fn requests_to(&self, host: &str) -> Vec<WireMessage> {
        self.replicas
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == host)
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub(crate) fn connect_log(&self) -> Vec<String> {
        self.replicas.connects.lock().unwrap().clone()
    }

    pub(crate) fn clear_connect_log(&self) {
        self.replicas.connects.lock().unwrap().clear();
    }

    pub(crate) fn connect_attempts(&self) -> usize {
        self.replicas.connect_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn closes_to(&self, host: &str) -> usize {
        self.replicas.closes.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub(crate) fn extent_data(&self, host: &str, partition_id: u64, extent_id: u64) -> Vec<u8> {
        self.replicas
            .extents
            .lock()
            .unwrap()
            .get(&(host.to_string(), partition_id, extent_id))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn put_extent_data(&self, hosts: &[&str], partition_id: u64, extent_id: u64, data: &[u8]) {
        let mut extents = self.replicas.extents.lock().unwrap();
        for host in hosts {
            extents.insert((host.to_string(), partition_id, extent_id), data.to_vec());
        }
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, addr: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.replicas.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.replicas.connects.lock().unwrap().push(addr.to_string());

        if let ReplicaBehavior::Unreachable = self.replicas.behavior(addr) {
            return Err(TransportError::Connect {
                addr: addr.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "mock replica unreachable"),
            });
        }

        Ok(Arc::new(MockTransport {
            host: addr.to_string(),
            replicas: self.replicas.clone(),
            pending: Mutex::new(VecDeque::new()),
        }))
    }
}

struct MockTransport {
    host: String,
    replicas: Arc<ReplicaSet>,
    pending: Mutex<VecDeque<WireMessage>>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        match self.replicas.behavior(&self.host) {
            ReplicaBehavior::FailSend => {
                return Err(TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "mock send failure")));
            }
            ReplicaBehavior::ExhaustedSend => {
                return Err(TransportError::ResourceExhausted("mock send buffers".to_string()));
            }
            _ => {}
        }

        let request = packet.request().clone();
        self.replicas
            .requests
            .lock()
            .unwrap()
            .push((self.host.clone(), request.clone()));
        self.pending.lock().unwrap().push_back(request);

        Ok(())
    }

    async fn recv(&self, packet: &mut Packet) -> Result<(), TransportError> {
        let request = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Closed)?;

        match self.replicas.behavior(&self.host) {
            ReplicaBehavior::DropReply => Err(TransportError::Timeout(Duration::from_millis(1))),
            ReplicaBehavior::Reject(result_code) => {
                let mut header = request.header;
                header.result_code = result_code;
                header.size = 0;
                header.crc = 0;
                packet.set_reply(WireMessage {
                    header,
                    arg: Bytes::new(),
                    data: Bytes::new(),
                });
                Ok(())
            }
            ReplicaBehavior::ShortRead(keep) => {
                let mut reply = self.replicas.serve(&self.host, &request);
                reply.data.truncate(keep);
                reply.header.size = reply.data.len() as u32;
                reply.header.crc = crc32fast::hash(&reply.data);
                packet.set_reply(reply);
                Ok(())
            }
            ReplicaBehavior::LongRead(extra) => {
                let mut reply = self.replicas.serve(&self.host, &request);
                let mut data = reply.data.to_vec();
                data.extend(std::iter::repeat(b'!').take(extra));
                reply.data = Bytes::from(data);
                reply.header.size = reply.data.len() as u32;
                reply.header.crc = crc32fast::hash(&reply.data);
                packet.set_reply(reply);
                Ok(())
            }
            _ => {
                packet.set_reply(self.replicas.serve(&self.host, &request));
                Ok(())
            }
        }
    }

    async fn close(&self) {
        *self
            .replicas
            .closes
            .lock()
            .unwrap()
            .entry(self.host.clone())
            .or_insert(0) += 1;
    }
}

/// Metadata service that records every append and can be told to fail.
#[derive(Default)]
pub(crate) struct MockMetaClient {
    appends: Mutex<Vec<(ExtentDescriptor, Vec<ExtentDescriptor>)>>,
    committed: Mutex<HashMap<Inode, Vec<ExtentDescriptor>>>,
    failures: AtomicUsize,
}

impl MockMetaClient {
    pub(crate) fn appends(&self) -> Vec<(ExtentDescriptor, Vec<ExtentDescriptor>)> {
        self.appends.lock().unwrap().clone()
    }

    /// The next `n` appends fail without being recorded.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_extents(&self, inode: Inode, extents: Vec<ExtentDescriptor>) {
        self.committed.lock().unwrap().insert(inode, extents);
    }
}

#[async_trait::async_trait]
impl MetaClient for MockMetaClient {
    async fn append_extent(
        &self,
        inode: Inode,
        extent: &ExtentDescriptor,
        discards: &[ExtentDescriptor],
    ) -> Result<(), MetaError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MetaError::Unavailable("mock failure".to_string()));
        }

        self.appends.lock().unwrap().push((*extent, discards.to_vec()));
        self.committed
            .lock()
            .unwrap()
            .entry(inode)
            .or_default()
            .push(*extent);

        Ok(())
    }

    async fn get_extents(&self, inode: Inode) -> Result<Vec<ExtentDescriptor>, MetaError> {
        Ok(self.committed.lock().unwrap().get(&inode).cloned().unwrap_or_default())
    }
}

/// Hands out queued partitions in order, each with a fresh extent id.
pub(crate) struct MockAllocator {
    partitions: Mutex<VecDeque<Arc<DataPartition>>>,
    allocations: AtomicUsize,
    next_extent_id: AtomicU64,
}

impl MockAllocator {
    fn new() -> Self {
        MockAllocator {
            partitions: Mutex::new(VecDeque::new()),
            allocations: AtomicUsize::new(0),
            next_extent_id: AtomicU64::new(2000),
        }
    }

    pub(crate) fn push(&self, partition: Arc<DataPartition>) {
        self.partitions.lock().unwrap().push_back(partition);
    }

    pub(crate) fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ExtentAllocator for MockAllocator {
    async fn allocate_extent(&self, _inode: Inode) -> Result<(Arc<DataPartition>, ExtentId), AllocateError> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        let partition = self
            .partitions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(AllocateError::NoWritablePartition)?;
        let extent_id = ExtentId::new(self.next_extent_id.fetch_add(1, Ordering::SeqCst));

        Ok((partition, extent_id))
    }
}

/// Master returning whatever views it was last given.
#[derive(Default)]
pub(crate) struct StaticMaster {
    views: Mutex<Vec<DataPartitionView>>,
}

impl StaticMaster {
    pub(crate) fn set_views(&self, views: Vec<DataPartitionView>) {
        *self.views.lock().unwrap() = views;
    }
}

#[async_trait::async_trait]
impl MasterClient for StaticMaster {
    async fn get_data_partitions(&self) -> Result<Vec<DataPartitionView>, MasterError> {
        Ok(self.views.lock().unwrap().clone())
    }
}

pub(crate) fn writable_view(id: u64, hosts: &[&str]) -> DataPartitionView {
    DataPartitionView {
        partition_id: id,
        status: PARTITION_READ_WRITE,
        replica_num: hosts.len() as u8,
        hosts: hosts.iter().map(|host| host.to_string()).collect(),
        leader_addr: String::new(),
        epoch: 0,
    }
}

/// A stream context wired to mock collaborators.
pub(crate) struct TestHarness {
    pub(crate) connector: Arc<MockConnector>,
    pub(crate) meta: Arc<MockMetaClient>,
    pub(crate) allocator: Arc<MockAllocator>,
    pub(crate) partitions: Arc<PartitionTable>,
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) stream: Arc<StreamContext>,
    pub(crate) logs: LogCapture,
    views: Mutex<Vec<DataPartitionView>>,
}

impl TestHarness {
    pub(crate) fn new(options: SessionOptions) -> Self {
        let connector = MockConnector::new();
        let meta = Arc::new(MockMetaClient::default());
        let allocator = Arc::new(MockAllocator::new());
        let partitions = Arc::new(PartitionTable::new(64, None));
        let logs = LogCapture::default();

        let shared = Arc::new(ClientShared {
            logger: logs.logger(),
            options,
            meta: meta.clone(),
            allocator: allocator.clone(),
            write_connector: connector.clone(),
            read_connector: connector.clone(),
            partitions: partitions.clone(),
            pool: WorkerPool::new(8),
            request_ids: Arc::new(RequestIdGenerator::new()),
        });
        let stream = StreamContext::new(Inode::new(1), shared.clone(), ExtentCache::new());

        TestHarness {
            connector,
            meta,
            allocator,
            partitions,
            shared,
            stream,
            logs,
            views: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.shared.request_ids.next()
    }

    /// Registers a writable partition in the table and returns the table's entry.
    pub(crate) fn partition(&self, id: u64, hosts: &[&str]) -> Arc<DataPartition> {
        let mut views = self.views.lock().unwrap();
        views.retain(|view| view.partition_id != id);
        views.push(writable_view(id, hosts));
        self.partitions.update(&views);

        self.partitions
            .get(PartitionId::new(id))
            .expect("partition registered")
    }

    /// A partition outside the table with its own writer limit.
    pub(crate) fn partition_with_limit(&self, id: u64, hosts: &[&str], limit: usize) -> Arc<DataPartition> {
        let members = hosts.iter().map(|host| host.to_string()).collect();
        Arc::new(DataPartition::new(PartitionId::new(id), members, limit).unwrap())
    }
}
