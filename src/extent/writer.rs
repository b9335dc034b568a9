use crate::cache::{CacheError, ExtentDescriptor};
use crate::extent::pipeline::{DrainSlot, InflightCounter, PacketQueue, SessionState, StateCell};
use crate::extent::retry::do_extent_request;
use crate::extent::{StreamContext, WorkerPool};
use crate::meta::{AllocateError, MetaError};
use crate::packet::{ExtentId, Packet, PacketError, PacketOwner};
use crate::partition::{DataPartition, PartitionError, WriterAdmission};
use crate::transport::{Transport, TransportError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, thiserror::Error)]
pub enum WriterCreateError {
    #[error("partition refused a new writer")]
    Admission(#[from] PartitionError),
    #[error("stream already has {0} writers")]
    TooManyWriters(usize),
    #[error("failed to connect to {addr}")]
    Connect { addr: String, source: TransportError },
}

impl WriterCreateError {
    pub(crate) fn packet_error(&self) -> PacketError {
        match self {
            WriterCreateError::Admission(_) | WriterCreateError::TooManyWriters(_) => PacketError::PermissionDenied,
            WriterCreateError::Connect { source, .. } if source.is_resource_exhausted() => {
                PacketError::ResourceExhausted
            }
            WriterCreateError::Connect { .. } => PacketError::Io,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("stream is closed")]
    StreamClosed,
    #[error("failed to cache extent")]
    Cache(#[from] CacheError),
    #[error("failed to record extent in metadata")]
    Meta(#[from] MetaError),
}

enum ChainError {
    /// The packet fails without further attempts.
    Fatal(PacketError),
    /// Counts as one failed attempt.
    Retryable(WriterCreateError),
}

/// Write session on one extent: a transmit queue feeding the primary replica, a receive queue
/// collecting replies, and recovery onto a freshly allocated extent when a replica misbehaves.
pub(crate) struct ExtentWriter {
    logger: slog::Logger,
    stream: Weak<StreamContext>,
    partition: Arc<DataPartition>,
    _admission: WriterAdmission,
    extent_id: ExtentId,
    extent_offset: u64,
    file_offset: u64,
    size: AtomicU64,
    dirty: AtomicBool,
    tx_queue: PacketQueue,
    rx_queue: PacketQueue,
    tx_inflight: InflightCounter,
    rx_inflight: InflightCounter,
    tx_drain: DrainSlot,
    rx_drain: DrainSlot,
    state: StateCell,
    recover: Mutex<Option<Arc<ExtentWriter>>>,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    rdma: bool,
}

impl ExtentWriter {
    /// Connects to the partition's primary replica. `extent_size` is how much of the extent,
    /// starting at `extent_offset`, already holds this file's data.
    pub(crate) async fn create(
        stream: &Arc<StreamContext>,
        partition: Arc<DataPartition>,
        file_offset: u64,
        extent_id: ExtentId,
        extent_offset: u64,
        extent_size: u64,
    ) -> Result<Arc<Self>, WriterCreateError> {
        let admission = partition.admit_writer()?;
        let rdma = stream.shared.options.enable_rdma;
        let addr = partition.members_for(rdma)[0].clone();
        let transport = stream
            .shared
            .write_connector
            .connect(&addr)
            .await
            .map_err(|source| WriterCreateError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let logger = stream.logger.new(slog::o!(
            "Partition" => partition.id().as_u64(),
            "Extent" => extent_id.as_u64(),
        ));
        slog::info!(logger, "New extent writer at file offset {} via {}", file_offset, addr);

        Ok(Arc::new(ExtentWriter {
            logger,
            stream: Arc::downgrade(stream),
            partition,
            _admission: admission,
            extent_id,
            extent_offset,
            file_offset,
            size: AtomicU64::new(extent_size),
            dirty: AtomicBool::new(false),
            tx_queue: PacketQueue::default(),
            rx_queue: PacketQueue::default(),
            tx_inflight: InflightCounter::default(),
            rx_inflight: InflightCounter::default(),
            tx_drain: DrainSlot::default(),
            rx_drain: DrainSlot::default(),
            state: StateCell::new(),
            recover: Mutex::new(None),
            transport,
            pool: stream.shared.pool.clone(),
            rdma,
        }))
    }

    pub(crate) fn extent_id(&self) -> ExtentId {
        self.extent_id
    }

    pub(crate) fn partition(&self) -> &Arc<DataPartition> {
        &self.partition
    }

    pub(crate) fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// File offset right after the last byte this writer holds.
    pub(crate) fn next_file_offset(&self) -> u64 {
        self.file_offset + self.size()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state.get()
    }

    pub(crate) fn tx_inflight(&self) -> usize {
        self.tx_inflight.get()
    }

    pub(crate) fn rx_inflight(&self) -> usize {
        self.rx_inflight.get()
    }

    pub(crate) fn recovery_chain(&self) -> Option<Arc<ExtentWriter>> {
        self.recover
            .lock()
            .expect("ExtentWriter.recovery_chain() mutex guard poison")
            .clone()
    }

    /// Unlinks the recovery chain without releasing it.
    pub(crate) fn detach_chain(&self) -> Option<Arc<ExtentWriter>> {
        self.recover
            .lock()
            .expect("ExtentWriter.detach_chain() mutex guard poison")
            .take()
    }

    /// Queues `packet` for transmission. The outcome arrives through the packet's completion.
    pub(crate) fn request(self: &Arc<Self>, mut packet: Packet) {
        let kernel_offset = packet.kernel_offset();
        debug_assert!(kernel_offset >= self.file_offset);
        let end = kernel_offset + packet.len();

        packet.retarget(
            self.partition.id(),
            self.extent_id,
            self.extent_offset_of(kernel_offset),
            self.partition.follower_addrs(self.rdma),
        );
        self.size.fetch_max(end - self.file_offset, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);

        self.tx_inflight.add(1);
        self.tx_queue.push(packet);
        self.schedule_tx();
    }

    /// Waits for quiescence, then commits the written range to the stream's cache and to the
    /// metadata service. On a metadata failure the writer stays dirty and the superseded ranges
    /// stay pending, so a later flush retries the whole commit.
    pub(crate) async fn flush(&self) -> Result<(), FlushError> {
        if !self.is_dirty() {
            return Ok(());
        }
        self.wait_quiescent().await;

        let size = self.size();
        if size == 0 {
            self.dirty.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let stream = self.stream.upgrade().ok_or(FlushError::StreamClosed)?;
        let extent = self.descriptor(size);
        let mut discards = Vec::new();
        stream
            .cache
            .lock()
            .expect("ExtentWriter.flush() cache mutex guard poison")
            .append(extent, true, &mut discards)?;

        if let Err(e) = stream.shared.meta.append_extent(stream.inode, &extent, &discards).await {
            slog::error!(self.logger, "Failed to record {:?} in metadata: {:?}", extent, e);
            return Err(FlushError::Meta(e));
        }

        stream
            .cache
            .lock()
            .expect("ExtentWriter.flush() cache mutex guard poison")
            .remove_discard(&discards);
        // A request that raced with the commit leaves the writer dirty.
        if self.size() == size {
            self.dirty.store(false, Ordering::SeqCst);
        }
        slog::debug!(self.logger, "Committed {:?}, discarded {}", extent, discards.len());

        Ok(())
    }

    /// Stops the pipelines and closes the connection, for this writer and its whole recovery
    /// chain. Packets still queued complete as cancelled.
    pub(crate) async fn release(&self) {
        self.shutdown().await;

        let mut next = self.detach_chain();
        while let Some(chain) = next {
            chain.shutdown().await;
            next = chain.detach_chain();
        }
    }

    async fn shutdown(&self) {
        self.tx_drain.abort();
        self.rx_drain.abort();
        self.transport.close().await;
    }

    async fn wait_quiescent(&self) {
        while self.tx_inflight.get() > 0 || self.rx_inflight.get() > 0 {
            self.tx_inflight.wait_until_zero().await;
            self.rx_inflight.wait_until_zero().await;
        }
    }

    fn descriptor(&self, size: u64) -> ExtentDescriptor {
        ExtentDescriptor {
            file_offset: self.file_offset,
            partition_id: self.partition.id(),
            extent_id: self.extent_id,
            extent_offset: self.extent_offset,
            size,
        }
    }

    fn extent_offset_of(&self, kernel_offset: u64) -> u64 {
        self.extent_offset + (kernel_offset - self.file_offset)
    }

    fn primary_addr(&self) -> &str {
        &self.partition.members_for(self.rdma)[0]
    }

    /// Bytes from `kernel_offset` on did not land in this extent.
    fn truncate_at(&self, kernel_offset: u64) {
        self.size
            .fetch_min(kernel_offset.saturating_sub(self.file_offset), Ordering::SeqCst);
    }

    fn record_recovered(&self, kernel_offset: u64, len: u64) {
        self.size
            .fetch_max(kernel_offset + len - self.file_offset, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn schedule_tx(self: &Arc<Self>) {
        self.tx_drain.schedule(|| {
            let writer = self.clone();
            self.pool.spawn(writer.run_tx())
        });
    }

    fn schedule_rx(self: &Arc<Self>) {
        self.rx_drain.schedule(|| {
            let writer = self.clone();
            self.pool.spawn(writer.run_rx())
        });
    }

    async fn run_tx(self: Arc<Self>) {
        loop {
            let mut drained = 0;
            while let Some(packet) = self.tx_queue.pop() {
                self.transmit(&packet).await;
                // Sent or not, every packet gets a reply-side pass.
                self.rx_inflight.add(1);
                self.rx_queue.push(packet);
                self.schedule_rx();
                drained += 1;
            }
            self.tx_inflight.sub(drained);

            if !self.tx_drain.finish(&self.tx_queue) {
                return;
            }
        }
    }

    async fn transmit(&self, packet: &Packet) {
        if self.state.get() != SessionState::Normal {
            return;
        }

        if let Err(e) = self.transport.send(packet).await {
            slog::warn!(self.logger, "Failed to send packet {}: {:?}", packet.request_id(), e);
            if e.is_resource_exhausted() {
                self.state.mark_errored();
            } else {
                self.state.mark_recovering();
            }
        }
    }

    async fn run_rx(self: Arc<Self>) {
        loop {
            let mut drained = 0;
            while let Some(mut packet) = self.rx_queue.pop() {
                self.receive(&mut packet).await;
                packet.complete();
                drained += 1;
            }
            self.rx_inflight.sub(drained);

            if !self.rx_drain.finish(&self.rx_queue) {
                return;
            }
        }
    }

    async fn receive(self: &Arc<Self>, packet: &mut Packet) {
        match self.state.get() {
            SessionState::Errored => {
                self.truncate_at(packet.kernel_offset());
                packet.fail(PacketError::Io);
            }
            SessionState::Recovering => self.recover(packet).await,
            SessionState::Normal => match self.transport.recv(packet).await {
                Ok(()) if packet.reply_ok() => {
                    slog::debug!(self.logger, "Packet {} acknowledged", packet.request_id());
                }
                Ok(()) => {
                    let result_code = packet.reply().map(|reply| reply.header.result_code);
                    slog::warn!(
                        self.logger,
                        "Packet {} rejected by replica: {:?}",
                        packet.request_id(),
                        result_code
                    );
                    self.state.mark_recovering();
                    self.recover(packet).await;
                }
                Err(e) => {
                    slog::warn!(self.logger, "No reply for packet {}: {:?}", packet.request_id(), e);
                    self.state.mark_recovering();
                    self.recover(packet).await;
                }
            },
        }
    }

    /// Resends `packet` to the recovery chain, creating the chain on a new extent if needed.
    async fn recover(self: &Arc<Self>, packet: &mut Packet) {
        let kernel_offset = packet.kernel_offset();
        self.truncate_at(kernel_offset);

        let stream = match self.stream.upgrade() {
            Some(stream) => stream,
            None => {
                packet.fail(PacketError::Io);
                self.state.mark_errored();
                return;
            }
        };
        let retry_max = stream.shared.options.request_retry_max;

        loop {
            packet.retry_count += 1;

            let chain = match self.recovery_chain() {
                Some(chain) => chain,
                None => match self.create_chain(&stream, kernel_offset).await {
                    Ok(chain) => chain,
                    Err(ChainError::Fatal(e)) => {
                        slog::error!(self.logger, "Cannot recover packet {}: {}", packet.request_id(), e);
                        packet.fail(e);
                        self.state.mark_errored();
                        return;
                    }
                    Err(ChainError::Retryable(e)) => {
                        slog::warn!(self.logger, "Failed to create recovery writer: {:?}", e);
                        if packet.retry_count >= retry_max {
                            self.give_up(packet);
                            return;
                        }
                        continue;
                    }
                },
            };

            packet.retarget(
                chain.partition.id(),
                chain.extent_id,
                chain.extent_offset_of(kernel_offset),
                chain.partition.follower_addrs(self.rdma),
            );

            match do_extent_request(stream.shared.write_connector.as_ref(), chain.primary_addr(), packet).await {
                Ok(()) => {
                    if let Err(e) = chain.partition.set_leader(0) {
                        slog::warn!(self.logger, "{}", e);
                    }
                    chain.record_recovered(kernel_offset, packet.len());
                    packet.owner = Some(PacketOwner::Writer(chain.clone()));
                    slog::info!(
                        self.logger,
                        "Packet {} recovered to extent {} on partition {} (attempt {})",
                        packet.request_id(),
                        chain.extent_id,
                        chain.partition.id(),
                        packet.retry_count
                    );
                    return;
                }
                Err(e) => {
                    slog::warn!(
                        self.logger,
                        "Recovery attempt {} for packet {} failed: {:?}",
                        packet.retry_count,
                        packet.request_id(),
                        e
                    );
                    self.drop_chain(&stream, &chain).await;
                    if packet.retry_count >= retry_max {
                        self.give_up(packet);
                        return;
                    }
                }
            }
        }
    }

    fn give_up(&self, packet: &mut Packet) {
        slog::error!(
            self.logger,
            "Packet {} failed after {} recovery attempts",
            packet.request_id(),
            packet.retry_count
        );
        packet.fail(PacketError::Io);
        self.state.mark_errored();
    }

    async fn create_chain(
        self: &Arc<Self>,
        stream: &Arc<StreamContext>,
        kernel_offset: u64,
    ) -> Result<Arc<ExtentWriter>, ChainError> {
        if stream.writer_count() >= stream.shared.options.max_writers_per_stream {
            return Err(ChainError::Fatal(PacketError::PermissionDenied));
        }

        let (partition, extent_id) = stream
            .shared
            .allocator
            .allocate_extent(stream.inode)
            .await
            .map_err(|e| {
                slog::error!(self.logger, "Failed to allocate recovery extent: {}", e);
                match e {
                    AllocateError::NoWritablePartition => ChainError::Fatal(PacketError::NoPartition),
                    _ => ChainError::Fatal(PacketError::Io),
                }
            })?;

        let chain = match ExtentWriter::create(stream, partition, kernel_offset, extent_id, 0, 0).await {
            Ok(chain) => chain,
            Err(e @ WriterCreateError::Connect { .. }) if e.packet_error() == PacketError::Io => {
                return Err(ChainError::Retryable(e));
            }
            Err(e) => return Err(ChainError::Fatal(e.packet_error())),
        };

        if stream.register_writer(chain.clone()).is_err() {
            chain.release().await;
            return Err(ChainError::Fatal(PacketError::PermissionDenied));
        }
        *self
            .recover
            .lock()
            .expect("ExtentWriter.create_chain() mutex guard poison") = Some(chain.clone());

        Ok(chain)
    }

    /// A chain that never took data is torn down. One holding recovered packets stays registered
    /// so the stream still commits what it has.
    async fn drop_chain(&self, stream: &Arc<StreamContext>, chain: &Arc<ExtentWriter>) {
        {
            let mut recover = self
                .recover
                .lock()
                .expect("ExtentWriter.drop_chain() mutex guard poison");
            if recover.as_ref().map_or(false, |current| Arc::ptr_eq(current, chain)) {
                recover.take();
            }
        }
        chain.state.mark_errored();

        if chain.size() == 0 {
            stream.unregister_writer(chain);
            chain.release().await;
        }
    }
}
