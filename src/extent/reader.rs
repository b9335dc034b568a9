use crate::extent::pipeline::{DrainSlot, InflightCounter, PacketQueue, SessionState, StateCell};
use crate::extent::retry::do_extent_request_retry;
use crate::extent::{StreamContext, WorkerPool};
use crate::packet::{ExtentId, Packet, PacketError, PacketOwner};
use crate::partition::DataPartition;
use crate::transport::{Transport, TransportError};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, thiserror::Error)]
pub enum ReaderCreateError {
    #[error("failed to connect to {addr}")]
    Connect { addr: String, source: TransportError },
}

/// Read session on one extent through one replica. On failure it moves to the next replica of
/// the same partition, since every replica holds the same extent data.
pub(crate) struct ExtentReader {
    logger: slog::Logger,
    stream: Weak<StreamContext>,
    partition: Arc<DataPartition>,
    extent_id: ExtentId,
    host_idx: usize,
    tx_queue: PacketQueue,
    rx_queue: PacketQueue,
    tx_inflight: InflightCounter,
    rx_inflight: InflightCounter,
    tx_drain: DrainSlot,
    rx_drain: DrainSlot,
    state: StateCell,
    recover: Mutex<Option<Arc<ExtentReader>>>,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
}

impl ExtentReader {
    /// Reads always go over the stream-socket connector, even when writes use RDMA.
    pub(crate) async fn create(
        stream: &Arc<StreamContext>,
        partition: Arc<DataPartition>,
        host_idx: usize,
        extent_id: ExtentId,
    ) -> Result<Arc<Self>, ReaderCreateError> {
        let host_idx = host_idx % partition.num_members();
        let addr = partition.members()[host_idx].clone();
        let transport = stream
            .shared
            .read_connector
            .connect(&addr)
            .await
            .map_err(|source| ReaderCreateError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let logger = stream.logger.new(slog::o!(
            "Partition" => partition.id().as_u64(),
            "Extent" => extent_id.as_u64(),
            "Host" => addr.clone(),
        ));
        slog::info!(logger, "New extent reader");

        Ok(Arc::new(ExtentReader {
            logger,
            stream: Arc::downgrade(stream),
            partition,
            extent_id,
            host_idx,
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
        }))
    }

    pub(crate) fn extent_id(&self) -> ExtentId {
        self.extent_id
    }

    pub(crate) fn host_idx(&self) -> usize {
        self.host_idx
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

    pub(crate) fn recovery_chain(&self) -> Option<Arc<ExtentReader>> {
        self.recover
            .lock()
            .expect("ExtentReader.recovery_chain() mutex guard poison")
            .clone()
    }

    /// Queues a read packet already addressed to this reader's extent.
    pub(crate) fn request(self: &Arc<Self>, packet: Packet) {
        self.tx_inflight.add(1);
        self.tx_queue.push(packet);
        self.schedule_tx();
    }

    /// Reads have nothing to commit; flushing only waits for quiescence.
    pub(crate) async fn flush(&self) {
        while self.tx_inflight.get() > 0 || self.rx_inflight.get() > 0 {
            self.tx_inflight.wait_until_zero().await;
            self.rx_inflight.wait_until_zero().await;
        }
    }

    pub(crate) async fn release(&self) {
        self.shutdown().await;

        let mut next = self.take_chain();
        while let Some(chain) = next {
            chain.shutdown().await;
            next = chain.take_chain();
        }
    }

    async fn shutdown(&self) {
        self.tx_drain.abort();
        self.rx_drain.abort();
        self.transport.close().await;
    }

    fn take_chain(&self) -> Option<Arc<ExtentReader>> {
        self.recover
            .lock()
            .expect("ExtentReader.take_chain() mutex guard poison")
            .take()
    }

    fn schedule_tx(self: &Arc<Self>) {
        self.tx_drain.schedule(|| {
            let reader = self.clone();
            self.pool.spawn(reader.run_tx())
        });
    }

    fn schedule_rx(self: &Arc<Self>) {
        self.rx_drain.schedule(|| {
            let reader = self.clone();
            self.pool.spawn(reader.run_rx())
        });
    }

    async fn run_tx(self: Arc<Self>) {
        loop {
            let mut drained = 0;
            while let Some(packet) = self.tx_queue.pop() {
                if self.state.get() == SessionState::Normal {
                    if let Err(e) = self.transport.send(&packet).await {
                        slog::warn!(self.logger, "Failed to send read {}: {:?}", packet.request_id(), e);
                        if e.is_resource_exhausted() {
                            self.state.mark_errored();
                        } else {
                            self.state.mark_recovering();
                        }
                    }
                }
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
            SessionState::Errored => packet.fail(PacketError::Io),
            SessionState::Recovering => self.recover(packet).await,
            SessionState::Normal => {
                match self.transport.recv(packet).await {
                    Ok(()) if !packet.reply_ok() => {
                        let result_code = packet.reply().map(|reply| reply.header.result_code);
                        slog::warn!(self.logger, "Read {} rejected: {:?}", packet.request_id(), result_code);
                    }
                    Ok(()) => match packet.read_reply_mismatch() {
                        None => return,
                        Some(actual) => slog::warn!(
                            self.logger,
                            "Read {} returned {} of {} bytes",
                            packet.request_id(),
                            actual,
                            packet.len()
                        ),
                    },
                    Err(e) => slog::warn!(self.logger, "No reply for read {}: {:?}", packet.request_id(), e),
                }
                self.state.mark_recovering();
                self.recover(packet).await;
            }
        }
    }

    /// Retries `packet` across the partition's replicas, each at most once, starting after the
    /// recorded leader (or at the current chain's replica).
    async fn recover(self: &Arc<Self>, packet: &mut Packet) {
        let stream = match self.stream.upgrade() {
            Some(stream) => stream,
            None => {
                packet.fail(PacketError::Io);
                return;
            }
        };
        let stride = stream.shared.options.reader_failover_stride;
        let start = match self.recovery_chain() {
            Some(chain) => chain.host_idx,
            None => self.partition.leader_idx() + stride,
        };
        let order = self.partition.failover_order(start, stride);

        let result = do_extent_request_retry(
            &self.logger,
            stream.shared.read_connector.as_ref(),
            self.partition.members(),
            &order,
            packet,
        )
        .await;

        match result {
            Ok(host_idx) => {
                if let Err(e) = self.partition.set_leader(host_idx) {
                    slog::warn!(self.logger, "{}", e);
                }
                if let Some(chain) = self.chain_at(&stream, host_idx).await {
                    packet.owner = Some(PacketOwner::Reader(chain));
                }
            }
            Err(e) => {
                slog::error!(
                    self.logger,
                    "Read {} failed on all {} replicas: {:?}",
                    packet.request_id(),
                    order.len(),
                    e
                );
                packet.fail(PacketError::Io);
                if let Some(chain) = self.take_chain() {
                    chain.release().await;
                }
            }
        }
    }

    /// Recovery reader bound to `host_idx`, reusing the current one when it already is.
    async fn chain_at(self: &Arc<Self>, stream: &Arc<StreamContext>, host_idx: usize) -> Option<Arc<ExtentReader>> {
        if let Some(chain) = self.recovery_chain() {
            if chain.host_idx == host_idx {
                return Some(chain);
            }
        }

        match ExtentReader::create(stream, self.partition.clone(), host_idx, self.extent_id).await {
            Ok(chain) => {
                let previous = self
                    .recover
                    .lock()
                    .expect("ExtentReader.chain_at() mutex guard poison")
                    .replace(chain.clone());
                if let Some(previous) = previous {
                    previous.release().await;
                }
                Some(chain)
            }
            Err(e) => {
                slog::warn!(self.logger, "Failed to create recovery reader: {:?}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketReceipt, ResultCode};
    use crate::test_utils::{self, ReplicaBehavior, TestHarness};

    fn read_packet(harness: &TestHarness, partition: &DataPartition, extent_offset: u64, len: u32) -> (Packet, PacketReceipt) {
        let mut packet = Packet::new_stream_read(
            harness.next_request_id(),
            partition.id(),
            ExtentId::new(7),
            extent_offset,
            extent_offset,
            len,
        );
        let receipt = packet.attach_completion();

        (packet, receipt)
    }

    #[tokio::test]
    async fn reads_from_the_chosen_replica() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0", "r1", "r2"]);
        harness.connector.put_extent_data(&["r0", "r1", "r2"], 1, 7, b"0123456789");

        let reader = ExtentReader::create(&harness.stream, partition.clone(), 4, ExtentId::new(7))
            .await
            .unwrap();
        assert_eq!(reader.host_idx(), 1);

        let (first, first_receipt) = read_packet(&harness, &partition, 0, 4);
        let (second, second_receipt) = read_packet(&harness, &partition, 4, 6);
        reader.request(first);
        reader.request(second);

        assert_eq!(&test_utils::wait(first_receipt).await.result.unwrap()[..], b"0123");
        assert_eq!(&test_utils::wait(second_receipt).await.result.unwrap()[..], b"456789");
        reader.flush().await;
        assert_eq!(reader.tx_inflight(), 0);
        assert_eq!(reader.rx_inflight(), 0);
        assert_eq!(harness.connector.requests_to("r1").len(), 2);
        assert!(harness.connector.requests_to("r0").is_empty());
    }

    #[tokio::test]
    async fn reader_creation_logs_at_info() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0"]);

        ExtentReader::create(&harness.stream, partition, 0, ExtentId::new(7))
            .await
            .unwrap();

        assert_eq!(harness.logs.level_of("New extent reader"), Some(slog::Level::Info));
    }

    #[tokio::test]
    async fn failover_moves_to_next_replica_and_updates_leader() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0", "r1", "r2"]);
        harness.connector.put_extent_data(&["r0", "r1", "r2"], 1, 7, b"abcdef");
        harness.connector.set_behavior("r0", ReplicaBehavior::Reject(ResultCode::NotExist));

        let reader = ExtentReader::create(&harness.stream, partition.clone(), 0, ExtentId::new(7))
            .await
            .unwrap();
        let (packet, receipt) = read_packet(&harness, &partition, 0, 6);
        reader.request(packet);
        let outcome = test_utils::wait(receipt).await;

        assert_eq!(&outcome.result.unwrap()[..], b"abcdef");
        assert_eq!(outcome.retry_count, 1);
        assert_eq!(partition.leader_idx(), 1);
        assert_eq!(reader.state(), SessionState::Recovering);
        match outcome.owner {
            Some(PacketOwner::Reader(chain)) => {
                assert_eq!(chain.host_idx(), 1);
                assert!(Arc::ptr_eq(&chain, &reader.recovery_chain().unwrap()));
            }
            other => panic!("Expected reader chain, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failover_visits_each_replica_once_starting_after_leader() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0", "r1", "r2", "r3"]);
        partition.set_leader(2).unwrap();
        for host in &["r0", "r1", "r2", "r3"] {
            harness.connector.set_behavior(host, ReplicaBehavior::DropReply);
        }

        let reader = ExtentReader::create(&harness.stream, partition.clone(), 2, ExtentId::new(7))
            .await
            .unwrap();
        harness.connector.clear_connect_log();

        let (packet, receipt) = read_packet(&harness, &partition, 0, 1);
        reader.request(packet);
        let outcome = test_utils::wait(receipt).await;

        assert_eq!(outcome.result.unwrap_err(), PacketError::Io);
        assert_eq!(outcome.retry_count, 4);
        assert_eq!(harness.connector.connect_log(), vec!["r3", "r0", "r1", "r2"]);
        assert_eq!(partition.leader_idx(), 2);
        assert!(reader.recovery_chain().is_none());
    }

    #[tokio::test]
    async fn exhausted_transport_fails_without_failover() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0", "r1"]);
        harness.connector.set_behavior("r0", ReplicaBehavior::ExhaustedSend);

        let reader = ExtentReader::create(&harness.stream, partition.clone(), 0, ExtentId::new(7))
            .await
            .unwrap();
        let (packet, receipt) = read_packet(&harness, &partition, 0, 1);
        reader.request(packet);

        assert_eq!(test_utils::wait(receipt).await.result.unwrap_err(), PacketError::Io);
        assert_eq!(reader.state(), SessionState::Errored);
        assert!(harness.connector.requests_to("r1").is_empty());
    }

    #[tokio::test]
    async fn short_reply_fails_over_instead_of_returning_partial_data() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0", "r1", "r2"]);
        harness.connector.put_extent_data(&["r0", "r1", "r2"], 1, 7, b"ABCDEFGH");
        harness.connector.set_behavior("r0", ReplicaBehavior::ShortRead(2));
        harness.connector.set_behavior("r1", ReplicaBehavior::LongRead(4));

        let reader = ExtentReader::create(&harness.stream, partition.clone(), 0, ExtentId::new(7))
            .await
            .unwrap();
        let (packet, receipt) = read_packet(&harness, &partition, 0, 8);
        reader.request(packet);
        let outcome = test_utils::wait(receipt).await;

        assert_eq!(&outcome.result.unwrap()[..], b"ABCDEFGH");
        assert_eq!(outcome.retry_count, 2);
        assert_eq!(partition.leader_idx(), 2);
        assert_eq!(reader.state(), SessionState::Recovering);
    }

    #[tokio::test]
    async fn short_replies_everywhere_fail_the_read() {
        let harness = TestHarness::new(test_utils::options());
        let partition = harness.partition(1, &["r0", "r1"]);
        harness.connector.put_extent_data(&["r0", "r1"], 1, 7, b"ABCDEFGH");
        for host in &["r0", "r1"] {
            harness.connector.set_behavior(host, ReplicaBehavior::ShortRead(2));
        }

        let reader = ExtentReader::create(&harness.stream, partition.clone(), 0, ExtentId::new(7))
            .await
            .unwrap();
        let (packet, receipt) = read_packet(&harness, &partition, 0, 8);
        reader.request(packet);

        assert_eq!(test_utils::wait(receipt).await.result.unwrap_err(), PacketError::Io);
    }
}
