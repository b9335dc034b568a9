use crate::cache::{CacheError, CacheSegment, ExtentDescriptor};
use crate::extent::{
    ExtentReader, ExtentWriter, FlushError, ReaderCreateError, SessionState, StreamContext, WriterCreateError,
};
use crate::meta::{AllocateError, MetaError};
use crate::packet::{ExtentId, Inode, Packet, PacketError, PacketOwner, PartitionId};
use bytes::Bytes;
use std::cmp::min;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to allocate an extent")]
    Allocate(#[from] AllocateError),
    #[error("failed to open an extent writer")]
    CreateWriter(#[from] WriterCreateError),
    #[error("failed to open an extent reader")]
    CreateReader(#[from] ReaderCreateError),
    #[error("flush failed")]
    Flush(#[from] FlushError),
    #[error("I/O failed: {0}")]
    Packet(#[from] PacketError),
    #[error("metadata service error")]
    Meta(#[from] MetaError),
    #[error("unknown data partition {0}")]
    UnknownPartition(PartitionId),
    #[error("invalid extent from metadata")]
    Cache(#[from] CacheError),
}

/// One open file. Writes go through an active writer session, reads through per-extent reader
/// sessions, and flush commits every written extent to the metadata service.
pub struct ExtentStream {
    ctx: Arc<StreamContext>,
    active: Mutex<Option<Arc<ExtentWriter>>>,
    readers: Mutex<HashMap<(PartitionId, ExtentId), Arc<ExtentReader>>>,
}

impl ExtentStream {
    pub(crate) fn new(ctx: Arc<StreamContext>) -> Self {
        ExtentStream {
            ctx,
            active: Mutex::new(None),
            readers: Mutex::new(HashMap::new()),
        }
    }

    pub fn inode(&self) -> Inode {
        self.ctx.inode
    }

    /// Committed extents, in file order.
    pub fn extents(&self) -> Vec<ExtentDescriptor> {
        self.cache().extents()
    }

    /// Superseded ranges whose removal the metadata service has not confirmed yet.
    pub fn pending_discards(&self) -> Vec<ExtentDescriptor> {
        self.cache().pending_discards()
    }

    /// Size including written but uncommitted bytes.
    pub async fn file_size(&self) -> u64 {
        let committed = self.cache().file_size();
        let written = self
            .ctx
            .writers()
            .iter()
            .map(|writer| writer.next_file_offset())
            .max()
            .unwrap_or(0);

        committed.max(written)
    }

    /// Writes `data` at `file_offset` and waits until every packet is acknowledged by its
    /// replicas, possibly after failover. The data becomes visible to `read` after `flush`.
    pub async fn submit_write(&self, file_offset: u64, data: Bytes) -> Result<(), StreamError> {
        let packet_size = self.ctx.shared.options.packet_size as u64;
        let extent_size = self.ctx.shared.options.extent_size;

        let mut active = self.active.lock().await;
        let mut offset = file_offset;
        let mut remaining = data;
        let mut receipts = Vec::new();
        let mut first_error: Option<StreamError> = None;

        while !remaining.is_empty() {
            let writer = match self.writer_for(&mut active, offset).await {
                Ok(writer) => writer,
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            };
            let room = extent_size - writer.size();
            let chunk_len = min(min(packet_size, room), remaining.len() as u64) as usize;
            let chunk = remaining.split_to(chunk_len);

            let mut packet = Packet::new_write(self.ctx.shared.request_ids.next(), offset, chunk);
            receipts.push(packet.attach_completion());
            writer.request(packet);
            offset += chunk_len as u64;
        }

        for receipt in receipts {
            let outcome = receipt.wait().await;
            match outcome.result {
                Ok(_) => {
                    if let Some(PacketOwner::Writer(chain)) = outcome.owner {
                        *active = Some(chain);
                    }
                }
                Err(e) => {
                    slog::error!(
                        self.ctx.logger,
                        "Write at {} failed: {}",
                        outcome.kernel_offset,
                        e
                    );
                    if first_error.is_none() {
                        first_error = Some(StreamError::Packet(e));
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Reads committed data. Ranges no extent covers read as zeros.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Bytes, StreamError> {
        let packet_size = self.ctx.shared.options.packet_size as u64;
        let segments = self.cache().lookup(offset, len as u64);
        let mut buffer = vec![0u8; len];

        let mut readers = self.readers.lock().await;
        let mut receipts = Vec::new();
        for segment in segments {
            let extent = match segment {
                CacheSegment::Extent(extent) => extent,
                CacheSegment::Hole { .. } => continue,
            };
            let reader = self.reader_for(&mut readers, &extent).await?;

            let mut done = 0;
            while done < extent.size {
                let chunk = min(packet_size, extent.size - done);
                let mut packet = Packet::new_stream_read(
                    self.ctx.shared.request_ids.next(),
                    extent.partition_id,
                    extent.extent_id,
                    extent.extent_offset + done,
                    extent.file_offset + done,
                    chunk as u32,
                );
                receipts.push((packet.attach_completion(), (extent.partition_id, extent.extent_id)));
                reader.request(packet);
                done += chunk;
            }
        }

        let mut first_error = None;
        for (receipt, key) in receipts {
            let outcome = receipt.wait().await;
            match outcome.result {
                Ok(data) => {
                    let start = (outcome.kernel_offset - offset) as usize;
                    let n = min(data.len(), len - start);
                    buffer[start..start + n].copy_from_slice(&data[..n]);
                    if let Some(PacketOwner::Reader(chain)) = outcome.owner {
                        readers.insert(key, chain);
                    }
                }
                Err(e) => {
                    slog::error!(self.ctx.logger, "Read at {} failed: {}", outcome.kernel_offset, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(StreamError::Packet(e)),
            None => Ok(Bytes::from(buffer)),
        }
    }

    /// Commits every registered writer in registration order, then retires the clean ones
    /// other than the active writer.
    pub async fn flush(&self) -> Result<(), StreamError> {
        let active = self.active.lock().await;
        for writer in self.ctx.writers() {
            writer.flush().await?;
        }
        self.retire_clean((*active).as_ref()).await;

        Ok(())
    }

    /// Flushes, then releases every session whether or not the flush succeeded.
    pub async fn close(self) -> Result<(), StreamError> {
        let flushed = self.flush().await;

        self.active.lock().await.take();
        for writer in self.ctx.retain_writers(|_| false) {
            writer.detach_chain();
            writer.release().await;
        }
        for (_, reader) in self.readers.lock().await.drain() {
            reader.flush().await;
            reader.release().await;
        }
        slog::debug!(self.ctx.logger, "Stream closed");

        flushed
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, crate::cache::ExtentCache> {
        self.ctx
            .cache
            .lock()
            .expect("ExtentStream cache mutex guard poison")
    }

    async fn writer_for(
        &self,
        active: &mut Option<Arc<ExtentWriter>>,
        offset: u64,
    ) -> Result<Arc<ExtentWriter>, StreamError> {
        if let Some(writer) = active.as_ref() {
            if writer.state() == SessionState::Normal
                && writer.next_file_offset() == offset
                && writer.size() < self.ctx.shared.options.extent_size
            {
                return Ok(writer.clone());
            }
        }

        if let Some(previous) = active.take() {
            previous.flush().await?;
            self.retire_clean(None).await;
        }

        let (partition, extent_id) = self.ctx.shared.allocator.allocate_extent(self.ctx.inode).await?;
        let writer = ExtentWriter::create(&self.ctx, partition, offset, extent_id, 0, 0).await?;
        if let Err(limit) = self.ctx.register_writer(writer.clone()) {
            writer.release().await;
            return Err(StreamError::CreateWriter(WriterCreateError::TooManyWriters(limit)));
        }
        *active = Some(writer.clone());

        Ok(writer)
    }

    async fn retire_clean(&self, active: Option<&Arc<ExtentWriter>>) {
        let retired = self.ctx.retain_writers(|writer| {
            writer.is_dirty() || active.map_or(false, |active| Arc::ptr_eq(active, writer))
        });
        for writer in retired {
            // Its chain is registered on its own and may still hold uncommitted data.
            writer.detach_chain();
            writer.release().await;
        }
    }

    async fn reader_for(
        &self,
        readers: &mut HashMap<(PartitionId, ExtentId), Arc<ExtentReader>>,
        extent: &ExtentDescriptor,
    ) -> Result<Arc<ExtentReader>, StreamError> {
        let key = (extent.partition_id, extent.extent_id);
        if let Some(reader) = readers.get(&key) {
            if reader.state() != SessionState::Errored {
                return Ok(reader.clone());
            }
        }

        let partition = self
            .ctx
            .shared
            .partitions
            .get(extent.partition_id)
            .ok_or(StreamError::UnknownPartition(extent.partition_id))?;
        let reader = ExtentReader::create(&self.ctx, partition.clone(), partition.leader_idx(), extent.extent_id).await?;
        readers.insert(key, reader.clone());

        Ok(reader)
    }
}
