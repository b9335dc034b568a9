use crate::api::client::ExtentClient;
use crate::api::options::ExtentClientOptionsValidated;
use crate::extent::{ClientShared, SessionOptions, WorkerPool};
use crate::meta::{ExtentAllocator, MasterClient, MasterError, MetaClient, PartitionExtentAllocator};
use crate::packet::RequestIdGenerator;
use crate::partition::{refresh_partitions, spawn_partition_refresh, PartitionTable};
use crate::transport::{Connector, TcpConnector};
use crate::ExtentClientOptions;
use std::convert::TryFrom;
use std::sync::Arc;

pub struct ExtentClientConfig {
    pub master: Arc<dyn MasterClient>,
    pub meta: Arc<dyn MetaClient>,
    // Defaults to creating extents directly on a writable partition's primary.
    pub allocator: Option<Arc<dyn ExtentAllocator>>,
    // Defaults to a `TcpConnector` using the configured timeouts.
    pub connector: Option<Arc<dyn Connector>>,
    // Writer sessions use this one when RDMA is enabled.
    pub rdma_connector: Option<Arc<dyn Connector>>,
    pub info_logger: slog::Logger,
    pub options: ExtentClientOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtentClientCreationError {
    #[error("Illegal options for configuring client: {0}")]
    IllegalClientOptions(String),
    #[error("RDMA is enabled but no RDMA connector was given")]
    MissingRdmaConnector,
    #[error("Failed to load data partitions")]
    PartitionLoad(#[source] MasterError),
}

pub async fn try_create_extent_client(config: ExtentClientConfig) -> Result<ExtentClient, ExtentClientCreationError> {
    let root_logger = config.info_logger;

    let options = ExtentClientOptionsValidated::try_from(config.options)
        .map_err(|e| ExtentClientCreationError::IllegalClientOptions(e.to_string()))?;

    let read_connector: Arc<dyn Connector> = match config.connector {
        Some(connector) => connector,
        None => Arc::new(TcpConnector::new(options.connect_timeout, options.recv_timeout)),
    };
    let (write_connector, rdma_port) = if options.enable_rdma {
        let connector = config
            .rdma_connector
            .ok_or(ExtentClientCreationError::MissingRdmaConnector)?;
        (connector, options.rdma_port)
    } else {
        (read_connector.clone(), None)
    };

    let partitions = Arc::new(PartitionTable::new(options.max_writers_per_partition, rdma_port));
    refresh_partitions(&root_logger, config.master.as_ref(), &partitions)
        .await
        .map_err(ExtentClientCreationError::PartitionLoad)?;
    let refresh_handle = spawn_partition_refresh(
        root_logger.clone(),
        config.master.clone(),
        &partitions,
        options.partition_refresh_interval,
    );

    let request_ids = Arc::new(RequestIdGenerator::new());
    let allocator: Arc<dyn ExtentAllocator> = match config.allocator {
        Some(allocator) => allocator,
        None => Arc::new(PartitionExtentAllocator::new(
            root_logger.clone(),
            partitions.clone(),
            write_connector.clone(),
            request_ids.clone(),
            options.enable_rdma,
        )),
    };

    let shared = Arc::new(ClientShared {
        logger: root_logger.clone(),
        options: SessionOptions {
            request_retry_max: options.request_retry_max,
            max_writers_per_stream: options.max_writers_per_stream,
            reader_failover_stride: options.reader_failover_stride,
            packet_size: options.packet_size,
            extent_size: options.extent_size,
            enable_rdma: options.enable_rdma,
        },
        meta: config.meta,
        allocator,
        write_connector,
        read_connector,
        partitions,
        pool: WorkerPool::new(options.worker_pool_size),
        request_ids,
    });
    slog::info!(
        root_logger,
        "Extent client ready with {} data partitions (rdma: {})",
        shared.partitions.len(),
        options.enable_rdma
    );

    Ok(ExtentClient::new(shared, config.master, refresh_handle))
}
