use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct ExtentClientOptions {
    /// Recovery attempts per packet before it fails.
    pub request_retry_max: Option<u32>,
    pub max_writers_per_stream: Option<usize>,
    pub max_writers_per_partition: Option<usize>,
    /// Step between replicas a reader tries after a failure.
    pub reader_failover_stride: Option<usize>,
    pub worker_pool_size: Option<usize>,
    pub packet_size: Option<usize>,
    pub extent_size: Option<u64>,
    pub connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub partition_refresh_interval: Option<Duration>,
    pub enable_rdma: Option<bool>,
    pub rdma_port: Option<u16>,
}

#[derive(Clone, Debug)]
pub(super) struct ExtentClientOptionsValidated {
    pub request_retry_max: u32,
    pub max_writers_per_stream: usize,
    pub max_writers_per_partition: usize,
    pub reader_failover_stride: usize,
    pub worker_pool_size: usize,
    pub packet_size: usize,
    pub extent_size: u64,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    pub partition_refresh_interval: Duration,
    pub enable_rdma: bool,
    pub rdma_port: Option<u16>,
}

impl ExtentClientOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.request_retry_max == 0 {
            return Err("Request retry max must be at least 1");
        }
        if self.max_writers_per_stream == 0 || self.max_writers_per_partition == 0 {
            return Err("Writer ceilings must be at least 1");
        }
        if self.reader_failover_stride == 0 {
            return Err("Reader failover stride must be at least 1");
        }
        if self.worker_pool_size == 0 {
            return Err("Worker pool must have at least one worker");
        }
        if self.packet_size == 0 || self.packet_size as u64 > self.extent_size {
            return Err("Packet size must be non-zero and no larger than the extent size");
        }
        if self.connect_timeout == Duration::from_secs(0) || self.recv_timeout == Duration::from_secs(0) {
            return Err("Connect and receive timeouts must be non-zero");
        }
        if self.partition_refresh_interval == Duration::from_secs(0) {
            return Err("Partition refresh interval must be non-zero");
        }
        if self.enable_rdma && self.rdma_port.is_none() {
            return Err("RDMA requires an RDMA port");
        }

        Ok(())
    }
}

impl TryFrom<ExtentClientOptions> for ExtentClientOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ExtentClientOptions) -> Result<Self, Self::Error> {
        let values = ExtentClientOptionsValidated {
            request_retry_max: options.request_retry_max.unwrap_or(5),
            max_writers_per_stream: options.max_writers_per_stream.unwrap_or(16),
            max_writers_per_partition: options.max_writers_per_partition.unwrap_or(64),
            reader_failover_stride: options.reader_failover_stride.unwrap_or(1),
            worker_pool_size: options.worker_pool_size.unwrap_or(8),
            packet_size: options.packet_size.unwrap_or(128 * 1024),
            extent_size: options.extent_size.unwrap_or(128 * 1024 * 1024),
            connect_timeout: options.connect_timeout.unwrap_or(Duration::from_secs(5)),
            recv_timeout: options.recv_timeout.unwrap_or(Duration::from_secs(5)),
            partition_refresh_interval: options.partition_refresh_interval.unwrap_or(Duration::from_secs(60)),
            enable_rdma: options.enable_rdma.unwrap_or(false),
            rdma_port: options.rdma_port,
        };

        values.validate()?;
        Ok(values)
    }
}
