use crate::meta::{MasterClient, MasterError};
use crate::partition::{PartitionTable, TableUpdate};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Duration;

/// Keeps the refresh task alive. Dropping it stops the task.
pub(crate) struct PartitionRefreshHandle {
    _shutdown: oneshot::Sender<()>,
}

struct PartitionRefreshTask {
    logger: slog::Logger,
    master: Arc<dyn MasterClient>,
    table: Weak<PartitionTable>,
    interval: Duration,
}

pub(crate) fn spawn_partition_refresh(
    logger: slog::Logger,
    master: Arc<dyn MasterClient>,
    table: &Arc<PartitionTable>,
    interval: Duration,
) -> PartitionRefreshHandle {
    let (handle, signal) = oneshot::channel();
    let task = PartitionRefreshTask {
        logger,
        master,
        table: Arc::downgrade(table),
        interval,
    };
    tokio::spawn(task.run(signal));

    PartitionRefreshHandle { _shutdown: handle }
}

impl PartitionRefreshTask {
    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                // Sent or dropped both mean stop.
                _ = &mut shutdown => {
                    slog::debug!(self.logger, "Partition refresh task stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let table = match self.table.upgrade() {
                Some(table) => table,
                None => return,
            };
            // Failures are logged inside; the previous table stays in use.
            let _ = refresh_partitions(&self.logger, self.master.as_ref(), &table).await;
        }
    }
}

pub(crate) async fn refresh_partitions(
    logger: &slog::Logger,
    master: &dyn MasterClient,
    table: &PartitionTable,
) -> Result<TableUpdate, MasterError> {
    let views = match master.get_data_partitions().await {
        Ok(views) => views,
        Err(e) => {
            slog::warn!(logger, "Failed to fetch data partitions: {:?}", e);
            return Err(e);
        }
    };

    let update = table.update(&views);
    slog::info!(logger, "Refreshed data partitions ({} total): {:?}", table.len(), update);

    Ok(update)
}
