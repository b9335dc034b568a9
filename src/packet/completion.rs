use crate::packet::{PacketError, PacketOwner, RequestId};
use bytes::Bytes;
use tokio::sync::oneshot;

/// What the submitter of a packet learns once the packet leaves its pipeline.
#[derive(Debug)]
pub(crate) struct PacketOutcome {
    pub request_id: RequestId,
    pub kernel_offset: u64,
    pub retry_count: u32,
    /// Reply data on success. Write acknowledgements carry no data.
    pub result: Result<Bytes, PacketError>,
    pub(crate) owner: Option<PacketOwner>,
}

impl PacketOutcome {
    fn cancelled(request_id: RequestId, kernel_offset: u64) -> Self {
        PacketOutcome {
            request_id,
            kernel_offset,
            retry_count: 0,
            result: Err(PacketError::Cancelled),
            owner: None,
        }
    }
}

/// Sending half of a packet's completion. Delivers exactly once: either through `deliver`, or a
/// `Cancelled` outcome when dropped undelivered.
#[derive(Debug)]
pub(crate) struct Completion {
    sender: Option<oneshot::Sender<PacketOutcome>>,
    request_id: RequestId,
    kernel_offset: u64,
}

impl Completion {
    pub(crate) fn new(request_id: RequestId, kernel_offset: u64) -> (Self, PacketReceipt) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            sender: Some(tx),
            request_id,
            kernel_offset,
        };
        let receipt = PacketReceipt {
            request_id,
            kernel_offset,
            receiver: rx,
        };

        (completion, receipt)
    }

    pub(crate) fn deliver(mut self, outcome: PacketOutcome) {
        if let Some(sender) = self.sender.take() {
            // Submitter may have stopped waiting.
            let _ = sender.send(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PacketOutcome::cancelled(self.request_id, self.kernel_offset));
        }
    }
}

/// Receiving half of a packet's completion.
#[derive(Debug)]
pub(crate) struct PacketReceipt {
    request_id: RequestId,
    kernel_offset: u64,
    receiver: oneshot::Receiver<PacketOutcome>,
}

impl PacketReceipt {
    pub async fn wait(self) -> PacketOutcome {
        let request_id = self.request_id;
        let kernel_offset = self.kernel_offset;
        self.receiver
            .await
            .unwrap_or_else(|_| PacketOutcome::cancelled(request_id, kernel_offset))
    }
}
