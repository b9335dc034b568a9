use crate::packet::{Packet, RequestId, ResultCode};
use crate::transport::{Connector, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExtentRequestError {
    #[error("transport failure")]
    Transport(#[from] TransportError),
    #[error("replica replied {0:?}")]
    Rejected(ResultCode),
    #[error("reply does not answer request {0}")]
    Mismatched(RequestId),
    #[error("read reply carries {actual} bytes, expected {expected}")]
    WrongLength { expected: u64, actual: usize },
    #[error("no reply")]
    NoReply,
}

/// Sends `packet` on a dedicated connection to `addr` and waits for its reply. Used for
/// recovery resends and extent creation, outside of any session queue.
pub(crate) async fn do_extent_request(
    connector: &dyn Connector,
    addr: &str,
    packet: &mut Packet,
) -> Result<(), ExtentRequestError> {
    packet.clear_reply();
    let transport = connector.connect(addr).await?;
    let result = exchange(transport.as_ref(), packet).await;
    transport.close().await;
    result?;

    check_reply(packet)
}

/// Tries the replicas in `order` until one answers successfully, and returns its index.
/// Each attempt counts as one retry of the packet.
pub(crate) async fn do_extent_request_retry(
    logger: &slog::Logger,
    connector: &dyn Connector,
    members: &[String],
    order: &[usize],
    packet: &mut Packet,
) -> Result<usize, ExtentRequestError> {
    let mut last_error = ExtentRequestError::NoReply;
    for &host_idx in order {
        packet.retry_count += 1;
        match do_extent_request(connector, &members[host_idx], packet).await {
            Ok(()) => return Ok(host_idx),
            Err(e) => {
                slog::warn!(logger, "Replica {} failed request: {:?}", members[host_idx], e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

async fn exchange(transport: &dyn Transport, packet: &mut Packet) -> Result<(), TransportError> {
    transport.send(packet).await?;
    transport.recv(packet).await
}

fn check_reply(packet: &Packet) -> Result<(), ExtentRequestError> {
    let reply = packet.reply().ok_or(ExtentRequestError::NoReply)?;
    if reply.header.request_id != packet.request_id() {
        return Err(ExtentRequestError::Mismatched(packet.request_id()));
    }
    if !reply.header.result_code.is_ok() {
        return Err(ExtentRequestError::Rejected(reply.header.result_code));
    }
    if let Some(actual) = packet.read_reply_mismatch() {
        return Err(ExtentRequestError::WrongLength {
            expected: packet.len(),
            actual,
        });
    }

    Ok(())
}
