use crate::meta::MasterError;
use serde::{Deserialize, Serialize};

pub const PARTITION_READ_ONLY: i8 = 1;
pub const PARTITION_READ_WRITE: i8 = 2;

/// A data partition as the master service describes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPartitionView {
    #[serde(rename = "PartitionID")]
    pub partition_id: u64,
    #[serde(rename = "Status")]
    pub status: i8,
    #[serde(rename = "ReplicaNum", default)]
    pub replica_num: u8,
    #[serde(rename = "Hosts")]
    pub hosts: Vec<String>,
    #[serde(rename = "LeaderAddr", default)]
    pub leader_addr: String,
    #[serde(rename = "Epoch", default)]
    pub epoch: u64,
}

#[derive(Deserialize)]
struct MasterReply<T> {
    code: u32,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct DataPartitionsData {
    #[serde(rename = "DataPartitions", default)]
    data_partitions: Vec<DataPartitionView>,
}

/// Parses the body of the master's `/client/partitions` reply.
pub fn parse_data_partitions_reply(body: &[u8]) -> Result<Vec<DataPartitionView>, MasterError> {
    let reply: MasterReply<DataPartitionsData> = serde_json::from_slice(body)?;
    if reply.code != 0 {
        return Err(MasterError::BadReply {
            code: reply.code,
            msg: reply.msg,
        });
    }

    Ok(reply.data.map(|data| data.data_partitions).unwrap_or_default())
}
