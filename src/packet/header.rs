use crate::packet::codec::CodecError;
use crate::packet::{ExtentId, PartitionId, RequestId};
use bytes::{Buf, BufMut, BytesMut};

pub const PACKET_MAGIC: u8 = 0xFF;
pub const NORMAL_EXTENT_TYPE: u8 = 1;
pub const HEADER_SIZE: usize = 57;

// Byte offsets of the variable-length section sizes, used to size a frame before decoding it.
pub(super) const SIZE_OFFSET: usize = 9;
pub(super) const ARG_LEN_OFFSET: usize = 13;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    CreateExtent,
    Write,
    StreamRead,
}

impl Opcode {
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::CreateExtent => 0x01,
            Opcode::Write => 0x03,
            Opcode::StreamRead => 0x05,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Opcode::CreateExtent),
            0x03 => Some(Opcode::Write),
            0x05 => Some(Opcode::StreamRead),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultCode {
    /// Set on every outgoing request; data nodes overwrite it in the reply.
    Init,
    Ok,
    IntraGroupNetErr,
    ArgMismatch,
    NotExist,
    DiskNoSpace,
    DiskErr,
    Err,
    Again,
    TryOtherAddr,
    NotPerm,
    Other(u8),
}

impl ResultCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ResultCode::Init => 0x00,
            ResultCode::Ok => 0xF0,
            ResultCode::IntraGroupNetErr => 0xF3,
            ResultCode::ArgMismatch => 0xF4,
            ResultCode::NotExist => 0xF5,
            ResultCode::DiskNoSpace => 0xF6,
            ResultCode::DiskErr => 0xF7,
            ResultCode::Err => 0xF8,
            ResultCode::Again => 0xF9,
            ResultCode::TryOtherAddr => 0xFC,
            ResultCode::NotPerm => 0xFD,
            ResultCode::Other(code) => code,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => ResultCode::Init,
            0xF0 => ResultCode::Ok,
            0xF3 => ResultCode::IntraGroupNetErr,
            0xF4 => ResultCode::ArgMismatch,
            0xF5 => ResultCode::NotExist,
            0xF6 => ResultCode::DiskNoSpace,
            0xF7 => ResultCode::DiskErr,
            0xF8 => ResultCode::Err,
            0xF9 => ResultCode::Again,
            0xFC => ResultCode::TryOtherAddr,
            0xFD => ResultCode::NotPerm,
            other => ResultCode::Other(other),
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

/// Fixed 57 byte big-endian header that prefixes every request and reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u8,
    pub extent_type: u8,
    pub opcode: Opcode,
    pub result_code: ResultCode,
    pub remaining_followers: u8,
    pub crc: u32,
    pub size: u32,
    pub arg_len: u32,
    pub partition_id: PartitionId,
    pub extent_id: ExtentId,
    pub extent_offset: u64,
    pub request_id: RequestId,
    pub kernel_offset: u64,
}

impl PacketHeader {
    pub fn new(opcode: Opcode, request_id: RequestId) -> Self {
        PacketHeader {
            magic: PACKET_MAGIC,
            extent_type: NORMAL_EXTENT_TYPE,
            opcode,
            result_code: ResultCode::Init,
            remaining_followers: 0,
            crc: 0,
            size: 0,
            arg_len: 0,
            partition_id: PartitionId::default(),
            extent_id: ExtentId::default(),
            extent_offset: 0,
            request_id,
            kernel_offset: 0,
        }
    }

    /// Number of data bytes that follow the arg section on the wire. Read requests carry the
    /// requested length in `size` but no data.
    pub fn payload_len(&self) -> usize {
        if self.opcode == Opcode::StreamRead && self.result_code == ResultCode::Init {
            0
        } else {
            self.size as usize
        }
    }

    pub(super) fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.magic);
        dst.put_u8(self.extent_type);
        dst.put_u8(self.opcode.as_u8());
        dst.put_u8(self.result_code.as_u8());
        dst.put_u8(self.remaining_followers);
        dst.put_u32(self.crc);
        dst.put_u32(self.size);
        dst.put_u32(self.arg_len);
        dst.put_u64(self.partition_id.as_u64());
        dst.put_u64(self.extent_id.as_u64());
        dst.put_u64(self.extent_offset);
        dst.put_u64(self.request_id.as_u64());
        dst.put_u64(self.kernel_offset);
    }

    /// Consumes exactly `HEADER_SIZE` bytes. Caller guarantees they are buffered.
    pub(super) fn decode(src: &mut BytesMut) -> Result<Self, CodecError> {
        let magic = src.get_u8();
        if magic != PACKET_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let extent_type = src.get_u8();
        let raw_opcode = src.get_u8();
        let opcode = Opcode::from_u8(raw_opcode).ok_or(CodecError::UnknownOpcode(raw_opcode))?;

        Ok(PacketHeader {
            magic,
            extent_type,
            opcode,
            result_code: ResultCode::from_u8(src.get_u8()),
            remaining_followers: src.get_u8(),
            crc: src.get_u32(),
            size: src.get_u32(),
            arg_len: src.get_u32(),
            partition_id: PartitionId::new(src.get_u64()),
            extent_id: ExtentId::new(src.get_u64()),
            extent_offset: src.get_u64(),
            request_id: RequestId::new(src.get_u64()),
            kernel_offset: src.get_u64(),
        })
    }
}
