use crate::packet::header::{ARG_LEN_OFFSET, SIZE_OFFSET};
use crate::packet::{PacketHeader, HEADER_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::convert::TryFrom;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One framed message: header, follower-address argument, and data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub header: PacketHeader,
    pub arg: Bytes,
    pub data: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bad magic byte {0:#x}")]
    BadMagic(u8),
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("crc mismatch: header says {expected:#x}, payload hashes to {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("frame of {0} bytes exceeds the codec limit")]
    FrameTooLarge(usize),
    #[error("header size {header_size} disagrees with {data_len} data bytes")]
    InconsistentSize { header_size: usize, data_len: usize },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Frames `WireMessage`s on a byte stream. Usable by any stream-oriented `Transport`.
#[derive(Clone, Debug)]
pub struct PacketCodec {
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new() -> Self {
        PacketCodec {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        PacketCodec { max_frame_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        PacketCodec::new()
    }
}

impl<'a> Encoder<&'a WireMessage> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, message: &'a WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header_size = message.header.payload_len();
        if header_size != message.data.len() {
            return Err(CodecError::InconsistentSize {
                header_size,
                data_len: message.data.len(),
            });
        }

        let mut header = message.header.clone();
        header.arg_len = u32::try_from(message.arg.len()).map_err(|_| CodecError::FrameTooLarge(message.arg.len()))?;

        dst.reserve(HEADER_SIZE + message.arg.len() + message.data.len());
        header.encode(dst);
        dst.put_slice(&message.arg);
        dst.put_slice(&message.data);

        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = WireMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let frame_len = HEADER_SIZE + peek_arg_len(src) + peek_payload_len(src);
        if frame_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(frame_len));
        }
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_len);
        let header = PacketHeader::decode(&mut frame)?;
        let arg = frame.split_to(header.arg_len as usize).freeze();
        let data = frame.freeze();

        if !data.is_empty() {
            let actual = crc32fast::hash(&data);
            if actual != header.crc {
                return Err(CodecError::CrcMismatch {
                    expected: header.crc,
                    actual,
                });
            }
        }

        Ok(Some(WireMessage { header, arg, data }))
    }
}

fn peek_u32(src: &BytesMut, offset: usize) -> usize {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[offset..offset + 4]);
    u32::from_be_bytes(raw) as usize
}

fn peek_arg_len(src: &BytesMut) -> usize {
    peek_u32(src, ARG_LEN_OFFSET)
}

fn peek_payload_len(src: &BytesMut) -> usize {
    // Read requests describe a length but carry no data.
    let opcode = src[2];
    let result_code = src[3];
    if opcode == crate::packet::Opcode::StreamRead.as_u8() && result_code == 0 {
        0
    } else {
        peek_u32(src, SIZE_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{ExtentId, Opcode, PartitionId, RequestId, ResultCode};

    fn write_message(data: &'static [u8]) -> WireMessage {
        let mut header = PacketHeader::new(Opcode::Write, RequestId::new(7));
        header.partition_id = PartitionId::new(11);
        header.extent_id = ExtentId::new(1024);
        header.extent_offset = 4096;
        header.kernel_offset = 65536;
        header.remaining_followers = 2;
        header.size = data.len() as u32;
        header.crc = crc32fast::hash(data);
        let arg = Bytes::from_static(b"10.0.0.2:17310/10.0.0.3:17310/");
        header.arg_len = arg.len() as u32;

        WireMessage {
            header,
            arg,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn header_layout_is_big_endian_and_57_bytes() {
        let message = write_message(b"abc");
        let mut buf = BytesMut::new();
        PacketCodec::new().encode(&message, &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + message.arg.len() + 3);
        assert_eq!(buf[0], 0xFF);
        assert_eq!(buf[2], 0x03);
        assert_eq!(buf[3], 0x00);
        assert_eq!(buf[4], 2);
        assert_eq!(&buf[9..13], &3u32.to_be_bytes());
        assert_eq!(&buf[13..17], &(message.arg.len() as u32).to_be_bytes());
        assert_eq!(&buf[17..25], &11u64.to_be_bytes());
        assert_eq!(&buf[41..49], &7u64.to_be_bytes());
        assert_eq!(&buf[49..57], &65536u64.to_be_bytes());
    }

    #[test]
    fn decode_waits_for_the_whole_frame() {
        let message = write_message(b"hello world");
        let mut encoded = BytesMut::new();
        PacketCodec::new().encode(&message, &mut encoded).unwrap();

        let mut codec = PacketCodec::new();
        let mut partial = BytesMut::from(&encoded[..HEADER_SIZE + 4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&encoded[HEADER_SIZE + 4..]);
        let decoded = codec.decode(&mut partial).unwrap().expect("full frame");
        assert_eq!(decoded, message);
        assert!(partial.is_empty());
    }

    #[test]
    fn decode_rejects_corrupted_payload() {
        let message = write_message(b"payload");
        let mut encoded = BytesMut::new();
        PacketCodec::new().encode(&message, &mut encoded).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;

        match PacketCodec::new().decode(&mut encoded) {
            Err(CodecError::CrcMismatch { .. }) => {}
            other => panic!("Expected crc mismatch, got {:?}", other),
        }
    }

    #[test]
    fn read_request_has_no_payload_on_the_wire() {
        let mut header = PacketHeader::new(Opcode::StreamRead, RequestId::new(3));
        header.size = 4096;
        let message = WireMessage {
            header,
            arg: Bytes::new(),
            data: Bytes::new(),
        };

        let mut encoded = BytesMut::new();
        let mut codec = PacketCodec::new();
        codec.encode(&message, &mut encoded).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = codec.decode(&mut encoded).unwrap().expect("full frame");
        assert_eq!(decoded.header.size, 4096);
        assert_eq!(decoded.header.result_code, ResultCode::Init);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn encode_rejects_size_mismatch() {
        let mut message = write_message(b"abc");
        message.header.size = 10;

        let result = PacketCodec::new().encode(&message, &mut BytesMut::new());
        assert!(matches!(result, Err(CodecError::InconsistentSize { .. })));
    }
}
