// Copyright 2020 Joyent, Inc.

//! Wire-level pieces of the Hadoop IPC protocol: the connection header,
//! reserved call ids, protobuf varint and delimited-block codec, and the
//! length-prefixed frame that carries every unit after the connection
//! header.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::proto::rpc_request_header_proto::OperationProto;
use crate::proto::{RpcKindProto, RpcRequestHeaderProto};

pub const RPC_MAGIC: [u8; 4] = *b"hrpc";
pub const RPC_VERSION: u8 = 9;
pub const RPC_SERVICE_CLASS: u8 = 0;

/// magic + version + service class + auth protocol
pub const CONNECTION_HEADER_LEN: usize = 7;

const FRAME_LENGTH_SZ: usize = 4;

/// Hadoop's `ipc.maximum.response.length` default.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 128 * 1024 * 1024;

pub const CLIENT_ID_LEN: usize = 16;

/// Client id carried by SASL frames in both directions.
pub const DUMMY_CLIENT_ID: &[u8] = &[];

pub const INVALID_RETRY_COUNT: i32 = -1;

/// Call ids reserved for control traffic. Ordinary calls draw their ids from
/// the non-negative range, so they can never collide with these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum ReservedCallId {
    /// Servers reject connection setup (auth, version) under this id.
    AuthorizationFailed = -1,
    ConnectionContext = -3,
    Ping = -4,
    Sasl = -33,
}

impl ReservedCallId {
    pub fn id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<ReservedCallId> {
        FromPrimitive::from_i32(id)
    }
}

/// Authentication protocol announced in the last byte of the connection
/// header. The SASL code is the SASL call id, as Hadoop defines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum AuthProtocol {
    None = 0,
    Sasl = -33,
}

impl AuthProtocol {
    pub fn to_wire(self) -> u8 {
        // Both codes fit in an i8; the byte is the two's complement form.
        ToPrimitive::to_i8(&self).map_or(0, |code| code as u8)
    }

    pub fn from_wire(byte: u8) -> Option<AuthProtocol> {
        FromPrimitive::from_i8(byte as i8)
    }
}

/// The fixed 7-byte preamble written once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub version: u8,
    pub service_class: u8,
    pub auth_protocol: AuthProtocol,
}

impl ConnectionHeader {
    pub fn new(auth_protocol: AuthProtocol) -> ConnectionHeader {
        ConnectionHeader {
            version: RPC_VERSION,
            service_class: RPC_SERVICE_CLASS,
            auth_protocol,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(CONNECTION_HEADER_LEN);
        buf.put_slice(&RPC_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.service_class);
        buf.put_u8(self.auth_protocol.to_wire());
    }

    pub fn parse(buf: &[u8]) -> Result<ConnectionHeader, Error> {
        if buf.len() < CONNECTION_HEADER_LEN {
            return Err(Error::framing(format!(
                "connection header needs {} bytes, got {}",
                CONNECTION_HEADER_LEN,
                buf.len()
            )));
        }
        if buf[0..4] != RPC_MAGIC {
            return Err(Error::framing("bad connection header magic"));
        }
        if buf[4] != RPC_VERSION {
            return Err(Error::framing(format!(
                "unsupported IPC version {}",
                buf[4]
            )));
        }
        let auth_protocol = AuthProtocol::from_wire(buf[6]).ok_or_else(|| {
            Error::framing(format!("unknown auth protocol {:#x}", buf[6]))
        })?;

        Ok(ConnectionHeader {
            version: buf[4],
            service_class: buf[5],
            auth_protocol,
        })
    }
}

pub fn encode_varint(value: u64, buf: &mut BytesMut) {
    prost::encoding::encode_varint(value, buf);
}

pub fn varint_len(value: u64) -> usize {
    prost::encoding::encoded_len_varint(value)
}

/// Decode a varint from the front of `buf`, returning the value and the
/// number of bytes it occupied.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), Error> {
    let mut cursor = buf;
    let value = prost::encoding::decode_varint(&mut cursor)
        .map_err(|e| Error::framing(format!("malformed varint: {}", e)))?;
    Ok((value, buf.len() - cursor.len()))
}

/// Append `varint(len(payload)) ++ payload`.
pub fn write_delimited(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(varint_len(payload.len() as u64) + payload.len());
    encode_varint(payload.len() as u64, buf);
    buf.put_slice(payload);
}

/// Split one length-delimited block off the front of `buf`, returning the
/// block and the total bytes consumed including its prefix.
pub fn read_delimited(buf: &[u8]) -> Result<(&[u8], usize), Error> {
    let (len, prefix) = decode_varint(buf)?;
    let available = buf.len() - prefix;
    if len > available as u64 {
        return Err(Error::framing(format!(
            "delimited block declares {} bytes, only {} remain",
            len, available
        )));
    }
    let end = prefix + len as usize;
    Ok((&buf[prefix..end], end))
}

/// Validate the 4-byte total length that prefixes every frame.
pub fn parse_frame_length(
    prefix: &[u8],
    max_length: usize,
) -> Result<usize, Error> {
    let length = BigEndian::read_i32(&prefix[0..FRAME_LENGTH_SZ]);
    if length <= 0 {
        return Err(Error::framing(format!(
            "invalid frame length {}",
            length
        )));
    }
    if length as usize > max_length {
        return Err(Error::framing(format!(
            "frame length {} exceeds maximum {}",
            length, max_length
        )));
    }
    Ok(length as usize)
}

/// Header shared by every request frame: protobuf engine, final packet.
pub fn request_header(
    call_id: i32,
    client_id: &[u8],
    retry_count: i32,
) -> RpcRequestHeaderProto {
    RpcRequestHeaderProto {
        rpc_kind: Some(RpcKindProto::RpcProtocolBuffer as i32),
        rpc_op: Some(OperationProto::RpcFinalPacket as i32),
        call_id,
        client_id: client_id.to_vec(),
        retry_count: Some(retry_count),
    }
}

/// An outbound frame: a 4-byte big-endian total length followed by each
/// part as a varint-delimited block.
#[derive(Debug, Default, Clone)]
pub struct RpcFrame {
    parts: Vec<Vec<u8>>,
}

impl RpcFrame {
    pub fn new() -> RpcFrame {
        RpcFrame { parts: Vec::new() }
    }

    pub fn message<M: Message>(mut self, msg: &M) -> RpcFrame {
        self.parts.push(msg.encode_to_vec());
        self
    }

    pub fn bytes(mut self, part: Vec<u8>) -> RpcFrame {
        self.parts.push(part);
        self
    }

    /// Value of the length prefix: every part plus its varint size.
    pub fn total_length(&self) -> usize {
        self.parts
            .iter()
            .map(|p| varint_len(p.len() as u64) + p.len())
            .sum()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let total_length = self.total_length();
        if total_length > i32::MAX as usize {
            return Err(Error::framing(format!(
                "frame of {} bytes does not fit the length prefix",
                total_length
            )));
        }
        buf.reserve(FRAME_LENGTH_SZ + total_length);
        buf.put_i32(total_length as i32);
        for part in &self.parts {
            write_delimited(part, buf);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<BytesMut, Error> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// An inbound frame body (length prefix already stripped), consumed one
/// delimited block at a time.
#[derive(Debug, Clone)]
pub struct FrameReader {
    body: Bytes,
}

impl FrameReader {
    pub fn new(body: Bytes) -> FrameReader {
        FrameReader { body }
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn next_block(&mut self) -> Result<Bytes, Error> {
        if self.body.is_empty() {
            return Err(Error::framing("frame has no further blocks"));
        }
        let (block_len, consumed) = {
            let (block, consumed) = read_delimited(&self.body)?;
            (block.len(), consumed)
        };
        let prefix = consumed - block_len;
        self.body.advance(prefix);
        Ok(self.body.split_to(block_len))
    }

    pub fn next_message<M: Message + Default>(&mut self) -> Result<M, Error> {
        let block = self.next_block()?;
        Ok(M::decode(block)?)
    }
}

/// Frame codec for async peers. Frames are length-prefixed and never empty.
pub struct IpcRpc {
    max_frame_length: usize,
}

impl IpcRpc {
    pub fn new(max_frame_length: usize) -> IpcRpc {
        IpcRpc { max_frame_length }
    }
}

impl Default for IpcRpc {
    fn default() -> IpcRpc {
        IpcRpc::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for IpcRpc {
    type Item = FrameReader;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Error> {
        if buf.len() < FRAME_LENGTH_SZ {
            return Ok(None);
        }
        let length = parse_frame_length(&buf[..], self.max_frame_length)?;
        if buf.len() < FRAME_LENGTH_SZ + length {
            buf.reserve(FRAME_LENGTH_SZ + length - buf.len());
            return Ok(None);
        }
        buf.advance(FRAME_LENGTH_SZ);
        Ok(Some(FrameReader::new(buf.split_to(length).freeze())))
    }
}

impl Encoder<RpcFrame> for IpcRpc {
    type Error = Error;

    fn encode(&mut self, item: RpcFrame, buf: &mut BytesMut) -> Result<(), Error> {
        item.encode(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, TestResult};

    use crate::proto::{IpcConnectionContextProto, UserInformationProto};

    #[test]
    fn connection_header_bytes() {
        let mut buf = BytesMut::new();
        ConnectionHeader::new(AuthProtocol::None).encode(&mut buf);
        assert_eq!(&buf[..], b"hrpc\x09\x00\x00");

        buf.clear();
        ConnectionHeader::new(AuthProtocol::Sasl).encode(&mut buf);
        assert_eq!(&buf[..], b"hrpc\x09\x00\xdf");

        let parsed = ConnectionHeader::parse(&buf).unwrap();
        assert_eq!(parsed.auth_protocol, AuthProtocol::Sasl);
    }

    #[test]
    fn connection_header_rejects_bad_magic() {
        assert!(ConnectionHeader::parse(b"hrpx\x09\x00\x00").is_err());
        assert!(ConnectionHeader::parse(b"hrpc\x09\x00\x07").is_err());
        assert!(ConnectionHeader::parse(b"hrpc").is_err());
    }

    #[test]
    fn reserved_call_ids() {
        assert_eq!(ReservedCallId::Sasl.id(), -33);
        assert_eq!(ReservedCallId::ConnectionContext.id(), -3);
        assert_eq!(ReservedCallId::from_id(-4), Some(ReservedCallId::Ping));
        assert_eq!(
            ReservedCallId::from_id(-1),
            Some(ReservedCallId::AuthorizationFailed)
        );
        assert_eq!(ReservedCallId::from_id(0), None);
    }

    #[test]
    fn varint_size_class_boundaries() {
        for &(n, len) in &[
            (0u64, 1usize),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (u32::MAX as u64, 5),
        ] {
            let mut buf = BytesMut::new();
            encode_varint(n, &mut buf);
            assert_eq!(buf.len(), len, "encoding of {}", n);
            assert_eq!(varint_len(n), len);
            assert_eq!(decode_varint(&buf).unwrap(), (n, len));
        }
    }

    #[test]
    fn unterminated_varint_is_framing_error() {
        match decode_varint(&[0x80, 0x80, 0x80]) {
            Err(Error::Framing(_)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(decode_varint(&[]).is_err());
    }

    #[test]
    fn truncated_delimited_block() {
        let mut buf = BytesMut::new();
        write_delimited(b"hello", &mut buf);
        let (block, consumed) = read_delimited(&buf).unwrap();
        assert_eq!(block, b"hello");
        assert_eq!(consumed, 6);
        assert!(read_delimited(&buf[..4]).is_err());
    }

    #[test]
    fn frame_length_bounds() {
        assert!(parse_frame_length(&[0, 0, 0, 0], 1024).is_err());
        assert!(parse_frame_length(&[0xff, 0xff, 0xff, 0xff], 1024).is_err());
        assert!(parse_frame_length(&[0, 0, 4, 1], 1024).is_err());
        assert_eq!(parse_frame_length(&[0, 0, 4, 0], 1024).unwrap(), 1024);
    }

    #[test]
    fn frame_round_trip() {
        let header = request_header(7, &[9u8; CLIENT_ID_LEN], 0);
        let context = IpcConnectionContextProto {
            user_info: Some(UserInformationProto {
                effective_user: Some("yarn".into()),
                real_user: None,
            }),
            protocol: Some("org.apache.hadoop.yarn.api.ContainerManagementProtocolPB".into()),
        };
        let frame = RpcFrame::new().message(&header).message(&context);
        let mut buf = frame.to_bytes().unwrap();

        let mut codec = IpcRpc::default();
        let mut reader = codec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());

        let decoded_header: RpcRequestHeaderProto =
            reader.next_message().unwrap();
        let decoded_context: IpcConnectionContextProto =
            reader.next_message().unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_context, context);
        assert!(reader.is_empty());
        assert!(reader.next_block().is_err());
    }

    #[test]
    fn decoder_waits_for_whole_frame() {
        let frame = RpcFrame::new().bytes(vec![1u8; 300]);
        let full = frame.to_bytes().unwrap();

        let mut codec = IpcRpc::default();
        let mut partial = BytesMut::from(&full[..100]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[100..]);
        let mut reader = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(reader.next_block().unwrap().len(), 300);
    }

    #[test]
    fn decoder_rejects_empty_frame() {
        let mut codec = IpcRpc::default();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        match codec.decode(&mut buf) {
            Err(Error::Framing(_)) => (),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    quickcheck! {
        fn prop_varint_round_trip(n: u32) -> bool {
            let mut buf = BytesMut::new();
            encode_varint(n as u64, &mut buf);
            decode_varint(&buf).unwrap() == (n as u64, buf.len())
        }

        fn prop_total_length_matches_body(sizes: Vec<u16>) -> TestResult {
            if sizes.is_empty() || sizes.len() > 8 {
                return TestResult::discard();
            }
            let frame = sizes.iter().fold(RpcFrame::new(), |frame, &size| {
                frame.bytes(vec![0xa5; size as usize])
            });
            let buf = frame.to_bytes().unwrap();
            let declared = BigEndian::read_i32(&buf[..4]) as usize;
            TestResult::from_bool(
                declared == buf.len() - 4 && declared == frame.total_length(),
            )
        }
    }
}
