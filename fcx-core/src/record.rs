use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FcgiError, Result};

// Protocol version.
pub const FCGI_VERSION_1: u8 = 1;

/// Largest content a single record can carry.
pub const MAX_CONTENT_LENGTH: usize = 65535;

/// Outbound records are padded so that content + padding is a multiple of this.
/// The protocol only recommends alignment; 8 matches common server implementations.
pub const RECORD_ALIGNMENT: usize = 8;

/// FastCGI record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Fixed 8-byte FastCGI record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn new(record_type: RecordType, request_id: u16, content_length: usize) -> Self {
        let padding = (RECORD_ALIGNMENT - (content_length % RECORD_ALIGNMENT)) % RECORD_ALIGNMENT;
        Self {
            version: FCGI_VERSION_1,
            record_type: record_type.as_u8(),
            request_id,
            content_length: content_length as u16,
            padding_length: padding as u8,
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.version;
        buf[1] = self.record_type;
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0; // reserved
        buf
    }

    /// Decode a header from the front of `buf`; `None` until 8 bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            version: buf[0],
            record_type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        })
    }

    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Header + content + padding.
    pub fn frame_len(&self) -> usize {
        Self::SIZE + self.content_length as usize + self.padding_length as usize
    }
}

/// A complete FastCGI record (header + content). Padding is dropped on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub header: RecordHeader,
    pub content: Bytes,
}

impl Record {
    pub fn kind(&self) -> Option<RecordType> {
        self.header.kind()
    }

    pub fn request_id(&self) -> u16 {
        self.header.request_id
    }

    pub fn is_management(&self) -> bool {
        self.header.request_id == 0
    }

    /// Stream terminators are identified by the header's content length alone.
    pub fn is_stream_end(&self) -> bool {
        self.header.content_length == 0
    }
}

/// Remove one complete record from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a whole frame; the
/// buffer is left untouched in that case.
pub fn try_extract_frame(buf: &mut BytesMut) -> Result<Option<Record>> {
    let Some(header) = RecordHeader::decode(buf) else {
        return Ok(None);
    };
    if header.version != FCGI_VERSION_1 {
        return Err(FcgiError::UnsupportedVersion(header.version));
    }
    if buf.len() < header.frame_len() {
        return Ok(None);
    }

    buf.advance(RecordHeader::SIZE);
    let content = buf.split_to(header.content_length as usize).freeze();
    buf.advance(header.padding_length as usize);
    Ok(Some(Record { header, content }))
}

/// Append one encoded record to `buf`.
pub fn encode_record_into(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) -> Result<()> {
    if content.len() > MAX_CONTENT_LENGTH {
        return Err(FcgiError::ContentTooLarge(content.len()));
    }
    put_record(buf, record_type, request_id, content);
    Ok(())
}

/// Append one record whose content the caller already bounded to
/// [`MAX_CONTENT_LENGTH`].
pub(crate) fn put_record(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    content: &[u8],
) {
    debug_assert!(content.len() <= MAX_CONTENT_LENGTH);
    let header = RecordHeader::new(record_type, request_id, content.len());
    buf.reserve(header.frame_len());
    buf.put_slice(&header.encode());
    buf.put_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
}

/// Encode a single record: header, content and zero padding.
pub fn encode_record(record_type: RecordType, request_id: u16, content: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_record_into(&mut buf, record_type, request_id, content)?;
    Ok(buf.freeze())
}
