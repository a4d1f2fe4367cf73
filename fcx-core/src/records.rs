//! Typed record payloads layered over [`crate::record`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FcgiError, Result};
use crate::record::{
    encode_record, put_record, Record, RecordHeader, RecordType, MAX_CONTENT_LENGTH,
};

// BeginRequest flags.
pub const FCGI_KEEP_CONN: u8 = 1;

// Management variable names.
pub const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// Role requested by the gateway in BEGIN_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
    Unknown(u16),
}

impl Role {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::Responder,
            2 => Self::Authorizer,
            3 => Self::Filter,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
            Self::Unknown(other) => other,
        }
    }
}

/// Protocol-level completion status carried by END_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    RequestComplete,
    CantMpxConn,
    Overloaded,
    UnknownRole,
    Other(u8),
}

impl ProtocolStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::RequestComplete,
            1 => Self::CantMpxConn,
            2 => Self::Overloaded,
            3 => Self::UnknownRole,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMpxConn => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
            Self::Other(other) => other,
        }
    }
}

fn expect_type(record: &Record, expected: RecordType, name: &'static str) -> Result<()> {
    if record.kind() != Some(expected) {
        return Err(FcgiError::MalformedRecord {
            record: name,
            reason: "wrong record type",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub request_id: u16,
    pub role: Role,
    pub flags: u8,
}

impl BeginRequest {
    pub fn decode(record: &Record) -> Result<Self> {
        expect_type(record, RecordType::BeginRequest, "BEGIN_REQUEST")?;
        let body = &record.content;
        if body.len() < 3 {
            return Err(FcgiError::MalformedRecord {
                record: "BEGIN_REQUEST",
                reason: "body too short",
            });
        }
        Ok(Self {
            request_id: record.request_id(),
            role: Role::from_u16(u16::from_be_bytes([body[0], body[1]])),
            flags: body[2],
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut body = [0u8; 8];
        body[0..2].copy_from_slice(&self.role.as_u16().to_be_bytes());
        body[2] = self.flags;
        encode_fixed(RecordType::BeginRequest, self.request_id, &body)
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & FCGI_KEEP_CONN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRequest {
    pub request_id: u16,
    pub app_status: u32,
    pub protocol_status: ProtocolStatus,
}

impl EndRequest {
    pub fn encode(&self) -> Bytes {
        let mut body = [0u8; 8];
        body[0..4].copy_from_slice(&self.app_status.to_be_bytes());
        body[4] = self.protocol_status.as_u8();
        encode_fixed(RecordType::EndRequest, self.request_id, &body)
    }

    pub fn decode(record: &Record) -> Result<Self> {
        expect_type(record, RecordType::EndRequest, "END_REQUEST")?;
        let body = &record.content;
        if body.len() < 5 {
            return Err(FcgiError::MalformedRecord {
                record: "END_REQUEST",
                reason: "body too short",
            });
        }
        Ok(Self {
            request_id: record.request_id(),
            app_status: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
            protocol_status: ProtocolStatus::from_u8(body[4]),
        })
    }
}

/// Reply to a management record of a type we do not understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownType {
    pub record_type: u8,
}

impl UnknownType {
    pub fn encode(&self) -> Bytes {
        let mut body = [0u8; 8];
        body[0] = self.record_type;
        encode_fixed(RecordType::UnknownType, 0, &body)
    }
}

fn encode_fixed(record_type: RecordType, request_id: u16, body: &[u8; 8]) -> Bytes {
    // 8-byte bodies need no padding.
    let header = RecordHeader::new(record_type, request_id, body.len());
    let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + body.len());
    buf.put_slice(&header.encode());
    buf.put_slice(body);
    buf.freeze()
}

/// Encode a FastCGI name-value pair into the buffer.
pub fn encode_name_value(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    fn write_len(buf: &mut BytesMut, len: usize) {
        if len < 128 {
            buf.put_u8(len as u8);
        } else {
            buf.put_u32((len as u32) | 0x8000_0000);
        }
    }
    write_len(buf, name.len());
    write_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

/// Decode every complete name-value pair at the front of `data`.
///
/// Returns the pairs and the number of bytes they occupied; a trailing pair
/// that is cut short is left unconsumed so the caller can complete it with
/// the next record.
pub fn decode_name_values_partial(data: &[u8]) -> Result<(Vec<(String, String)>, usize)> {
    let mut pairs = Vec::new();
    let mut consumed = 0;
    let mut rest = data;
    loop {
        let mut cursor = rest;
        let Some(name_len) = read_nv_len(&mut cursor) else {
            break;
        };
        let Some(value_len) = read_nv_len(&mut cursor) else {
            break;
        };
        let Some(total) = name_len.checked_add(value_len) else {
            return Err(FcgiError::MalformedRecord {
                record: "PARAMS",
                reason: "name-value length overflow",
            });
        };
        if cursor.len() < total {
            break;
        }
        let name = text(&cursor[..name_len]);
        let value = text(&cursor[name_len..total]);
        pairs.push((name, value));
        cursor = &cursor[total..];
        consumed += rest.len() - cursor.len();
        rest = cursor;
    }
    Ok((pairs, consumed))
}

/// Decode all name-value pairs from a complete buffer.
pub fn decode_name_values(data: &[u8]) -> Result<Vec<(String, String)>> {
    let (pairs, consumed) = decode_name_values_partial(data)?;
    if consumed != data.len() {
        return Err(FcgiError::MalformedRecord {
            record: "PARAMS",
            reason: "truncated name-value pair",
        });
    }
    Ok(pairs)
}

// Gateways may pass raw path bytes; invalid sequences become U+FFFD.
fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn read_nv_len(data: &mut &[u8]) -> Option<usize> {
    let first = *data.first()?;
    if first < 128 {
        *data = &data[1..];
        Some(first as usize)
    } else {
        if data.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        Some(len as usize)
    }
}

/// PARAMS stream records.
pub struct Params;

impl Params {
    pub fn decode(record: &Record) -> Result<Vec<(String, String)>> {
        expect_type(record, RecordType::Params, "PARAMS")?;
        decode_name_values(&record.content)
    }

    /// Encode pairs into a single PARAMS record. An empty slice yields the stream terminator.
    pub fn encode<N, V>(request_id: u16, pairs: &[(N, V)]) -> Result<Bytes>
    where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut body = BytesMut::new();
        for (name, value) in pairs {
            encode_name_value(&mut body, name.as_ref(), value.as_ref());
        }
        encode_record(RecordType::Params, request_id, &body)
    }
}

/// STDIN stream records.
pub struct Stdin;

impl Stdin {
    pub fn encode(request_id: u16, data: &[u8]) -> Result<Bytes> {
        encode_record(RecordType::Stdin, request_id, data)
    }
}

/// STDOUT stream records.
pub struct Stdout;

impl Stdout {
    pub fn encode(request_id: u16, data: &[u8]) -> Result<Bytes> {
        encode_record(RecordType::Stdout, request_id, data)
    }
}

/// Write `data` as a stream of records of at most 65535 content bytes each,
/// followed by the empty record that terminates the stream.
pub fn encode_stream_into(
    buf: &mut BytesMut,
    record_type: RecordType,
    request_id: u16,
    data: &[u8],
) {
    for chunk in data.chunks(MAX_CONTENT_LENGTH) {
        put_record(buf, record_type, request_id, chunk);
    }
    put_record(buf, record_type, request_id, &[]);
}

pub fn encode_stream(record_type: RecordType, request_id: u16, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_stream_into(&mut buf, record_type, request_id, data);
    buf.freeze()
}

/// GET_VALUES management query: a list of variable names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetValues {
    pub names: Vec<String>,
}

impl GetValues {
    pub fn decode(record: &Record) -> Result<Self> {
        expect_type(record, RecordType::GetValues, "GET_VALUES")?;
        let names = decode_name_values(&record.content)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        Ok(Self { names })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        for name in &self.names {
            encode_name_value(&mut body, name.as_bytes(), b"");
        }
        encode_record(RecordType::GetValues, 0, &body)
    }

    /// Answer the query; names `lookup` does not know resolve to an empty value.
    pub fn resolve<F>(&self, lookup: F) -> GetValuesResult
    where
        F: Fn(&str) -> Option<String>,
    {
        let values = self
            .names
            .iter()
            .map(|name| (name.clone(), lookup(name).unwrap_or_default()))
            .collect();
        GetValuesResult { values }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetValuesResult {
    pub values: Vec<(String, String)>,
}

impl GetValuesResult {
    pub fn decode(record: &Record) -> Result<Self> {
        expect_type(record, RecordType::GetValuesResult, "GET_VALUES_RESULT")?;
        Ok(Self {
            values: decode_name_values(&record.content)?,
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        for (name, value) in &self.values {
            encode_name_value(&mut body, name.as_bytes(), value.as_bytes());
        }
        encode_record(RecordType::GetValuesResult, 0, &body)
    }
}
