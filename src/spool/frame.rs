//! Binary envelope for one transmission: length-prefixed fields followed by
//! a CRC32C trailer over everything that precedes it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;

const FRAME_VERSION: u8 = 1;
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

/// One deliverable payload plus everything needed to deliver it.
///
/// Frozen at construction; the spool persists it verbatim and the
/// transmitter replays it until delivery, permanent rejection, or the
/// retry deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    endpoint_url: Url,
    payload: Bytes,
    content_type: String,
    content_encoding: String,
    created_at_utc: DateTime<Utc>,
}

impl Transmission {
    pub fn new(
        endpoint_url: Url,
        payload: Bytes,
        content_type: impl Into<String>,
        content_encoding: impl Into<String>,
        created_at_utc: DateTime<Utc>,
    ) -> Self {
        Self {
            endpoint_url,
            payload,
            content_type: content_type.into(),
            content_encoding: content_encoding.into(),
            created_at_utc,
        }
    }

    pub fn endpoint_url(&self) -> &Url {
        &self.endpoint_url
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Transfer encoding of the payload; empty means none.
    pub fn content_encoding(&self) -> &str {
        &self.content_encoding
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        self.created_at_utc
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("corrupt frame: {reason}")]
    Corrupt { reason: String },
}

impl FrameError {
    fn corrupt(reason: impl Into<String>) -> Self {
        FrameError::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Encodes one transmission. Infallible: the frame is built in memory.
pub fn encode(transmission: &Transmission) -> Vec<u8> {
    let url = transmission.endpoint_url.as_str().as_bytes();
    let content_type = transmission.content_type.as_bytes();
    let content_encoding = transmission.content_encoding.as_bytes();
    let payload = &transmission.payload;

    let mut buf = Vec::with_capacity(1 + 3 * 4 + 8 + 4 + 4 + url.len() + payload.len() + 64);
    buf.push(FRAME_VERSION);
    put_field(&mut buf, url);
    put_field(&mut buf, content_type);
    put_field(&mut buf, content_encoding);
    buf.extend_from_slice(&(transmission.created_at_utc.timestamp_millis() as u64).to_be_bytes());
    put_field(&mut buf, payload);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf
}

/// Encodes one transmission into `writer`.
pub fn write_to(
    transmission: &Transmission,
    writer: &mut impl std::io::Write,
) -> Result<(), FrameError> {
    writer.write_all(&encode(transmission))?;
    Ok(())
}

/// Decodes a frame produced by [`encode`]. Anything else comes back as
/// [`FrameError::Corrupt`]; the input is never trusted.
pub fn decode(buf: &[u8]) -> Result<Transmission, FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::corrupt("truncated frame"));
    }
    let (body, trailer) = buf.split_at(buf.len() - 4);
    let stored_crc = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32c::crc32c(body) != stored_crc {
        return Err(FrameError::corrupt("crc mismatch"));
    }

    let mut reader = Reader { buf: body, pos: 0 };
    let version = reader.u8()?;
    if version != FRAME_VERSION {
        return Err(FrameError::corrupt(format!(
            "unsupported frame version {version}"
        )));
    }
    let url = reader.string("endpoint url")?;
    let endpoint_url = Url::parse(&url)
        .map_err(|e| FrameError::corrupt(format!("invalid endpoint url: {e}")))?;
    let content_type = reader.string("content type")?;
    let content_encoding = reader.string("content encoding")?;
    let created_ms = reader.u64()?;
    let created_at_utc = DateTime::<Utc>::from_timestamp_millis(created_ms as i64)
        .ok_or_else(|| FrameError::corrupt("timestamp out of range"))?;
    let payload = reader.field()?.to_vec();
    if reader.pos != body.len() {
        return Err(FrameError::corrupt("trailing bytes after payload"));
    }

    Ok(Transmission {
        endpoint_url,
        payload: Bytes::from(payload),
        content_type,
        content_encoding,
        created_at_utc,
    })
}

fn put_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
    buf.extend_from_slice(field);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.buf.len() - self.pos < n {
            return Err(FrameError::corrupt("truncated frame"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn field(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.u32()?;
        if len > MAX_FIELD_LEN {
            return Err(FrameError::corrupt("field length exceeds 64 MiB limit"));
        }
        self.take(len as usize)
    }

    fn string(&mut self, what: &str) -> Result<String, FrameError> {
        let bytes = self.field()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| FrameError::corrupt(format!("invalid utf-8 in {what}")))
    }
}
