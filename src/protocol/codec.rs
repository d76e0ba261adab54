//! Frame and payload codecs
//!
//! Socket framing is async; payload parsing happens over an in-memory
//! buffer because write-class payloads are appended to the WAL before the
//! handler consumes them.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{DbError, Result};

/// Hard cap on a single payload, to bound memory per connection
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024; // 64 MB

/// Read one command frame: `[type:u8][payload_len:u32][payload]`.
///
/// Returns `None` on a clean EOF before the type byte.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(u8, Vec<u8>)>> {
    let mut type_buf = [0u8; 1];
    match r.read_exact(&mut type_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)
        .await
        .map_err(|e| DbError::BadFrame(format!("payload length: {}", e)))?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_PAYLOAD_LEN {
        return Err(DbError::BadFrame(format!("payload too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(|e| DbError::BadFrame(format!("payload body: {}", e)))?;

    Ok(Some((type_buf[0], payload)))
}

/// Cursor over a command payload
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(DbError::BadFrame(format!(
                "payload truncated: need {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| DbError::BadFrame("invalid UTF-8 string".into()))
    }

    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        let count = self.read_u32()? as usize;
        if count > self.remaining() {
            // Each entry carries at least a length prefix; an impossible
            // count means a garbled frame, not a huge allocation.
            return Err(DbError::BadFrame(format!("string count {} exceeds payload", count)));
        }
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }
}

/// Builder for command payloads; the client-side dual of [`PayloadReader`]
#[derive(Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(mut self, v: u8) -> Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_i64(mut self, v: i64) -> Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn put_bytes(mut self, v: &[u8]) -> Self {
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    pub fn put_string(self, v: &str) -> Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_string_list(mut self, items: &[String]) -> Self {
        self.buf.put_u32_le(items.len() as u32);
        for item in items {
            self = self.put_string(item);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    /// Wrap the payload into a full command frame
    pub fn into_frame(self, kind: super::CommandKind) -> Vec<u8> {
        let mut frame = Vec::with_capacity(5 + self.buf.len());
        frame.put_u8(kind as u8);
        frame.put_u32_le(self.buf.len() as u32);
        frame.put_slice(&self.buf);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let payload = PayloadWriter::new()
            .put_string("users")
            .put_i64(-7)
            .put_bytes(b"\x00\x01\x02")
            .put_string_list(&["a".into(), "b".into()])
            .finish();

        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.read_string().unwrap(), "users");
        assert_eq!(r.read_i64().unwrap(), -7);
        assert_eq!(r.read_bytes().unwrap(), b"\x00\x01\x02");
        assert_eq!(r.read_string_list().unwrap(), vec!["a", "b"]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_payload_is_bad_frame() {
        let payload = PayloadWriter::new().put_string("abc").finish();
        let mut r = PayloadReader::new(&payload[..payload.len() - 1]);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn bogus_string_count_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut r = PayloadReader::new(&buf);
        assert!(r.read_string_list().is_err());
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let frame = PayloadWriter::new()
            .put_string("k")
            .into_frame(crate::protocol::CommandKind::Get);
        let mut cursor = std::io::Cursor::new(frame);
        let (kind, payload) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(kind, crate::protocol::CommandKind::Get as u8);
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.read_string().unwrap(), "k");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let mut frame = vec![crate::protocol::CommandKind::Get as u8];
        frame.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(frame);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
