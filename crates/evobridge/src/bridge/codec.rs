//! Line framing for the worker channel.
//!
//! [`LineFramer`] splits the inbound byte stream into newline-terminated
//! records; [`JsonLineCodec`] serializes outbound messages as one JSON
//! record per line. Works over any AsyncRead/AsyncWrite (pipes, sockets).

use std::io;
use std::marker::PhantomData;

use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Records larger than this are discarded to the next delimiter.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 8 * 1024 * 1024;

/// Splits an unbounded byte stream into complete, newline-terminated
/// records.
///
/// Incomplete trailing data is retained across calls, so a delimiter split
/// between two reads never loses a record. A record that exceeds the size
/// cap is dropped up to the next delimiter without breaking alignment;
/// that is an observability event, not a stream failure. Record bytes are
/// handed on as-is: non-UTF-8 garbage fails later, at decode, and only for
/// that record.
pub struct LineFramer {
    max_record_bytes: usize,
    /// Offset already scanned for a delimiter, so repeated partial reads
    /// stay linear.
    scanned: usize,
    discarding: bool,
    oversized: u64,
    /// Buffer backing the [`feed`](Self::feed) entry point. FramedRead
    /// brings its own.
    buffer: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_record_bytes(DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_max_record_bytes(max_record_bytes: usize) -> Self {
        Self {
            max_record_bytes,
            scanned: 0,
            discarding: false,
            oversized: 0,
            buffer: BytesMut::new(),
        }
    }

    /// Number of oversized records dropped so far.
    pub fn oversized_records(&self) -> u64 {
        self.oversized
    }

    /// Append bytes and return every record completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<BytesMut> {
        let mut src = std::mem::take(&mut self.buffer);
        src.extend_from_slice(bytes);

        let mut records = Vec::new();
        while let Some(record) = self.split_record(&mut src) {
            records.push(record);
        }

        self.buffer = src;
        records
    }

    fn split_record(&mut self, src: &mut BytesMut) -> Option<BytesMut> {
        loop {
            if self.discarding {
                match src.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        let _ = src.split_to(pos + 1);
                        self.discarding = false;
                        self.scanned = 0;
                        continue;
                    }
                    None => {
                        src.clear();
                        return None;
                    }
                }
            }

            match src[self.scanned..].iter().position(|&b| b == b'\n') {
                Some(offset) => {
                    let pos = self.scanned + offset;
                    self.scanned = 0;
                    let mut record = src.split_to(pos + 1);
                    record.truncate(pos);
                    if record.last() == Some(&b'\r') {
                        record.truncate(record.len() - 1);
                    }
                    if record.is_empty() {
                        continue;
                    }
                    return Some(record);
                }
                None => {
                    self.scanned = src.len();
                    if src.len() > self.max_record_bytes {
                        tracing::warn!(
                            buffered = src.len(),
                            limit = self.max_record_bytes,
                            "discarding oversized record"
                        );
                        self.oversized += 1;
                        self.discarding = true;
                        self.scanned = 0;
                        src.clear();
                        continue;
                    }
                    return None;
                }
            }
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineFramer {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.split_record(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(record) = self.split_record(src) {
            return Ok(Some(record));
        }
        if src.is_empty() || self.discarding {
            return Ok(None);
        }
        // Unterminated trailing record at EOF: deliver rather than drop.
        self.scanned = 0;
        let mut record = src.split_to(src.len());
        if record.last() == Some(&b'\r') {
            record.truncate(record.len() - 1);
        }
        if record.is_empty() {
            Ok(None)
        } else {
            Ok(Some(record))
        }
    }
}

/// Codec that writes each message as one JSON record followed by a newline.
///
/// Compact serde_json output never contains a literal newline, so the
/// framing delimiter cannot appear inside a record.
pub struct JsonLineCodec<T> {
    _phantom: PhantomData<T>,
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(record_bytes = json.len(), "encoding record");
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
