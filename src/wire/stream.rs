//! Resumable field-by-field message encoding.
//!
//! Every message writes its fields in a fixed numbered order. [`MessageWriter`] and
//! [`MessageReader`] remember the number of the field in progress, so encoding or
//! decoding can stop whenever the buffer runs out and resume later from the same
//! field with the next buffer. Bytes of a partially written field are kept by the
//! writer; bytes of a partially read field are kept by the reader. Fields that were
//! already completed are never encoded or decoded twice.
//!
//! # Field encodings
//!
//! ```text
//! u8/bool      1 byte
//! u32          4 bytes, big endian
//! u64          8 bytes, big endian
//! topology     u64 major + u32 minor
//! bytes        u32 length (0xFFFF_FFFF = absent) + data
//! ```
//!
//! Composite values (lists, optional structs) are encoded as a `bytes` field whose
//! contents use [`super::encoding`].

use crate::core::error::WireError;
use crate::core::types::TopologyVersion;
use crate::wire::encoding::{BlobDecode, BlobEncode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length marker for an absent `bytes` field.
pub const NULL_LEN: u32 = u32::MAX;

/// Size of the message header (kind + field count).
pub const HEADER_LEN: usize = 2;

#[derive(Debug)]
struct PendingField {
    data: Bytes,
    offset: usize,
}

/// Incremental message writer.
#[derive(Debug, Default)]
pub struct MessageWriter {
    state: u8,
    header_written: bool,
    pending: Option<PendingField>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the field currently being written.
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Advance to the next field.
    pub fn increment_state(&mut self) {
        self.state += 1;
    }

    pub fn is_header_written(&self) -> bool {
        self.header_written
    }

    /// Prepare for the next message.
    pub fn reset(&mut self) {
        self.state = 0;
        self.header_written = false;
        self.pending = None;
    }

    /// Write the message header. Returns `false` if the buffer filled up.
    pub fn write_header<B: BufMut>(&mut self, buf: &mut B, kind: u8, field_count: u8) -> bool {
        if self.header_written {
            return true;
        }
        let done = self.write_field(buf, |dst| {
            dst.put_u8(kind);
            dst.put_u8(field_count);
        });
        if done {
            self.header_written = true;
        }
        done
    }

    pub fn write_u8<B: BufMut>(&mut self, buf: &mut B, value: u8) -> bool {
        self.write_field(buf, |dst| dst.put_u8(value))
    }

    pub fn write_bool<B: BufMut>(&mut self, buf: &mut B, value: bool) -> bool {
        self.write_u8(buf, u8::from(value))
    }

    pub fn write_u32<B: BufMut>(&mut self, buf: &mut B, value: u32) -> bool {
        self.write_field(buf, |dst| dst.put_u32(value))
    }

    pub fn write_u64<B: BufMut>(&mut self, buf: &mut B, value: u64) -> bool {
        self.write_field(buf, |dst| dst.put_u64(value))
    }

    pub fn write_topology_version<B: BufMut>(
        &mut self,
        buf: &mut B,
        version: TopologyVersion,
    ) -> bool {
        self.write_field(buf, |dst| {
            dst.put_u64(version.major);
            dst.put_u32(version.minor);
        })
    }

    pub fn write_bytes<B: BufMut>(&mut self, buf: &mut B, value: Option<&[u8]>) -> bool {
        self.write_field(buf, |dst| match value {
            Some(data) => {
                dst.put_u32(data.len() as u32);
                dst.put_slice(data);
            }
            None => dst.put_u32(NULL_LEN),
        })
    }

    /// Write a composite value as a `bytes` field.
    pub fn write_blob<B: BufMut, T: BlobEncode + ?Sized>(&mut self, buf: &mut B, value: &T) -> bool {
        self.write_field(buf, |dst| {
            let mut inner = BytesMut::new();
            value.encode(&mut inner);
            dst.put_u32(inner.len() as u32);
            dst.put_slice(&inner);
        })
    }

    /// Encode a field once, then flush as much of it as `buf` accepts.
    fn write_field<B, F>(&mut self, buf: &mut B, encode: F) -> bool
    where
        B: BufMut,
        F: FnOnce(&mut BytesMut),
    {
        let pending = self.pending.get_or_insert_with(|| {
            let mut scratch = BytesMut::new();
            encode(&mut scratch);
            PendingField {
                data: scratch.freeze(),
                offset: 0,
            }
        });

        let remaining = pending.data.len() - pending.offset;
        let n = remaining.min(buf.remaining_mut());
        if n > 0 {
            buf.put_slice(&pending.data[pending.offset..pending.offset + n]);
            pending.offset += n;
        }

        if pending.offset == pending.data.len() {
            self.pending = None;
            true
        } else {
            false
        }
    }
}

/// Incremental message reader.
#[derive(Debug, Default)]
pub struct MessageReader {
    state: u8,
    scratch: BytesMut,
    expected: Option<usize>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of the field currently being read.
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Advance to the next field.
    pub fn increment_state(&mut self) {
        self.state += 1;
    }

    /// Prepare for the next message.
    pub fn reset(&mut self) {
        self.state = 0;
        self.scratch.clear();
        self.expected = None;
    }

    /// Read the header. Returns `(kind, field_count)` once both bytes arrived.
    pub fn read_header<B: Buf>(&mut self, buf: &mut B) -> Option<(u8, u8)> {
        if !self.fill(buf, HEADER_LEN) {
            return None;
        }
        let mut field = self.scratch.split();
        Some((field.get_u8(), field.get_u8()))
    }

    pub fn read_u8<B: Buf>(&mut self, buf: &mut B) -> Option<u8> {
        if !self.fill(buf, 1) {
            return None;
        }
        Some(self.scratch.split().get_u8())
    }

    pub fn read_bool<B: Buf>(&mut self, buf: &mut B) -> Option<bool> {
        self.read_u8(buf).map(|v| v != 0)
    }

    pub fn read_u32<B: Buf>(&mut self, buf: &mut B) -> Option<u32> {
        if !self.fill(buf, 4) {
            return None;
        }
        Some(self.scratch.split().get_u32())
    }

    pub fn read_u64<B: Buf>(&mut self, buf: &mut B) -> Option<u64> {
        if !self.fill(buf, 8) {
            return None;
        }
        Some(self.scratch.split().get_u64())
    }

    pub fn read_topology_version<B: Buf>(&mut self, buf: &mut B) -> Option<TopologyVersion> {
        if !self.fill(buf, 12) {
            return None;
        }
        let mut field = self.scratch.split();
        let major = field.get_u64();
        let minor = field.get_u32();
        Some(TopologyVersion { major, minor })
    }

    /// Read a `bytes` field. The outer `Option` is `None` while data is missing.
    pub fn read_bytes<B: Buf>(&mut self, buf: &mut B) -> Option<Option<Bytes>> {
        let len = match self.expected {
            Some(len) => len,
            None => {
                if !self.fill(buf, 4) {
                    return None;
                }
                let len = self.scratch.split().get_u32();
                if len == NULL_LEN {
                    return Some(None);
                }
                self.expected = Some(len as usize);
                len as usize
            }
        };

        if !self.fill(buf, len) {
            return None;
        }
        self.expected = None;
        Some(Some(self.scratch.split().freeze()))
    }

    /// Read a composite value written with [`MessageWriter::write_blob`].
    pub fn read_blob<B: Buf, T: BlobDecode>(
        &mut self,
        buf: &mut B,
        field: &'static str,
    ) -> Option<Result<T, WireError>> {
        let raw = self.read_bytes(buf)?;
        let mut data = match raw {
            Some(data) => data,
            None => return Some(Err(WireError::malformed(field, "absent composite field"))),
        };
        let decoded = T::decode(&mut data).and_then(|value| {
            if data.has_remaining() {
                Err(WireError::malformed(field, "trailing bytes"))
            } else {
                Ok(value)
            }
        });
        Some(decoded.map_err(|e| match e {
            WireError::Malformed { reason, .. } => WireError::Malformed { field, reason },
            other => other,
        }))
    }

    /// Buffer bytes from `buf` until the current field holds `n` bytes.
    fn fill<B: Buf>(&mut self, buf: &mut B, n: usize) -> bool {
        while self.scratch.len() < n && buf.has_remaining() {
            let chunk = buf.chunk();
            let take = (n - self.scratch.len()).min(chunk.len());
            self.scratch.extend_from_slice(&chunk[..take]);
            buf.advance(take);
        }
        self.scratch.len() == n
    }
}
