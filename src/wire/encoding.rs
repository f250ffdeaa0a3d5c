//! Encoding of composite field values.
//!
//! Lists and structured values travel inside a single length-prefixed `bytes`
//! field. Their contents are encoded here, without any pause/resume support:
//! the enclosing field is always written and read as a whole.
//!
//! ```text
//! u8/bool      1 byte
//! u32/u64/i64  big endian
//! bytes        u32 length + data
//! string       bytes (UTF-8)
//! option       u8 presence flag + value
//! list         u32 count + values
//! ```

use crate::atomic::result::{CacheReturn, InvokeOutcome, ReturnValue};
use crate::core::error::{FailureCause, WireError};
use crate::core::types::{
    EntryFilter, ExpiryPolicy, NodeId, ProcessorRef, TopologyVersion, WriteVersion,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Encode a value into a composite field.
pub trait BlobEncode {
    fn encode(&self, dst: &mut BytesMut);
}

/// Decode a value from a composite field.
pub trait BlobDecode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, WireError>;
}

fn ensure(src: &Bytes, n: usize) -> Result<(), WireError> {
    if src.remaining() < n {
        return Err(WireError::malformed(
            "blob",
            format!("need {} bytes, have {}", n, src.remaining()),
        ));
    }
    Ok(())
}

fn tag_error(what: &str, tag: u8) -> WireError {
    WireError::malformed("blob", format!("unknown {} tag {}", what, tag))
}

impl BlobEncode for u8 {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(*self);
    }
}

impl BlobDecode for u8 {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        ensure(src, 1)?;
        Ok(src.get_u8())
    }
}

impl BlobEncode for bool {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(u8::from(*self));
    }
}

impl BlobDecode for bool {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(u8::decode(src)? != 0)
    }
}

impl BlobEncode for u32 {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(*self);
    }
}

impl BlobDecode for u32 {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        ensure(src, 4)?;
        Ok(src.get_u32())
    }
}

impl BlobEncode for u64 {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(*self);
    }
}

impl BlobDecode for u64 {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        ensure(src, 8)?;
        Ok(src.get_u64())
    }
}

impl BlobEncode for i64 {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i64(*self);
    }
}

impl BlobDecode for i64 {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        ensure(src, 8)?;
        Ok(src.get_i64())
    }
}

impl BlobEncode for Bytes {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.len() as u32);
        dst.put_slice(self);
    }
}

impl BlobDecode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        let len = u32::decode(src)? as usize;
        ensure(src, len)?;
        Ok(src.split_to(len))
    }
}

impl BlobEncode for String {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.len() as u32);
        dst.put_slice(self.as_bytes());
    }
}

impl BlobDecode for String {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        let raw = Bytes::decode(src)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| WireError::malformed("blob", format!("invalid utf-8: {}", e)))
    }
}

impl<T: BlobEncode> BlobEncode for Option<T> {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Some(value) => {
                dst.put_u8(1);
                value.encode(dst);
            }
            None => dst.put_u8(0),
        }
    }
}

impl<T: BlobDecode> BlobDecode for Option<T> {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        match u8::decode(src)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(src)?)),
            other => Err(tag_error("option", other)),
        }
    }
}

impl<T: BlobEncode> BlobEncode for Vec<T> {
    fn encode(&self, dst: &mut BytesMut) {
        self.as_slice().encode(dst);
    }
}

impl<T: BlobEncode> BlobEncode for [T] {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.len() as u32);
        for item in self {
            item.encode(dst);
        }
    }
}

impl<T: BlobDecode> BlobDecode for Vec<T> {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        let count = u32::decode(src)? as usize;
        // Every element takes at least one byte.
        let mut items = Vec::with_capacity(count.min(src.remaining()));
        for _ in 0..count {
            items.push(T::decode(src)?);
        }
        Ok(items)
    }
}

impl<A: BlobEncode, B: BlobEncode> BlobEncode for (A, B) {
    fn encode(&self, dst: &mut BytesMut) {
        self.0.encode(dst);
        self.1.encode(dst);
    }
}

impl<A: BlobDecode, B: BlobDecode> BlobDecode for (A, B) {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok((A::decode(src)?, B::decode(src)?))
    }
}

impl BlobEncode for NodeId {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.0);
    }
}

impl BlobDecode for NodeId {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(NodeId(u64::decode(src)?))
    }
}

impl BlobEncode for TopologyVersion {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u64(self.major);
        dst.put_u32(self.minor);
    }
}

impl BlobDecode for TopologyVersion {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(TopologyVersion::new(u64::decode(src)?, u32::decode(src)?))
    }
}

impl BlobEncode for WriteVersion {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.topology_order);
        dst.put_u64(self.order);
        dst.put_u32(self.node_order);
    }
}

impl BlobDecode for WriteVersion {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        let topology_order = u32::decode(src)?;
        let order = u64::decode(src)?;
        let node_order = u32::decode(src)?;
        Ok(WriteVersion::new(topology_order, order, node_order))
    }
}

impl BlobEncode for ProcessorRef {
    fn encode(&self, dst: &mut BytesMut) {
        self.name.encode(dst);
    }
}

impl BlobDecode for ProcessorRef {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(ProcessorRef::new(String::decode(src)?))
    }
}

impl BlobEncode for EntryFilter {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::HasValue => dst.put_u8(0),
            Self::NoValue => dst.put_u8(1),
            Self::ValueEquals(value) => {
                dst.put_u8(2);
                value.encode(dst);
            }
        }
    }
}

impl BlobDecode for EntryFilter {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        match u8::decode(src)? {
            0 => Ok(Self::HasValue),
            1 => Ok(Self::NoValue),
            2 => Ok(Self::ValueEquals(Bytes::decode(src)?)),
            other => Err(tag_error("filter", other)),
        }
    }
}

impl BlobEncode for ExpiryPolicy {
    fn encode(&self, dst: &mut BytesMut) {
        self.create_ms.encode(dst);
        self.update_ms.encode(dst);
        self.access_ms.encode(dst);
    }
}

impl BlobDecode for ExpiryPolicy {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(ExpiryPolicy {
            create_ms: Option::decode(src)?,
            update_ms: Option::decode(src)?,
            access_ms: Option::decode(src)?,
        })
    }
}

impl BlobEncode for FailureCause {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::NodeDeparted { node } => {
                dst.put_u8(0);
                node.encode(dst);
            }
            Self::TopologyChanged { message } => {
                dst.put_u8(1);
                message.encode(dst);
            }
            Self::ServerNotFound => dst.put_u8(2),
            Self::Rejected { message } => {
                dst.put_u8(3);
                message.encode(dst);
            }
        }
    }
}

impl BlobDecode for FailureCause {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        match u8::decode(src)? {
            0 => Ok(Self::NodeDeparted {
                node: NodeId::decode(src)?,
            }),
            1 => Ok(Self::TopologyChanged {
                message: String::decode(src)?,
            }),
            2 => Ok(Self::ServerNotFound),
            3 => Ok(Self::Rejected {
                message: String::decode(src)?,
            }),
            other => Err(tag_error("failure cause", other)),
        }
    }
}

impl BlobEncode for InvokeOutcome {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Value(value) => {
                dst.put_u8(0);
                value.encode(dst);
            }
            Self::Error(message) => {
                dst.put_u8(1);
                message.encode(dst);
            }
        }
    }
}

impl BlobDecode for InvokeOutcome {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        match u8::decode(src)? {
            0 => Ok(Self::Value(Option::decode(src)?)),
            1 => Ok(Self::Error(String::decode(src)?)),
            other => Err(tag_error("invoke outcome", other)),
        }
    }
}

impl BlobEncode for CacheReturn {
    fn encode(&self, dst: &mut BytesMut) {
        self.success.encode(dst);
        match &self.value {
            None => dst.put_u8(0),
            Some(ReturnValue::Previous(previous)) => {
                dst.put_u8(1);
                previous.encode(dst);
            }
            Some(ReturnValue::Transform(results)) => {
                dst.put_u8(2);
                dst.put_u32(results.len() as u32);
                for (key, outcome) in results {
                    key.encode(dst);
                    outcome.encode(dst);
                }
            }
        }
    }
}

impl BlobDecode for CacheReturn {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        let success = bool::decode(src)?;
        let value = match u8::decode(src)? {
            0 => None,
            1 => Some(ReturnValue::Previous(Option::decode(src)?)),
            2 => {
                let pairs: Vec<(Bytes, InvokeOutcome)> = Vec::decode(src)?;
                Some(ReturnValue::Transform(pairs.into_iter().collect::<BTreeMap<_, _>>()))
            }
            other => return Err(tag_error("return", other)),
        };
        Ok(CacheReturn { value, success })
    }
}
