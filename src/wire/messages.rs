//! Write-path message shapes.
//!
//! Every message starts with the common envelope (field 0: cache id, field 1:
//! partition) followed by its own fields in a fixed order. Fields are written and
//! read through [`MessageWriter`] / [`MessageReader`], so a message can be split
//! across any number of buffers.
//!
//! | Kind | Message | Direction |
//! |------|---------|-----------|
//! | 1 | [`NearUpdateRequest`] | near → primary |
//! | 2 | [`BackupUpdateRequest`] | primary → backup / reader |
//! | 3 | [`UpdateResponse`] | primary → near, backup → primary |
//! | 4 | [`NearMappingResponse`] | primary → near |
//! | 5 | [`BackupNearResponse`] | backup / primary → near |
//! | 6 | [`CheckUpdateRequest`] | near → primary |

use crate::atomic::result::CacheReturn;
use crate::core::error::{FailureCause, WireError};
use crate::core::types::{
    EntryFilter, ExpiryPolicy, FutureId, Key, NodeId, Operation, ProcessorRef, SyncMode,
    TopologyVersion, Value, WriteVersion, EXPIRE_TIME_CALCULATE, TTL_NOT_CHANGED,
};
use crate::wire::encoding::{BlobDecode, BlobEncode};
use crate::wire::stream::{MessageReader, MessageWriter};
use crate::wire::MessageKind;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Unwrap a field read, pausing decoding when the buffer ran out.
macro_rules! field {
    ($read:expr) => {
        match $read {
            Some(value) => value,
            None => return Ok(false),
        }
    };
}

/// Write a field, pausing encoding when the buffer is full.
macro_rules! put {
    ($write:expr) => {
        if !$write {
            return false;
        }
    };
}

/// A message with a numbered, resumable field layout.
pub trait WireMessage: Default {
    const KIND: MessageKind;

    /// Number of fields, envelope included.
    const FIELD_COUNT: u8;

    /// Write remaining fields. Returns `true` once the whole message is written.
    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool;

    /// Read remaining fields. Returns `Ok(true)` once the whole message is read.
    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError>;
}

fn sync_mode(raw: u8) -> Result<SyncMode, WireError> {
    SyncMode::from_u8(raw).ok_or_else(|| WireError::malformed("sync_mode", format!("{}", raw)))
}

fn operation(raw: u8) -> Result<Operation, WireError> {
    Operation::from_u8(raw).ok_or_else(|| WireError::malformed("operation", format!("{}", raw)))
}

bitflags::bitflags! {
    /// Flags of a [`NearUpdateRequest`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestFlags: u8 {
        /// Issued inside a topology-locked context; never remapped.
        const TOPOLOGY_LOCKED = 0b0000_0001;
        /// Return the previous value.
        const RETURN_VALUE = 0b0000_0010;
        /// Do not write through to the store.
        const SKIP_STORE = 0b0000_0100;
        /// Keep values in binary form.
        const KEEP_BINARY = 0b0000_1000;
        /// Issued by a client node.
        const CLIENT_REQUEST = 0b0001_0000;
    }
}

impl Default for RequestFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags::bitflags! {
    /// Flags of a [`BackupUpdateRequest`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BackupFlags: u8 {
        /// The backup must notify the near node directly.
        const NEAR_REPLY = 0b0000_0001;
        /// The request carries the primary's result.
        const HAS_RESULT = 0b0000_0010;
        /// Success flag of the carried result.
        const RESULT_SUCCESS = 0b0000_0100;
        /// Keep values in binary form.
        const KEEP_BINARY = 0b0000_1000;
        /// Do not write through to the store.
        const SKIP_STORE = 0b0001_0000;
    }
}

impl Default for BackupFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags::bitflags! {
    /// Flags of a [`BackupNearResponse`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NearResponseFlags: u8 {
        /// The response carries the primary's result.
        const HAS_RESULT = 0b0000_0001;
        /// Success flag of the carried result.
        const RESULT_SUCCESS = 0b0000_0010;
    }
}

impl Default for NearResponseFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Near update request
// ============================================================================

/// One key of an update, as sent from the near node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    pub key: Key,
    pub value: Option<Value>,
    pub processor: Option<ProcessorRef>,
    pub ttl: i64,
    pub expire_time: i64,
}

impl UpdateEntry {
    pub fn new(key: Key, value: Option<Value>, processor: Option<ProcessorRef>) -> Self {
        Self {
            key,
            value,
            processor,
            ttl: TTL_NOT_CHANGED,
            expire_time: EXPIRE_TIME_CALCULATE,
        }
    }
}

impl BlobEncode for UpdateEntry {
    fn encode(&self, dst: &mut BytesMut) {
        self.key.encode(dst);
        self.value.encode(dst);
        self.processor.encode(dst);
        self.ttl.encode(dst);
        self.expire_time.encode(dst);
    }
}

impl BlobDecode for UpdateEntry {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            key: Bytes::decode(src)?,
            value: Option::decode(src)?,
            processor: Option::decode(src)?,
            ttl: i64::decode(src)?,
            expire_time: i64::decode(src)?,
        })
    }
}

/// Operation-specific part of a [`NearUpdateRequest`].
///
/// The single-key shapes are used whenever no expiry policy is set; anything else
/// travels as [`UpdatePayload::Full`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePayload {
    /// One key, plain value or removal.
    Single { key: Key, value: Option<Value> },
    /// One key with entry filters.
    SingleFilter {
        key: Key,
        value: Option<Value>,
        filters: Vec<EntryFilter>,
    },
    /// One key transformed by an entry processor.
    SingleInvoke {
        key: Key,
        processor: ProcessorRef,
        invoke_args: Vec<Bytes>,
    },
    /// Any number of keys with optional filters, processor arguments and expiry.
    Full {
        entries: Vec<UpdateEntry>,
        filters: Vec<EntryFilter>,
        invoke_args: Vec<Bytes>,
        expiry: Option<ExpiryPolicy>,
    },
}

impl Default for UpdatePayload {
    fn default() -> Self {
        Self::Single {
            key: Bytes::new(),
            value: None,
        }
    }
}

impl UpdatePayload {
    /// Pick the most compact shape able to carry the update.
    pub fn build(
        entries: Vec<UpdateEntry>,
        filters: Vec<EntryFilter>,
        invoke_args: Vec<Bytes>,
        expiry: Option<ExpiryPolicy>,
    ) -> Self {
        if let (None, [entry]) = (expiry, entries.as_slice()) {
            let entry = entry.clone();
            return match entry.processor {
                Some(processor) => Self::SingleInvoke {
                    key: entry.key,
                    processor,
                    invoke_args,
                },
                None if filters.is_empty() => Self::Single {
                    key: entry.key,
                    value: entry.value,
                },
                None => Self::SingleFilter {
                    key: entry.key,
                    value: entry.value,
                    filters,
                },
            };
        }

        Self::Full {
            entries,
            filters,
            invoke_args,
            expiry,
        }
    }

    /// Keys touched by the update.
    pub fn keys(&self) -> Vec<Key> {
        match self {
            Self::Single { key, .. }
            | Self::SingleFilter { key, .. }
            | Self::SingleInvoke { key, .. } => vec![key.clone()],
            Self::Full { entries, .. } => entries.iter().map(|e| e.key.clone()).collect(),
        }
    }

    /// Entries of the update, whatever the shape.
    pub fn entries(&self) -> Vec<UpdateEntry> {
        match self {
            Self::Single { key, value } | Self::SingleFilter { key, value, .. } => {
                vec![UpdateEntry::new(key.clone(), value.clone(), None)]
            }
            Self::SingleInvoke { key, processor, .. } => {
                vec![UpdateEntry::new(key.clone(), None, Some(processor.clone()))]
            }
            Self::Full { entries, .. } => entries.clone(),
        }
    }

    pub fn filters(&self) -> &[EntryFilter] {
        match self {
            Self::SingleFilter { filters, .. } | Self::Full { filters, .. } => filters,
            Self::Single { .. } | Self::SingleInvoke { .. } => &[],
        }
    }

    pub fn invoke_args(&self) -> &[Bytes] {
        match self {
            Self::SingleInvoke { invoke_args, .. } | Self::Full { invoke_args, .. } => invoke_args,
            Self::Single { .. } | Self::SingleFilter { .. } => &[],
        }
    }

    pub fn expiry(&self) -> Option<ExpiryPolicy> {
        match self {
            Self::Full { expiry, .. } => *expiry,
            _ => None,
        }
    }

    /// Whether this is one of the single-key shapes.
    pub fn is_single(&self) -> bool {
        !matches!(self, Self::Full { .. })
    }
}

impl BlobEncode for UpdatePayload {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Single { key, value } => {
                dst.put_u8(0);
                key.encode(dst);
                value.encode(dst);
            }
            Self::SingleFilter {
                key,
                value,
                filters,
            } => {
                dst.put_u8(1);
                key.encode(dst);
                value.encode(dst);
                filters.encode(dst);
            }
            Self::SingleInvoke {
                key,
                processor,
                invoke_args,
            } => {
                dst.put_u8(2);
                key.encode(dst);
                processor.encode(dst);
                invoke_args.encode(dst);
            }
            Self::Full {
                entries,
                filters,
                invoke_args,
                expiry,
            } => {
                dst.put_u8(3);
                entries.encode(dst);
                filters.encode(dst);
                invoke_args.encode(dst);
                expiry.encode(dst);
            }
        }
    }
}

impl BlobDecode for UpdatePayload {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        match u8::decode(src)? {
            0 => Ok(Self::Single {
                key: Bytes::decode(src)?,
                value: Option::decode(src)?,
            }),
            1 => Ok(Self::SingleFilter {
                key: Bytes::decode(src)?,
                value: Option::decode(src)?,
                filters: Vec::decode(src)?,
            }),
            2 => Ok(Self::SingleInvoke {
                key: Bytes::decode(src)?,
                processor: ProcessorRef::decode(src)?,
                invoke_args: Vec::decode(src)?,
            }),
            3 => Ok(Self::Full {
                entries: Vec::decode(src)?,
                filters: Vec::decode(src)?,
                invoke_args: Vec::decode(src)?,
                expiry: Option::decode(src)?,
            }),
            other => Err(WireError::malformed(
                "payload",
                format!("unknown payload shape {}", other),
            )),
        }
    }
}

/// Update request sent by the near node to the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NearUpdateRequest {
    pub cache_id: u32,
    pub partition: u32,
    /// Near future id of the attempt.
    pub future_id: FutureId,
    pub write_version: WriteVersion,
    pub topology_version: TopologyVersion,
    pub sync_mode: SyncMode,
    pub operation: Operation,
    pub flags: RequestFlags,
    pub payload: UpdatePayload,
    pub subject_id: u64,
    pub task_name_hash: u32,
}

impl NearUpdateRequest {
    pub fn keys(&self) -> Vec<Key> {
        self.payload.keys()
    }

    pub fn topology_locked(&self) -> bool {
        self.flags.contains(RequestFlags::TOPOLOGY_LOCKED)
    }

    pub fn return_value(&self) -> bool {
        self.flags.contains(RequestFlags::RETURN_VALUE)
    }
}

impl WireMessage for NearUpdateRequest {
    const KIND: MessageKind = MessageKind::NearUpdateRequest;
    const FIELD_COUNT: u8 = 11;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool {
        put!(writer.write_header(buf, Self::KIND as u8, Self::FIELD_COUNT));

        loop {
            match writer.state() {
                0 => put!(writer.write_u32(buf, self.cache_id)),
                1 => put!(writer.write_u32(buf, self.partition)),
                2 => put!(writer.write_u64(buf, self.future_id)),
                3 => put!(writer.write_blob(buf, &self.write_version)),
                4 => put!(writer.write_topology_version(buf, self.topology_version)),
                5 => put!(writer.write_u8(buf, self.sync_mode.as_u8())),
                6 => put!(writer.write_u8(buf, self.operation.as_u8())),
                7 => put!(writer.write_u8(buf, self.flags.bits())),
                8 => put!(writer.write_blob(buf, &self.payload)),
                9 => put!(writer.write_u64(buf, self.subject_id)),
                10 => put!(writer.write_u32(buf, self.task_name_hash)),
                _ => return true,
            }
            writer.increment_state();
        }
    }

    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError> {
        loop {
            match reader.state() {
                0 => self.cache_id = field!(reader.read_u32(buf)),
                1 => self.partition = field!(reader.read_u32(buf)),
                2 => self.future_id = field!(reader.read_u64(buf)),
                3 => self.write_version = field!(reader.read_blob(buf, "write_version"))?,
                4 => self.topology_version = field!(reader.read_topology_version(buf)),
                5 => self.sync_mode = sync_mode(field!(reader.read_u8(buf)))?,
                6 => self.operation = operation(field!(reader.read_u8(buf)))?,
                7 => self.flags = RequestFlags::from_bits_truncate(field!(reader.read_u8(buf))),
                8 => self.payload = field!(reader.read_blob(buf, "payload"))?,
                9 => self.subject_id = field!(reader.read_u64(buf)),
                10 => self.task_name_hash = field!(reader.read_u32(buf)),
                _ => return Ok(true),
            }
            reader.increment_state();
        }
    }
}

// ============================================================================
// Backup update request
// ============================================================================

/// One key written on a backup.
///
/// `conflict_version`, `send_previous` and `previous` are reserved on the wire for
/// conflict resolution and old-value listeners on backups. The primary in this crate
/// runs neither, so it always sends them empty and backups ignore them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub key: Key,
    /// New value; `None` removes the entry.
    pub value: Option<Value>,
    pub ttl: i64,
    pub conflict_expire_time: i64,
    /// Reserved: version chosen by a conflict resolver.
    pub conflict_version: Option<WriteVersion>,
    /// Reserved: whether `previous` was filled in by the primary.
    pub send_previous: bool,
    /// Reserved: value before the update.
    pub previous: Option<Value>,
    pub update_counter: u64,
}

impl BlobEncode for BackupEntry {
    fn encode(&self, dst: &mut BytesMut) {
        self.key.encode(dst);
        self.value.encode(dst);
        self.ttl.encode(dst);
        self.conflict_expire_time.encode(dst);
        self.conflict_version.encode(dst);
        self.send_previous.encode(dst);
        self.previous.encode(dst);
        self.update_counter.encode(dst);
    }
}

impl BlobDecode for BackupEntry {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            key: Bytes::decode(src)?,
            value: Option::decode(src)?,
            ttl: i64::decode(src)?,
            conflict_expire_time: i64::decode(src)?,
            conflict_version: Option::decode(src)?,
            send_previous: bool::decode(src)?,
            previous: Option::decode(src)?,
            update_counter: u64::decode(src)?,
        })
    }
}

/// One key pushed to a node holding a near-side read view of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NearEntry {
    pub key: Key,
    pub value: Option<Value>,
    pub ttl: i64,
    pub expire_time: i64,
}

impl BlobEncode for NearEntry {
    fn encode(&self, dst: &mut BytesMut) {
        self.key.encode(dst);
        self.value.encode(dst);
        self.ttl.encode(dst);
        self.expire_time.encode(dst);
    }
}

impl BlobDecode for NearEntry {
    fn decode(src: &mut Bytes) -> Result<Self, WireError> {
        Ok(Self {
            key: Bytes::decode(src)?,
            value: Option::decode(src)?,
            ttl: i64::decode(src)?,
            expire_time: i64::decode(src)?,
        })
    }
}

/// Update request sent by the primary to a backup or reader node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupUpdateRequest {
    pub cache_id: u32,
    pub partition: u32,
    /// Fan-out future id on the primary.
    pub future_id: FutureId,
    /// Near future id the near node is waiting on.
    pub near_future_id: FutureId,
    pub near_node: NodeId,
    pub write_version: WriteVersion,
    pub topology_version: TopologyVersion,
    pub sync_mode: SyncMode,
    pub flags: BackupFlags,
    pub entries: Vec<BackupEntry>,
    pub near_entries: Vec<NearEntry>,
    pub invoke_args: Vec<Bytes>,
    /// Every node of the fan-out, sent along when the backup must notify the near node.
    pub mapping: Option<Vec<NodeId>>,
    pub subject_id: u64,
    pub task_name_hash: u32,
}

impl BackupUpdateRequest {
    pub fn near_reply(&self) -> bool {
        self.flags.contains(BackupFlags::NEAR_REPLY)
    }

    /// Success flag of the primary's result, if carried.
    pub fn result(&self) -> Option<bool> {
        self.flags
            .contains(BackupFlags::HAS_RESULT)
            .then(|| self.flags.contains(BackupFlags::RESULT_SUCCESS))
    }

    pub fn set_result(&mut self, success: bool) {
        self.flags.insert(BackupFlags::HAS_RESULT);
        self.flags.set(BackupFlags::RESULT_SUCCESS, success);
    }
}

impl WireMessage for BackupUpdateRequest {
    const KIND: MessageKind = MessageKind::BackupUpdateRequest;
    const FIELD_COUNT: u8 = 15;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool {
        put!(writer.write_header(buf, Self::KIND as u8, Self::FIELD_COUNT));

        loop {
            match writer.state() {
                0 => put!(writer.write_u32(buf, self.cache_id)),
                1 => put!(writer.write_u32(buf, self.partition)),
                2 => put!(writer.write_u64(buf, self.future_id)),
                3 => put!(writer.write_u64(buf, self.near_future_id)),
                4 => put!(writer.write_u64(buf, self.near_node.0)),
                5 => put!(writer.write_blob(buf, &self.write_version)),
                6 => put!(writer.write_topology_version(buf, self.topology_version)),
                7 => put!(writer.write_u8(buf, self.sync_mode.as_u8())),
                8 => put!(writer.write_u8(buf, self.flags.bits())),
                9 => put!(writer.write_blob(buf, &self.entries)),
                10 => put!(writer.write_blob(buf, &self.near_entries)),
                11 => put!(writer.write_blob(buf, &self.invoke_args)),
                12 => put!(writer.write_blob(buf, &self.mapping)),
                13 => put!(writer.write_u64(buf, self.subject_id)),
                14 => put!(writer.write_u32(buf, self.task_name_hash)),
                _ => return true,
            }
            writer.increment_state();
        }
    }

    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError> {
        loop {
            match reader.state() {
                0 => self.cache_id = field!(reader.read_u32(buf)),
                1 => self.partition = field!(reader.read_u32(buf)),
                2 => self.future_id = field!(reader.read_u64(buf)),
                3 => self.near_future_id = field!(reader.read_u64(buf)),
                4 => self.near_node = NodeId(field!(reader.read_u64(buf))),
                5 => self.write_version = field!(reader.read_blob(buf, "write_version"))?,
                6 => self.topology_version = field!(reader.read_topology_version(buf)),
                7 => self.sync_mode = sync_mode(field!(reader.read_u8(buf)))?,
                8 => self.flags = BackupFlags::from_bits_truncate(field!(reader.read_u8(buf))),
                9 => self.entries = field!(reader.read_blob(buf, "entries"))?,
                10 => self.near_entries = field!(reader.read_blob(buf, "near_entries"))?,
                11 => self.invoke_args = field!(reader.read_blob(buf, "invoke_args"))?,
                12 => self.mapping = field!(reader.read_blob(buf, "mapping"))?,
                13 => self.subject_id = field!(reader.read_u64(buf)),
                14 => self.task_name_hash = field!(reader.read_u32(buf)),
                _ => return Ok(true),
            }
            reader.increment_state();
        }
    }
}

// ============================================================================
// Update response
// ============================================================================

/// Response to an update, from the primary to the near node or from a backup to
/// the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResponse {
    pub cache_id: u32,
    pub partition: u32,
    /// Future id of the request being answered.
    pub future_id: FutureId,
    /// Node that produced the response.
    pub node_id: NodeId,
    pub ret: Option<CacheReturn>,
    /// Keys that failed, each with its cause.
    pub failed_keys: Vec<(Key, FailureCause)>,
    /// Failure not attributable to specific keys.
    pub error: Option<FailureCause>,
    /// Keys the primary refused because the request's topology is stale.
    pub remap_keys: Vec<Key>,
    /// Topology version the primary is at when asking for a remap.
    pub remap_topology_version: TopologyVersion,
    /// Backups the near node must also hear from.
    pub mapping: Option<Vec<NodeId>>,
    /// Version to stamp on near-cache updates.
    pub near_version: Option<WriteVersion>,
    /// Values computed by the primary for the near cache.
    pub near_values: Vec<NearEntry>,
}

impl UpdateResponse {
    pub fn new(cache_id: u32, partition: u32, future_id: FutureId, node_id: NodeId) -> Self {
        Self {
            cache_id,
            partition,
            future_id,
            node_id,
            ..Self::default()
        }
    }

    /// Mark every key in `keys` as failed with `cause`.
    pub fn add_failed_keys<I>(&mut self, keys: I, cause: FailureCause)
    where
        I: IntoIterator<Item = Key>,
    {
        self.failed_keys
            .extend(keys.into_iter().map(|key| (key, cause.clone())));
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some() || !self.failed_keys.is_empty()
    }

    pub fn needs_remap(&self) -> bool {
        !self.remap_keys.is_empty()
    }
}

impl WireMessage for UpdateResponse {
    const KIND: MessageKind = MessageKind::UpdateResponse;
    const FIELD_COUNT: u8 = 12;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool {
        put!(writer.write_header(buf, Self::KIND as u8, Self::FIELD_COUNT));

        loop {
            match writer.state() {
                0 => put!(writer.write_u32(buf, self.cache_id)),
                1 => put!(writer.write_u32(buf, self.partition)),
                2 => put!(writer.write_u64(buf, self.future_id)),
                3 => put!(writer.write_u64(buf, self.node_id.0)),
                4 => put!(writer.write_blob(buf, &self.ret)),
                5 => put!(writer.write_blob(buf, &self.failed_keys)),
                6 => put!(writer.write_blob(buf, &self.error)),
                7 => put!(writer.write_blob(buf, &self.remap_keys)),
                8 => put!(writer.write_topology_version(buf, self.remap_topology_version)),
                9 => put!(writer.write_blob(buf, &self.mapping)),
                10 => put!(writer.write_blob(buf, &self.near_version)),
                11 => put!(writer.write_blob(buf, &self.near_values)),
                _ => return true,
            }
            writer.increment_state();
        }
    }

    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError> {
        loop {
            match reader.state() {
                0 => self.cache_id = field!(reader.read_u32(buf)),
                1 => self.partition = field!(reader.read_u32(buf)),
                2 => self.future_id = field!(reader.read_u64(buf)),
                3 => self.node_id = NodeId(field!(reader.read_u64(buf))),
                4 => self.ret = field!(reader.read_blob(buf, "ret"))?,
                5 => self.failed_keys = field!(reader.read_blob(buf, "failed_keys"))?,
                6 => self.error = field!(reader.read_blob(buf, "error"))?,
                7 => self.remap_keys = field!(reader.read_blob(buf, "remap_keys"))?,
                8 => self.remap_topology_version = field!(reader.read_topology_version(buf)),
                9 => self.mapping = field!(reader.read_blob(buf, "mapping"))?,
                10 => self.near_version = field!(reader.read_blob(buf, "near_version"))?,
                11 => self.near_values = field!(reader.read_blob(buf, "near_values"))?,
                _ => return Ok(true),
            }
            reader.increment_state();
        }
    }
}

// ============================================================================
// Near mapping response
// ============================================================================

/// Backups of an update, sent by the primary so the near node knows whom to await.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NearMappingResponse {
    pub cache_id: u32,
    pub partition: u32,
    pub future_id: FutureId,
    pub mapping: Vec<NodeId>,
}

impl WireMessage for NearMappingResponse {
    const KIND: MessageKind = MessageKind::NearMappingResponse;
    const FIELD_COUNT: u8 = 4;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool {
        put!(writer.write_header(buf, Self::KIND as u8, Self::FIELD_COUNT));

        loop {
            match writer.state() {
                0 => put!(writer.write_u32(buf, self.cache_id)),
                1 => put!(writer.write_u32(buf, self.partition)),
                2 => put!(writer.write_u64(buf, self.future_id)),
                3 => put!(writer.write_blob(buf, &self.mapping)),
                _ => return true,
            }
            writer.increment_state();
        }
    }

    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError> {
        loop {
            match reader.state() {
                0 => self.cache_id = field!(reader.read_u32(buf)),
                1 => self.partition = field!(reader.read_u32(buf)),
                2 => self.future_id = field!(reader.read_u64(buf)),
                3 => self.mapping = field!(reader.read_blob(buf, "mapping"))?,
                _ => return Ok(true),
            }
            reader.increment_state();
        }
    }
}

// ============================================================================
// Backup near response
// ============================================================================

/// Direct notification to the near node from a backup (or from the primary when a
/// backup failed).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupNearResponse {
    pub cache_id: u32,
    pub partition: u32,
    /// Near future id.
    pub future_id: FutureId,
    /// Primary that coordinated the fan-out.
    pub primary_id: NodeId,
    /// Every backup of the fan-out.
    pub mapping: Vec<NodeId>,
    /// Backup that failed, when the primary reports a failure.
    pub failed_node: Option<NodeId>,
    pub flags: NearResponseFlags,
}

impl BackupNearResponse {
    /// Success flag of the primary's result, if carried.
    pub fn result(&self) -> Option<bool> {
        self.flags
            .contains(NearResponseFlags::HAS_RESULT)
            .then(|| self.flags.contains(NearResponseFlags::RESULT_SUCCESS))
    }

    pub fn set_result(&mut self, success: bool) {
        self.flags.insert(NearResponseFlags::HAS_RESULT);
        self.flags.set(NearResponseFlags::RESULT_SUCCESS, success);
    }
}

impl WireMessage for BackupNearResponse {
    const KIND: MessageKind = MessageKind::BackupNearResponse;
    const FIELD_COUNT: u8 = 7;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool {
        put!(writer.write_header(buf, Self::KIND as u8, Self::FIELD_COUNT));

        loop {
            match writer.state() {
                0 => put!(writer.write_u32(buf, self.cache_id)),
                1 => put!(writer.write_u32(buf, self.partition)),
                2 => put!(writer.write_u64(buf, self.future_id)),
                3 => put!(writer.write_u64(buf, self.primary_id.0)),
                4 => put!(writer.write_blob(buf, &self.mapping)),
                5 => put!(writer.write_blob(buf, &self.failed_node)),
                6 => put!(writer.write_u8(buf, self.flags.bits())),
                _ => return true,
            }
            writer.increment_state();
        }
    }

    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError> {
        loop {
            match reader.state() {
                0 => self.cache_id = field!(reader.read_u32(buf)),
                1 => self.partition = field!(reader.read_u32(buf)),
                2 => self.future_id = field!(reader.read_u64(buf)),
                3 => self.primary_id = NodeId(field!(reader.read_u64(buf))),
                4 => self.mapping = field!(reader.read_blob(buf, "mapping"))?,
                5 => self.failed_node = field!(reader.read_blob(buf, "failed_node"))?,
                6 => {
                    self.flags = NearResponseFlags::from_bits_truncate(field!(reader.read_u8(buf)))
                }
                _ => return Ok(true),
            }
            reader.increment_state();
        }
    }
}

// ============================================================================
// Check update request
// ============================================================================

/// Probe sent by the near node to the primary when every awaited backup failed
/// before any result arrived.
#[derive(Debug, Clone, Default)]
pub struct CheckUpdateRequest {
    pub cache_id: u32,
    pub partition: u32,
    /// Near future id.
    pub future_id: FutureId,
    /// Request being confirmed. Local only, never encoded.
    pub update_request: Option<Arc<NearUpdateRequest>>,
}

impl CheckUpdateRequest {
    pub fn new(request: Arc<NearUpdateRequest>) -> Self {
        Self {
            cache_id: request.cache_id,
            partition: request.partition,
            future_id: request.future_id,
            update_request: Some(request),
        }
    }
}

impl PartialEq for CheckUpdateRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cache_id == other.cache_id
            && self.partition == other.partition
            && self.future_id == other.future_id
    }
}

impl Eq for CheckUpdateRequest {}

impl WireMessage for CheckUpdateRequest {
    const KIND: MessageKind = MessageKind::CheckUpdateRequest;
    const FIELD_COUNT: u8 = 3;

    fn write_to<B: BufMut>(&self, buf: &mut B, writer: &mut MessageWriter) -> bool {
        put!(writer.write_header(buf, Self::KIND as u8, Self::FIELD_COUNT));

        loop {
            match writer.state() {
                0 => put!(writer.write_u32(buf, self.cache_id)),
                1 => put!(writer.write_u32(buf, self.partition)),
                2 => put!(writer.write_u64(buf, self.future_id)),
                _ => return true,
            }
            writer.increment_state();
        }
    }

    fn read_from<B: Buf>(
        &mut self,
        buf: &mut B,
        reader: &mut MessageReader,
    ) -> Result<bool, WireError> {
        loop {
            match reader.state() {
                0 => self.cache_id = field!(reader.read_u32(buf)),
                1 => self.partition = field!(reader.read_u32(buf)),
                2 => self.future_id = field!(reader.read_u64(buf)),
                _ => return Ok(true),
            }
            reader.increment_state();
        }
    }
}
